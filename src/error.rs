// src/error.rs

//! Error type shared by every stage of the factor analysis workflow.
//!
//! Every variant is terminal for the operation that produced it. Nothing in the
//! crate retries on its own; callers are expected to adjust their inputs or
//! configuration and run again.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GfaError>;

#[derive(Error, Debug)]
pub enum GfaError {
    #[error("View '{view}' has inconsistent dimensions: {detail}")]
    DimensionMismatch { view: String, detail: String },

    #[error("Optimization failed to converge after {iterations} iterations: {detail}")]
    ConvergenceFailure { iterations: usize, detail: String },

    #[error("View '{view}' contributes no usable data: {detail}")]
    EmptyView { view: String, detail: String },

    #[error(
        "Requested {requested} factors, but at most {max_feasible} are feasible for this dataset."
    )]
    InvalidFactorCount { requested: usize, max_feasible: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No view named '{0}' exists in this dataset or model.")]
    UnknownView(String),

    #[error("No sample with identifier '{0}' exists in this dataset or model.")]
    UnknownSample(String),

    #[error("View '{view}' has no feature named '{feature}'.")]
    UnknownFeature { view: String, feature: String },

    #[error("Factor index {index} is out of range; the model has {num_factors} factors.")]
    FactorOutOfRange { index: usize, num_factors: usize },

    #[error("Linear algebra backend failure: {0}")]
    Linalg(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error reading or writing a delimited table: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to (de)serialize the trained model: {0}")]
    Serialization(String),

    #[error("Failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl GfaError {
    pub(crate) fn dimension_mismatch(view: impl Into<String>, detail: impl Into<String>) -> Self {
        GfaError::DimensionMismatch {
            view: view.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn empty_view(view: impl Into<String>, detail: impl Into<String>) -> Self {
        GfaError::EmptyView {
            view: view.into(),
            detail: detail.into(),
        }
    }
}

impl From<bincode::error::EncodeError> for GfaError {
    fn from(e: bincode::error::EncodeError) -> Self {
        GfaError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for GfaError {
    fn from(e: bincode::error::DecodeError) -> Self {
        GfaError::Serialization(e.to_string())
    }
}
