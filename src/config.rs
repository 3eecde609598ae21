// src/config.rs

//! # Training configuration
//!
//! [`FactorModelConfig`] collects every option of a fit. It can be built in code from its
//! `Default`, or read from TOML with [`FactorModelConfig::from_toml_str`] and
//! [`FactorModelConfig::from_toml_file`]. A copy is stored in every trained model.

use crate::error::{GfaError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How the factor means are seeded before the first sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorInitialization {
    /// Independent standard-normal draws from the seeded RNG.
    #[default]
    Random,
    /// Leading left singular vectors of the concatenated, zero-filled views.
    Pca,
}

/// Training options for the factor model engine.
///
/// Every field has a default, so a TOML file only needs to list what it changes:
///
/// ```toml
/// num_factors = 15
/// seed = 2025
/// scale_views = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorModelConfig {
    /// Number of latent factors (F). Fixed for the lifetime of the trained model.
    pub num_factors: usize,
    /// Upper bound on variational sweeps.
    pub max_iterations: usize,
    /// Sweeps performed before the convergence test is consulted.
    pub min_iterations: usize,
    /// Training stops once |delta ELBO| / |ELBO| drops below this value.
    pub convergence_tolerance: f64,
    /// Relative ELBO decrease tolerated before a Gaussian-only fit is declared divergent.
    pub divergence_tolerance: f64,
    /// Fail with `ConvergenceFailure` when `max_iterations` is exhausted.
    pub require_convergence: bool,
    /// Seed for initialization. `None` draws a fresh seed from the OS.
    pub seed: Option<u64>,
    pub initialization: FactorInitialization,
    /// Center each feature of Gaussian views on its observed mean.
    pub center_features: bool,
    /// Rescale each Gaussian view to unit total variance so large views do not dominate.
    pub scale_views: bool,
    /// Gamma shape of the ARD prior on loading precisions.
    pub ard_prior_shape: f64,
    /// Gamma rate of the ARD prior on loading precisions.
    pub ard_prior_rate: f64,
    /// Gamma shape of the noise precision prior.
    pub noise_prior_shape: f64,
    /// Gamma rate of the noise precision prior.
    pub noise_prior_rate: f64,
    /// Eigenvalue floor applied when inverting F × F precision matrices.
    pub eigenvalue_floor: f64,
    /// Drop factors whose largest per-view variance explained (fraction) falls below this
    /// value during training. `None` keeps all `num_factors`.
    pub drop_factor_threshold: Option<f64>,
}

impl Default for FactorModelConfig {
    fn default() -> Self {
        FactorModelConfig {
            num_factors: 15,
            max_iterations: 1000,
            min_iterations: 2,
            convergence_tolerance: 5e-6,
            divergence_tolerance: 1e-5,
            require_convergence: true,
            seed: None,
            initialization: FactorInitialization::Random,
            center_features: true,
            scale_views: false,
            ard_prior_shape: 1e-3,
            ard_prior_rate: 1e-3,
            noise_prior_shape: 1e-3,
            noise_prior_rate: 1e-3,
            eigenvalue_floor: 1e-8,
            drop_factor_threshold: None,
        }
    }
}

impl FactorModelConfig {
    pub fn with_num_factors(mut self, num_factors: usize) -> Self {
        self.num_factors = num_factors;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Parses a TOML document; missing keys take their default values.
    ///
    /// # Errors
    /// `Config` for malformed TOML or unknown value types, `InvalidInput` if the parsed
    /// options fail [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FactorModelConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, otherwise as [`from_toml_str`](Self::from_toml_str).
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Checks option ranges. Factor-count feasibility depends on the data and is
    /// checked by the engine.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(GfaError::InvalidInput("max_iterations must be at least 1.".into()));
        }
        if self.min_iterations > self.max_iterations {
            return Err(GfaError::InvalidInput(format!(
                "min_iterations ({}) exceeds max_iterations ({}).",
                self.min_iterations, self.max_iterations
            )));
        }
        let positive = [
            ("convergence_tolerance", self.convergence_tolerance),
            ("divergence_tolerance", self.divergence_tolerance),
            ("ard_prior_shape", self.ard_prior_shape),
            ("ard_prior_rate", self.ard_prior_rate),
            ("noise_prior_shape", self.noise_prior_shape),
            ("noise_prior_rate", self.noise_prior_rate),
            ("eigenvalue_floor", self.eigenvalue_floor),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(GfaError::InvalidInput(format!(
                    "{} must be a positive finite number, got {}.",
                    name, value
                )));
            }
        }
        if let Some(threshold) = self.drop_factor_threshold {
            if !(threshold > 0.0 && threshold < 1.0) {
                return Err(GfaError::InvalidInput(format!(
                    "drop_factor_threshold must lie in (0, 1), got {}.",
                    threshold
                )));
            }
        }
        Ok(())
    }
}
