// Multi-view group factor analysis

#![doc = include_str!("../README.md")]

pub mod association;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod io;
pub mod likelihood;
pub mod linalg_backends;
pub mod model;
pub mod variance;


pub use association::{associate, AssociationEntry, AssociationTable, CovariateKind};
pub use config::{FactorInitialization, FactorModelConfig};
pub use data::{Covariate, CovariateTable, CovariateValues, MultiViewDataset, SampleAlignment, View};
pub use engine::FactorModelEngine;
pub use error::{GfaError, Result};
pub use likelihood::Likelihood;
pub use model::{TrainedModel, TrainingStats, ViewLoadings};
pub use variance::VarianceExplained;
