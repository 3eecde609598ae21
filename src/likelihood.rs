// src/likelihood.rs

//! Observation models for individual views.
//!
//! Gaussian views are handled exactly. Bernoulli and Poisson views are mapped onto
//! a Gaussian problem through a local quadratic upper bound on the negative
//! log-likelihood: each sweep replaces the raw observations with pseudo-data
//! centered on the current linear predictor `zeta = E[Z] E[W]^T`, and the noise
//! precision is pinned to the bound's curvature `kappa`.

use crate::error::{GfaError, Result};
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Curvature of the logistic bound (max of sigma'(x)).
const BERNOULLI_KAPPA: f64 = 0.25;
/// Slope of the Poisson curvature bound in the largest count of a feature.
const POISSON_KAPPA_SLOPE: f64 = 0.17;
/// Offset keeping the softplus rate away from zero.
const POISSON_RATE_OFFSET: f64 = 1e-4;

/// Noise model attached to a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Likelihood {
    /// Continuous measurements with per-feature Gaussian noise.
    #[default]
    Gaussian,
    /// Binary measurements coded 0/1.
    Bernoulli,
    /// Non-negative counts.
    Poisson,
}

impl Likelihood {
    pub fn is_gaussian(&self) -> bool {
        matches!(self, Likelihood::Gaussian)
    }

    /// Checks that every observed value is admissible for this noise model.
    ///
    /// `data` may be in either orientation; NaN entries are treated as missing.
    pub fn validate(&self, view: &str, data: ArrayView2<f64>) -> Result<()> {
        for &value in data.iter() {
            if value.is_nan() {
                continue;
            }
            if !value.is_finite() {
                return Err(GfaError::InvalidInput(format!(
                    "View '{}' contains an infinite value.",
                    view
                )));
            }
            let admissible = match self {
                Likelihood::Gaussian => true,
                Likelihood::Bernoulli => value == 0.0 || value == 1.0,
                Likelihood::Poisson => value >= 0.0,
            };
            if !admissible {
                return Err(GfaError::InvalidInput(format!(
                    "View '{}' uses the {} likelihood but contains the value {}.",
                    view, self, value
                )));
            }
        }
        Ok(())
    }

    /// Fixed noise precision used for a non-Gaussian feature.
    ///
    /// Returns `None` for Gaussian views, whose precision is learned.
    pub(crate) fn bound_precision(&self, observations: ArrayView1<f64>) -> Option<f64> {
        match self {
            Likelihood::Gaussian => None,
            Likelihood::Bernoulli => Some(BERNOULLI_KAPPA),
            Likelihood::Poisson => {
                let max_count = observations
                    .iter()
                    .filter(|v| !v.is_nan())
                    .fold(0.0_f64, |acc, &v| acc.max(v));
                Some(BERNOULLI_KAPPA + POISSON_KAPPA_SLOPE * max_count)
            }
        }
    }

    /// Gaussian pseudo-observation for one raw value given the current linear predictor.
    pub(crate) fn pseudo_observation(&self, y: f64, zeta: f64, kappa: f64) -> f64 {
        match self {
            Likelihood::Gaussian => y,
            Likelihood::Bernoulli => zeta - (sigmoid(zeta) - y) / kappa,
            Likelihood::Poisson => {
                let rate = softplus(zeta) + POISSON_RATE_OFFSET;
                zeta - sigmoid(zeta) * (1.0 - y / rate) / kappa
            }
        }
    }
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Likelihood::Gaussian => "gaussian",
            Likelihood::Bernoulli => "bernoulli",
            Likelihood::Poisson => "poisson",
        };
        f.write_str(name)
    }
}

impl FromStr for Likelihood {
    type Err = GfaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gaussian" | "normal" => Ok(Likelihood::Gaussian),
            "bernoulli" | "binary" => Ok(Likelihood::Bernoulli),
            "poisson" | "count" | "counts" => Ok(Likelihood::Poisson),
            other => Err(GfaError::InvalidInput(format!(
                "Unknown likelihood '{}'. Expected gaussian, bernoulli or poisson.",
                other
            ))),
        }
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// log(1 + exp(x)) without overflow.
pub(crate) fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}
