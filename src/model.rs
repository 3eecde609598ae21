// src/model.rs

//! # Trained model
//!
//! [`TrainedModel`] holds the outcome of a fit: shared factor scores, per-view loadings and
//! noise estimates, the variance-explained table, the configuration used and training
//! statistics. Views are addressed by name, factors by zero-based index and samples by id.
//! Models are saved and loaded with bincode.

use crate::config::FactorModelConfig;
use crate::error::{GfaError, Result};
use crate::likelihood::Likelihood;
use crate::variance::VarianceExplained;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Loadings and noise estimates of one view.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ViewLoadings {
    pub(crate) name: String,
    pub(crate) feature_ids: Vec<String>,
    pub(crate) likelihood: Likelihood,
    /// Posterior mean loadings. Shape: (num_features, num_factors)
    pub(crate) loadings: Array2<f64>,
    /// Expected noise precision per feature (fixed bound curvature for non-Gaussian views).
    /// Shape: (num_features)
    pub(crate) feature_precision: Array1<f64>,
    /// Offsets removed before fitting. Zero for non-Gaussian views.
    /// Shape: (num_features)
    pub(crate) feature_means: Array1<f64>,
    /// Divisor applied to the whole view before fitting (1.0 when views are not scaled).
    pub(crate) view_scale: f64,
}

impl ViewLoadings {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn likelihood(&self) -> Likelihood {
        self.likelihood
    }

    pub fn loadings(&self) -> ArrayView2<'_, f64> {
        self.loadings.view()
    }

    pub fn feature_precision(&self) -> ArrayView1<'_, f64> {
        self.feature_precision.view()
    }

    pub fn feature_means(&self) -> ArrayView1<'_, f64> {
        self.feature_means.view()
    }

    pub fn view_scale(&self) -> f64 {
        self.view_scale
    }

    /// Mean residual noise variance of the view, in the units the model was fit in.
    pub fn noise_variance(&self) -> f64 {
        if self.feature_precision.is_empty() {
            return 0.0;
        }
        self.feature_precision
            .iter()
            .map(|&tau| if tau > 0.0 { 1.0 / tau } else { f64::INFINITY })
            .sum::<f64>()
            / self.feature_precision.len() as f64
    }

    fn feature_index(&self, feature: &str) -> Result<usize> {
        self.feature_ids
            .iter()
            .position(|f| f == feature)
            .ok_or_else(|| GfaError::UnknownFeature {
                view: self.name.clone(),
                feature: feature.to_string(),
            })
    }
}

/// Summary of the optimization that produced a model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainingStats {
    pub iterations: usize,
    pub converged: bool,
    /// ELBO after every sweep.
    pub elbo_trace: Vec<f64>,
    pub num_factors_requested: usize,
    /// Factors removed by `drop_factor_threshold` during training.
    pub dropped_factors: usize,
    pub elapsed_seconds: f64,
}

impl TrainingStats {
    pub fn final_elbo(&self) -> Option<f64> {
        self.elbo_trace.last().copied()
    }
}

/// A trained multi-view factor model.
///
/// The numeric arrays are fixed once training ends: there are no mutating accessors,
/// and renaming views or factors only touches labels.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrainedModel {
    sample_ids: Vec<String>,
    factor_names: Vec<String>,
    /// Posterior mean factor scores. Shape: (num_samples, num_factors)
    factor_scores: Array2<f64>,
    views: Vec<ViewLoadings>,
    variance_explained: VarianceExplained,
    config: FactorModelConfig,
    stats: TrainingStats,
}

impl TrainedModel {
    pub(crate) fn from_parts(
        sample_ids: Vec<String>,
        factor_scores: Array2<f64>,
        views: Vec<ViewLoadings>,
        variance_explained: VarianceExplained,
        config: FactorModelConfig,
        stats: TrainingStats,
    ) -> Self {
        let factor_names = default_factor_names(factor_scores.ncols());
        let mut model = Self {
            sample_ids,
            factor_names: factor_names.clone(),
            factor_scores,
            views,
            variance_explained,
            config,
            stats,
        };
        model.variance_explained.set_factor_names(factor_names);
        model
    }

    /// Number of factors kept after training.
    pub fn num_factors(&self) -> usize {
        self.factor_scores.ncols()
    }

    /// Number of samples, i.e. rows of the factor score matrix.
    pub fn num_samples(&self) -> usize {
        self.factor_scores.nrows()
    }

    /// Sample ids in score-row order.
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Factor labels, `Factor1`.. unless renamed.
    pub fn factor_names(&self) -> &[String] {
        &self.factor_names
    }

    /// View names in the order the views were assembled.
    pub fn view_names(&self) -> Vec<&str> {
        self.views.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn views(&self) -> &[ViewLoadings] {
        &self.views
    }

    /// The configuration the model was trained with.
    pub fn config(&self) -> &FactorModelConfig {
        &self.config
    }

    /// Iteration count, convergence flag, ELBO trace and dropped factors.
    pub fn training_stats(&self) -> &TrainingStats {
        &self.stats
    }

    /// Posterior mean factor scores.
    ///
    /// Shape: (num_samples, num_factors)
    pub fn factor_scores(&self) -> ArrayView2<'_, f64> {
        self.factor_scores.view()
    }

    /// Scores of one sample across all factors.
    ///
    /// # Errors
    /// `UnknownSample` if `sample_id` was not part of training.
    pub fn factor_scores_for_sample(&self, sample_id: &str) -> Result<ArrayView1<'_, f64>> {
        let row = self
            .sample_ids
            .iter()
            .position(|s| s == sample_id)
            .ok_or_else(|| GfaError::UnknownSample(sample_id.to_string()))?;
        Ok(self.factor_scores.row(row))
    }

    /// Scores of every sample on one factor.
    ///
    /// # Errors
    /// `FactorOutOfRange` if `factor >= num_factors()`.
    pub fn factor_values(&self, factor: usize) -> Result<ArrayView1<'_, f64>> {
        self.check_factor(factor)?;
        Ok(self.factor_scores.column(factor))
    }

    /// Loadings, noise estimates and preprocessing offsets of one view.
    ///
    /// # Errors
    /// `UnknownView` if no view is called `name`.
    pub fn view(&self, name: &str) -> Result<&ViewLoadings> {
        self.views
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| GfaError::UnknownView(name.to_string()))
    }

    /// Posterior mean loadings of a view.
    ///
    /// Shape: (num_features, num_factors)
    ///
    /// # Errors
    /// `UnknownView` if the view does not exist.
    pub fn loadings(&self, view: &str) -> Result<ArrayView2<'_, f64>> {
        Ok(self.view(view)?.loadings.view())
    }

    /// A single loading, looked up by view name, feature id and factor index.
    ///
    /// # Errors
    /// `UnknownView`, `UnknownFeature` or `FactorOutOfRange` for labels the model lacks.
    pub fn loading(&self, view: &str, feature: &str, factor: usize) -> Result<f64> {
        self.check_factor(factor)?;
        let v = self.view(view)?;
        let row = v.feature_index(feature)?;
        Ok(v.loadings[[row, factor]])
    }

    /// Loadings divided by the largest absolute loading of each factor within the view.
    ///
    /// All-zero columns are returned unchanged.
    ///
    /// # Errors
    /// `UnknownView` if the view does not exist.
    pub fn scaled_loadings(&self, view: &str) -> Result<Array2<f64>> {
        let mut scaled = self.view(view)?.loadings.clone();
        for mut column in scaled.axis_iter_mut(Axis(1)) {
            let max_abs = column.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            if max_abs > 0.0 {
                column.mapv_inplace(|v| v / max_abs);
            }
        }
        Ok(scaled)
    }

    /// The `n` features with the largest absolute loading on `factor`, strongest first.
    ///
    /// # Errors
    /// `UnknownView` or `FactorOutOfRange`.
    pub fn top_features(&self, view: &str, factor: usize, n: usize) -> Result<Vec<(String, f64)>> {
        self.check_factor(factor)?;
        let v = self.view(view)?;
        let column = v.loadings.column(factor);
        let mut order: Vec<usize> = (0..column.len()).collect();
        order.sort_by(|&a, &b| {
            column[b]
                .abs()
                .partial_cmp(&column[a].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(order
            .into_iter()
            .take(n)
            .map(|i| (v.feature_ids[i].clone(), column[i]))
            .collect())
    }

    /// Variance explained (percent) per view and factor, plus per-view totals.
    pub fn variance_explained(&self) -> &VarianceExplained {
        &self.variance_explained
    }

    /// Mean residual noise variance of a view, on the scale the view was fitted on.
    ///
    /// # Errors
    /// `UnknownView` if the view does not exist.
    pub fn noise_variance(&self, view: &str) -> Result<f64> {
        Ok(self.view(view)?.noise_variance())
    }

    /// Expected noise precision of every feature of a view.
    ///
    /// # Errors
    /// `UnknownView` if the view does not exist.
    pub fn feature_precisions(&self, view: &str) -> Result<ArrayView1<'_, f64>> {
        Ok(self.view(view)?.feature_precision.view())
    }

    /// Model reconstruction of a view on the original measurement scale.
    ///
    /// Returns samples × features. For Bernoulli and Poisson views the values are the
    /// linear predictor; apply the inverse link to obtain probabilities or rates.
    /// Constant features excluded from training reconstruct to their constant value.
    ///
    /// # Errors
    /// `UnknownView` if the view does not exist.
    pub fn reconstruct(&self, view: &str) -> Result<Array2<f64>> {
        let v = self.view(view)?;
        let mut out = self.factor_scores.dot(&v.loadings.t());
        out.mapv_inplace(|x| x * v.view_scale);
        out += &v.feature_means.view().insert_axis(Axis(0));
        Ok(out)
    }

    /// Pearson correlation between factor score columns. Shape: (num_factors, num_factors)
    pub fn factor_correlation(&self) -> Array2<f64> {
        let k = self.num_factors();
        let n = self.num_samples();
        let mut corr = Array2::<f64>::eye(k);
        if n < 2 {
            return corr;
        }
        let means = self.factor_scores.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(k));
        let centered = &self.factor_scores - &means.view().insert_axis(Axis(0));
        let cov = centered.t().dot(&centered);
        for i in 0..k {
            for j in 0..k {
                if i == j {
                    continue;
                }
                let denom = (cov[[i, i]] * cov[[j, j]]).sqrt();
                corr[[i, j]] = if denom > 0.0 { cov[[i, j]] / denom } else { 0.0 };
            }
        }
        corr
    }

    /// Renames views. Names not in `mapping` are kept.
    ///
    /// # Errors
    /// `UnknownView` if `mapping` refers to a view that does not exist, `InvalidInput`
    /// if two views would end up with the same name.
    pub fn rename_views(&mut self, mapping: &HashMap<String, String>) -> Result<()> {
        for old in mapping.keys() {
            if !self.views.iter().any(|v| &v.name == old) {
                return Err(GfaError::UnknownView(old.clone()));
            }
        }
        let renamed: Vec<String> = self
            .views
            .iter()
            .map(|v| mapping.get(&v.name).cloned().unwrap_or_else(|| v.name.clone()))
            .collect();
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = renamed.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(GfaError::InvalidInput(format!(
                "Renaming would create two views named '{}'.",
                dup
            )));
        }
        for (view, name) in self.views.iter_mut().zip(renamed.iter()) {
            view.name = name.clone();
        }
        self.variance_explained.set_view_names(renamed);
        Ok(())
    }

    /// Replaces all factor labels.
    ///
    /// # Errors
    /// `InvalidInput` if `names` does not hold exactly one label per factor.
    pub fn rename_factors(&mut self, names: Vec<String>) -> Result<()> {
        if names.len() != self.num_factors() {
            return Err(GfaError::InvalidInput(format!(
                "{} factor names given for {} factors.",
                names.len(),
                self.num_factors()
            )));
        }
        self.factor_names = names.clone();
        self.variance_explained.set_factor_names(names);
        Ok(())
    }

    fn check_factor(&self, factor: usize) -> Result<()> {
        if factor >= self.num_factors() {
            return Err(GfaError::FactorOutOfRange {
                index: factor,
                num_factors: self.num_factors(),
            });
        }
        Ok(())
    }

    /// Saves the model with bincode.
    ///
    /// # Errors
    /// `Io` if the file cannot be created, `Serialization` if encoding fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())?;
        Ok(())
    }

    /// Loads a model written by `save_model`.
    ///
    /// # Errors
    /// `Io` if the file cannot be read. `Serialization` if decoding fails, or if array
    /// shapes or view and factor labels are inconsistent with each other.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let model: TrainedModel =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let (n, k) = self.factor_scores.dim();
        if self.sample_ids.len() != n {
            return Err(GfaError::Serialization(format!(
                "model has {} sample ids but {} score rows",
                self.sample_ids.len(),
                n
            )));
        }
        if self.factor_names.len() != k {
            return Err(GfaError::Serialization(format!(
                "model has {} factor names but {} score columns",
                self.factor_names.len(),
                k
            )));
        }
        for v in &self.views {
            let (d, kv) = v.loadings.dim();
            if kv != k
                || v.feature_ids.len() != d
                || v.feature_precision.len() != d
                || v.feature_means.len() != d
            {
                return Err(GfaError::Serialization(format!(
                    "view '{}' has inconsistent array shapes",
                    v.name
                )));
            }
        }
        if self.variance_explained.per_factor().dim() != (self.views.len(), k)
            || self.variance_explained.totals().len() != self.views.len()
        {
            return Err(GfaError::Serialization(
                "variance-explained table does not match the model dimensions".into(),
            ));
        }
        let view_labels_match = self
            .variance_explained
            .view_names()
            .iter()
            .map(String::as_str)
            .eq(self.views.iter().map(|v| v.name.as_str()));
        if !view_labels_match || self.variance_explained.factor_names() != self.factor_names.as_slice() {
            return Err(GfaError::Serialization(
                "variance-explained labels do not match the model's view and factor names".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn default_factor_names(k: usize) -> Vec<String> {
    (1..=k).map(|i| format!("Factor{}", i)).collect()
}
