// src/data.rs

//! # Multi-view data assembly
//!
//! Views arrive as feature-by-sample matrices, each with its own feature count and
//! its own subset of samples. This module validates them and aligns every view on a
//! single sample axis so the factor engine can treat sample `n` identically in all
//! views. Samples that a view never measured become columns of NaN in that view;
//! they are excluded from that view's loss term rather than imputed.
//!
//! Sample ordering follows the order of first appearance across views, in the order
//! the views were supplied. The optional covariate table must cover every sample.

use crate::error::{GfaError, Result};
use crate::likelihood::Likelihood;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use std::collections::{HashMap, HashSet};

/// One omics matrix as supplied by the caller (features × samples).
#[derive(Debug, Clone)]
pub struct View {
    name: String,
    feature_ids: Vec<String>,
    sample_ids: Vec<String>,
    /// Shape: (num_features, num_samples). NaN marks a missing measurement.
    data: Array2<f64>,
    likelihood: Likelihood,
}

impl View {
    /// Builds a view after checking that the matrix shape matches the identifiers.
    ///
    /// # Errors
    /// `DimensionMismatch` when the matrix does not have one row per feature id and
    /// one column per sample id, `InvalidInput` for an empty name, duplicate ids, or
    /// values the likelihood cannot model.
    pub fn new(
        name: impl Into<String>,
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
        data: Array2<f64>,
        likelihood: Likelihood,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(GfaError::InvalidInput("View names must not be empty.".into()));
        }
        if data.nrows() != feature_ids.len() {
            return Err(GfaError::dimension_mismatch(
                &name,
                format!(
                    "matrix has {} rows but {} feature ids were given",
                    data.nrows(),
                    feature_ids.len()
                ),
            ));
        }
        if data.ncols() != sample_ids.len() {
            return Err(GfaError::dimension_mismatch(
                &name,
                format!(
                    "matrix has {} columns but {} sample ids were given",
                    data.ncols(),
                    sample_ids.len()
                ),
            ));
        }
        if let Some(dup) = first_duplicate(&feature_ids) {
            return Err(GfaError::InvalidInput(format!(
                "View '{}' lists feature '{}' more than once.",
                name, dup
            )));
        }
        if let Some(dup) = first_duplicate(&sample_ids) {
            return Err(GfaError::InvalidInput(format!(
                "View '{}' lists sample '{}' more than once.",
                name, dup
            )));
        }
        likelihood.validate(&name, data.view())?;

        Ok(Self {
            name,
            feature_ids,
            sample_ids,
            data,
            likelihood,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// The raw matrix, features × samples.
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn likelihood(&self) -> Likelihood {
        self.likelihood
    }

    pub fn num_features(&self) -> usize {
        self.feature_ids.len()
    }

    pub fn num_samples(&self) -> usize {
        self.sample_ids.len()
    }
}

/// Values of one covariate, in the sample order of the owning table.
#[derive(Debug, Clone, PartialEq)]
pub enum CovariateValues {
    /// NaN marks a missing value.
    Continuous(Vec<f64>),
    /// `None` marks a missing value.
    Categorical(Vec<Option<String>>),
}

impl CovariateValues {
    pub fn len(&self) -> usize {
        match self {
            CovariateValues::Continuous(v) => v.len(),
            CovariateValues::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Covariate {
    pub name: String,
    pub values: CovariateValues,
}

/// Per-sample side information (sex, age, genotype, diet...), keyed by sample id.
#[derive(Debug, Clone)]
pub struct CovariateTable {
    sample_ids: Vec<String>,
    index: HashMap<String, usize>,
    columns: Vec<Covariate>,
}

impl CovariateTable {
    pub fn new(sample_ids: Vec<String>) -> Result<Self> {
        if let Some(dup) = first_duplicate(&sample_ids) {
            return Err(GfaError::InvalidInput(format!(
                "Covariate table lists sample '{}' more than once.",
                dup
            )));
        }
        let index = sample_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Ok(Self {
            sample_ids,
            index,
            columns: Vec::new(),
        })
    }

    pub fn with_continuous(self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.with_column(name.into(), CovariateValues::Continuous(values))
    }

    pub fn with_categorical(
        self,
        name: impl Into<String>,
        values: Vec<Option<String>>,
    ) -> Result<Self> {
        self.with_column(name.into(), CovariateValues::Categorical(values))
    }

    fn with_column(mut self, name: String, values: CovariateValues) -> Result<Self> {
        if values.len() != self.sample_ids.len() {
            return Err(GfaError::dimension_mismatch(
                format!("covariate:{}", name),
                format!(
                    "{} values given for {} samples",
                    values.len(),
                    self.sample_ids.len()
                ),
            ));
        }
        if self.columns.iter().any(|c| c.name == name) {
            return Err(GfaError::InvalidInput(format!(
                "Covariate '{}' is defined more than once.",
                name
            )));
        }
        self.columns.push(Covariate { name, values });
        Ok(self)
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn columns(&self) -> &[Covariate] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Covariate> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Row of `sample_id` in this table.
    pub fn position(&self, sample_id: &str) -> Option<usize> {
        self.index.get(sample_id).copied()
    }

    pub fn contains_sample(&self, sample_id: &str) -> bool {
        self.index.contains_key(sample_id)
    }
}

/// How the sample axes of the views are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleAlignment {
    /// Keep every sample seen in any view; absent measurements become missing.
    #[default]
    Union,
    /// Keep only samples measured in every view.
    Intersection,
}

/// A view re-indexed onto the dataset's shared sample axis.
#[derive(Debug, Clone)]
pub struct AlignedView {
    name: String,
    feature_ids: Vec<String>,
    likelihood: Likelihood,
    /// Shape: (num_samples, num_features). NaN marks a missing entry.
    data: Array2<f64>,
}

impl AlignedView {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn likelihood(&self) -> Likelihood {
        self.likelihood
    }

    /// Samples × features, rows in dataset sample order.
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn num_features(&self) -> usize {
        self.feature_ids.len()
    }

    pub fn num_observed(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }
}

/// Views aligned on one sample axis, plus optional covariates.
#[derive(Debug, Clone)]
pub struct MultiViewDataset {
    sample_ids: Vec<String>,
    views: Vec<AlignedView>,
    covariates: Option<CovariateTable>,
}

impl MultiViewDataset {
    /// Validates and aligns the views.
    ///
    /// # Errors
    /// - `InvalidInput` if no views are given, two views share a name, or the
    ///   intersection of samples is empty.
    /// - `DimensionMismatch` naming the view that contains a sample missing from the
    ///   covariate table.
    pub fn assemble(
        views: Vec<View>,
        covariates: Option<CovariateTable>,
        alignment: SampleAlignment,
    ) -> Result<Self> {
        if views.is_empty() {
            return Err(GfaError::InvalidInput(
                "At least one view is required to assemble a dataset.".into(),
            ));
        }
        let names: Vec<String> = views.iter().map(|v| v.name.clone()).collect();
        if let Some(dup) = first_duplicate(&names) {
            return Err(GfaError::InvalidInput(format!(
                "Two views are both named '{}'.",
                dup
            )));
        }

        if let Some(table) = covariates.as_ref() {
            for view in &views {
                if let Some(missing) = view.sample_ids.iter().find(|s| !table.contains_sample(s)) {
                    return Err(GfaError::dimension_mismatch(
                        &view.name,
                        format!("sample '{}' is absent from the covariate table", missing),
                    ));
                }
            }
        }

        let sample_ids = match alignment {
            SampleAlignment::Union => {
                let mut seen = HashSet::new();
                let mut ordered = Vec::new();
                for view in &views {
                    for id in &view.sample_ids {
                        if seen.insert(id.as_str()) {
                            ordered.push(id.clone());
                        }
                    }
                }
                ordered
            }
            SampleAlignment::Intersection => {
                let sets: Vec<HashSet<&str>> = views
                    .iter()
                    .map(|v| v.sample_ids.iter().map(String::as_str).collect())
                    .collect();
                views[0]
                    .sample_ids
                    .iter()
                    .filter(|id| sets.iter().all(|set| set.contains(id.as_str())))
                    .cloned()
                    .collect()
            }
        };
        if sample_ids.is_empty() {
            return Err(GfaError::InvalidInput(
                "The views share no samples under the requested alignment.".into(),
            ));
        }

        let position: HashMap<&str, usize> = sample_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let num_samples = sample_ids.len();

        let mut aligned = Vec::with_capacity(views.len());
        for view in views {
            let mut data = Array2::from_elem((num_samples, view.num_features()), f64::NAN);
            let mut kept = 0usize;
            for (col, id) in view.sample_ids.iter().enumerate() {
                if let Some(&row) = position.get(id.as_str()) {
                    data.row_mut(row).assign(&view.data.column(col));
                    kept += 1;
                }
            }
            let dropped = view.num_samples() - kept;
            if dropped > 0 {
                debug!(
                    "View '{}': {} samples outside the aligned sample axis were dropped.",
                    view.name, dropped
                );
            }
            if kept < num_samples {
                debug!(
                    "View '{}' covers {}/{} samples; the rest are treated as missing.",
                    view.name, kept, num_samples
                );
            }
            aligned.push(AlignedView {
                name: view.name,
                feature_ids: view.feature_ids,
                likelihood: view.likelihood,
                data,
            });
        }

        for view in &aligned {
            if view.num_observed() == 0 {
                warn!("View '{}' has no observed entries after alignment.", view.name);
            }
        }

        info!(
            "Assembled dataset: {} samples across {} views ({}).",
            num_samples,
            aligned.len(),
            aligned
                .iter()
                .map(|v| format!("{}: {} features", v.name, v.num_features()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            sample_ids,
            views: aligned,
            covariates,
        })
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn num_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    pub fn views(&self) -> &[AlignedView] {
        &self.views
    }

    pub fn view_names(&self) -> Vec<&str> {
        self.views.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn view(&self, name: &str) -> Result<&AlignedView> {
        self.views
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| GfaError::UnknownView(name.to_string()))
    }

    pub fn total_features(&self) -> usize {
        self.views.iter().map(AlignedView::num_features).sum()
    }

    pub fn covariates(&self) -> Option<&CovariateTable> {
        self.covariates.as_ref()
    }

    /// Fraction of non-missing entries in a view, over the aligned sample axis.
    pub fn observed_fraction(&self, name: &str) -> Result<f64> {
        let view = self.view(name)?;
        let total = view.data.len();
        if total == 0 {
            return Ok(0.0);
        }
        Ok(view.num_observed() as f64 / total as f64)
    }
}

fn first_duplicate(ids: &[String]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().find(|id| !seen.insert(id.as_str())).map(String::as_str)
}
