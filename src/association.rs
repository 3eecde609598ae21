// src/association.rs

//! Tests linking factor scores to sample covariates.
//!
//! Continuous covariates get a Pearson correlation with a two-sided Student t test
//! (`n - 2` degrees of freedom). Categorical covariates get a one-way ANOVA F test
//! across their levels. Samples lacking the covariate value are skipped for that
//! covariate only.

use crate::data::{CovariateTable, CovariateValues};
use crate::error::{GfaError, Result};
use crate::model::TrainedModel;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use std::collections::BTreeMap;

/// Fewest usable samples for which a test is attempted.
const MIN_TEST_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovariateKind {
    /// Statistic is the Pearson correlation coefficient.
    Continuous,
    /// Statistic is the ANOVA F value.
    Categorical,
}

/// Result of a single factor-covariate test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    /// NaN when the test could not be performed.
    pub statistic: f64,
    pub p_value: f64,
    pub num_samples: usize,
}

impl TestResult {
    fn untestable(num_samples: usize) -> Self {
        Self {
            statistic: f64::NAN,
            p_value: 1.0,
            num_samples,
        }
    }
}

/// Pearson correlation of two equally long series, skipping pairs with a non-finite value.
pub fn pearson_test(x: &[f64], y: &[f64]) -> TestResult {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y.iter())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .collect();
    let n = pairs.len();
    if n < MIN_TEST_SAMPLES {
        return TestResult::untestable(n);
    }
    let n_f = n as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n_f;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n_f;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for &(a, b) in &pairs {
        sxy += (a - mean_x) * (b - mean_y);
        sxx += (a - mean_x).powi(2);
        syy += (b - mean_y).powi(2);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return TestResult::untestable(n);
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    let df = n_f - 2.0;
    let p_value = if r.abs() >= 1.0 {
        0.0
    } else {
        let t = r * (df / (1.0 - r * r)).sqrt();
        match StudentsT::new(0.0, 1.0, df) {
            Ok(dist) => (2.0 * dist.sf(t.abs())).min(1.0),
            Err(_) => 1.0,
        }
    };
    TestResult {
        statistic: r,
        p_value,
        num_samples: n,
    }
}

/// One-way ANOVA of `values` across `labels`. Entries with a missing label or a
/// non-finite value are skipped.
pub fn anova_test(values: &[f64], labels: &[Option<String>]) -> TestResult {
    let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for (value, label) in values.iter().zip(labels.iter()) {
        if let Some(label) = label {
            if value.is_finite() {
                groups.entry(label.as_str()).or_default().push(*value);
            }
        }
    }
    let n: usize = groups.values().map(Vec::len).sum();
    let k = groups.len();
    if n < MIN_TEST_SAMPLES || k < 2 || n <= k {
        return TestResult::untestable(n);
    }
    let grand_mean = groups.values().flatten().sum::<f64>() / n as f64;
    let mut between = 0.0;
    let mut within = 0.0;
    for members in groups.values() {
        let mean = members.iter().sum::<f64>() / members.len() as f64;
        between += members.len() as f64 * (mean - grand_mean).powi(2);
        within += members.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    }
    let df_between = (k - 1) as f64;
    let df_within = (n - k) as f64;
    if within <= 0.0 {
        if between > 0.0 {
            return TestResult {
                statistic: f64::INFINITY,
                p_value: 0.0,
                num_samples: n,
            };
        }
        return TestResult::untestable(n);
    }
    let f_stat = (between / df_between) / (within / df_within);
    let p_value = match FisherSnedecor::new(df_between, df_within) {
        Ok(dist) => dist.sf(f_stat).clamp(0.0, 1.0),
        Err(_) => 1.0,
    };
    TestResult {
        statistic: f_stat,
        p_value,
        num_samples: n,
    }
}

/// Benjamini-Hochberg adjusted p-values, returned in input order.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| {
        p_values[a]
            .partial_cmp(&p_values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut adjusted = vec![1.0; m];
    let mut running_min = 1.0_f64;
    for (rank, &i) in order.iter().enumerate().rev() {
        let candidate = p_values[i] * m as f64 / (rank + 1) as f64;
        running_min = running_min.min(candidate);
        adjusted[i] = running_min.clamp(0.0, 1.0);
    }
    adjusted
}

/// -log10(p), finite even for p == 0.
pub fn neg_log10(p_value: f64) -> f64 {
    -p_value.clamp(f64::MIN_POSITIVE, 1.0).log10()
}

/// Factor × covariate association results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationTable {
    factor_names: Vec<String>,
    covariate_names: Vec<String>,
    kinds: Vec<CovariateKind>,
    /// Shape: (num_factors, num_covariates)
    statistics: Array2<f64>,
    p_values: Array2<f64>,
    num_samples: Array2<usize>,
    adjusted_p_values: Option<Array2<f64>>,
}

/// One cell of an [`AssociationTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationEntry {
    pub factor: String,
    pub covariate: String,
    pub kind: CovariateKind,
    pub statistic: f64,
    pub p_value: f64,
    pub adjusted_p_value: Option<f64>,
    pub num_samples: usize,
}

impl AssociationTable {
    pub fn factor_names(&self) -> &[String] {
        &self.factor_names
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn kinds(&self) -> &[CovariateKind] {
        &self.kinds
    }

    /// Pearson r for continuous covariates, F for categorical ones.
    pub fn statistics(&self) -> ArrayView2<'_, f64> {
        self.statistics.view()
    }

    pub fn p_values(&self) -> ArrayView2<'_, f64> {
        self.p_values.view()
    }

    pub fn adjusted_p_values(&self) -> Option<ArrayView2<'_, f64>> {
        self.adjusted_p_values.as_ref().map(|a| a.view())
    }

    pub fn neg_log10_p_values(&self) -> Array2<f64> {
        self.p_values.mapv(neg_log10)
    }

    pub fn neg_log10_adjusted_p_values(&self) -> Option<Array2<f64>> {
        self.adjusted_p_values.as_ref().map(|a| a.mapv(neg_log10))
    }

    /// Adds Benjamini-Hochberg adjusted p-values computed over the whole table.
    pub fn with_benjamini_hochberg(mut self) -> Self {
        let flat: Vec<f64> = self.p_values.iter().copied().collect();
        let adjusted = benjamini_hochberg(&flat);
        self.adjusted_p_values = Array2::from_shape_vec(self.p_values.raw_dim(), adjusted).ok();
        self
    }

    pub fn get(&self, factor: usize, covariate: &str) -> Result<AssociationEntry> {
        if factor >= self.factor_names.len() {
            return Err(GfaError::FactorOutOfRange {
                index: factor,
                num_factors: self.factor_names.len(),
            });
        }
        let c = self
            .covariate_names
            .iter()
            .position(|name| name == covariate)
            .ok_or_else(|| {
                GfaError::InvalidInput(format!("No covariate named '{}' was tested.", covariate))
            })?;
        Ok(AssociationEntry {
            factor: self.factor_names[factor].clone(),
            covariate: self.covariate_names[c].clone(),
            kind: self.kinds[c],
            statistic: self.statistics[[factor, c]],
            p_value: self.p_values[[factor, c]],
            adjusted_p_value: self.adjusted_p_values.as_ref().map(|a| a[[factor, c]]),
            num_samples: self.num_samples[[factor, c]],
        })
    }

    /// All cells, factor-major.
    pub fn entries(&self) -> Vec<AssociationEntry> {
        let mut out = Vec::with_capacity(self.statistics.len());
        for (k, factor) in self.factor_names.iter().enumerate() {
            for (c, covariate) in self.covariate_names.iter().enumerate() {
                out.push(AssociationEntry {
                    factor: factor.clone(),
                    covariate: covariate.clone(),
                    kind: self.kinds[c],
                    statistic: self.statistics[[k, c]],
                    p_value: self.p_values[[k, c]],
                    adjusted_p_value: self.adjusted_p_values.as_ref().map(|a| a[[k, c]]),
                    num_samples: self.num_samples[[k, c]],
                });
            }
        }
        out
    }
}

/// Tests every factor of `model` against every covariate in `covariates`.
pub fn associate(model: &TrainedModel, covariates: &CovariateTable) -> Result<AssociationTable> {
    associate_scores(
        model.factor_scores(),
        model.sample_ids(),
        model.factor_names(),
        covariates,
    )
}

/// Same as [`associate`] for a bare score matrix (samples × factors).
///
/// # Errors
/// `DimensionMismatch` if ids and names do not match the score matrix, `UnknownSample`
/// if a scored sample is absent from the covariate table.
pub fn associate_scores(
    scores: ArrayView2<f64>,
    sample_ids: &[String],
    factor_names: &[String],
    covariates: &CovariateTable,
) -> Result<AssociationTable> {
    let (num_samples, num_factors) = scores.dim();
    if sample_ids.len() != num_samples || factor_names.len() != num_factors {
        return Err(GfaError::dimension_mismatch(
            "factor scores",
            format!(
                "{} x {} scores with {} sample ids and {} factor names",
                num_samples,
                num_factors,
                sample_ids.len(),
                factor_names.len()
            ),
        ));
    }
    let rows = sample_ids
        .iter()
        .map(|id| {
            covariates
                .position(id)
                .ok_or_else(|| GfaError::UnknownSample(id.clone()))
        })
        .collect::<Result<Vec<usize>>>()?;

    let columns = covariates.columns();
    if columns.is_empty() {
        warn!("Covariate table has no columns; the association table is empty.");
    }
    let mut statistics = Array2::<f64>::from_elem((num_factors, columns.len()), f64::NAN);
    let mut p_values = Array2::<f64>::ones((num_factors, columns.len()));
    let mut counts = Array2::<usize>::zeros((num_factors, columns.len()));
    let mut kinds = Vec::with_capacity(columns.len());

    for (c, covariate) in columns.iter().enumerate() {
        let kind = match &covariate.values {
            CovariateValues::Continuous(values) => {
                let aligned: Vec<f64> = rows.iter().map(|&r| values[r]).collect();
                for k in 0..num_factors {
                    let factor: Vec<f64> = scores.column(k).to_vec();
                    let result = pearson_test(&factor, &aligned);
                    statistics[[k, c]] = result.statistic;
                    p_values[[k, c]] = result.p_value;
                    counts[[k, c]] = result.num_samples;
                }
                CovariateKind::Continuous
            }
            CovariateValues::Categorical(labels) => {
                let aligned: Vec<Option<String>> = rows.iter().map(|&r| labels[r].clone()).collect();
                for k in 0..num_factors {
                    let factor: Vec<f64> = scores.column(k).to_vec();
                    let result = anova_test(&factor, &aligned);
                    statistics[[k, c]] = result.statistic;
                    p_values[[k, c]] = result.p_value;
                    counts[[k, c]] = result.num_samples;
                }
                CovariateKind::Categorical
            }
        };
        debug!(
            "Covariate '{}' ({:?}): smallest p-value {:.3e}",
            covariate.name,
            kind,
            p_values
                .column(c)
                .iter()
                .fold(1.0_f64, |acc, &p| acc.min(p))
        );
        kinds.push(kind);
    }
    info!(
        "Tested {} factors against {} covariates.",
        num_factors,
        columns.len()
    );

    Ok(AssociationTable {
        factor_names: factor_names.to_vec(),
        covariate_names: columns.iter().map(|c| c.name.clone()).collect(),
        kinds,
        statistics,
        p_values,
        num_samples: counts,
        adjusted_p_values: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn pearson_on_perfect_line() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 4.0, 6.0, 8.0, 10.0];
        let res = pearson_test(&x, &y);
        assert_abs_diff_eq!(res.statistic, 1.0, epsilon = 1e-12);
        assert_eq!(res.p_value, 0.0);
        assert_eq!(res.num_samples, 5);
    }

    #[test]
    fn pearson_matches_reference_value() {
        // r = 0.8, n = 5 -> t = 2.3094, two-sided p = 0.1041
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 3.0, 2.0, 5.0, 4.0];
        let res = pearson_test(&x, &y);
        assert_abs_diff_eq!(res.statistic, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(res.p_value, 0.1041, epsilon = 1e-3);
    }

    #[test]
    fn pearson_skips_missing_and_handles_tiny_samples() {
        let res = pearson_test(&[1.0, f64::NAN, 2.0], &[1.0, 5.0, 2.0]);
        assert!(res.statistic.is_nan());
        assert_eq!(res.p_value, 1.0);
        assert_eq!(res.num_samples, 2);
    }

    #[test]
    fn anova_separated_groups() {
        let values = [1.0, 1.1, 0.9, 5.0, 5.1, 4.9];
        let labels: Vec<Option<String>> = ["WT", "WT", "WT", "5xFAD", "5xFAD", "5xFAD"]
            .iter()
            .map(|s| Some(s.to_string()))
            .collect();
        let res = anova_test(&values, &labels);
        assert!(res.statistic > 100.0);
        assert!(res.p_value < 1e-4);
    }

    #[test]
    fn anova_single_group_is_untestable() {
        let labels = vec![Some("F".to_string()), Some("F".to_string()), None, Some("F".to_string())];
        let res = anova_test(&[1.0, 2.0, 3.0, 4.0], &labels);
        assert!(res.statistic.is_nan());
        assert_eq!(res.p_value, 1.0);
        assert_eq!(res.num_samples, 3);
    }

    #[test]
    fn bh_adjustment_is_monotone_and_bounded() {
        let adjusted = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.5]);
        assert_abs_diff_eq!(adjusted[0], 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(adjusted[1], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(adjusted[2], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(adjusted[3], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn neg_log10_is_finite_at_zero() {
        assert!(neg_log10(0.0).is_finite());
        assert_abs_diff_eq!(neg_log10(0.01), 2.0, epsilon = 1e-12);
        assert_eq!(neg_log10(1.0), 0.0);
    }

    #[test]
    fn table_from_scores() {
        let scores = array![[1.0, 0.3], [2.0, -0.1], [3.0, 0.2], [4.0, 0.0], [5.0, 0.1]];
        let ids: Vec<String> = (0..5).map(|i| format!("m{}", i)).collect();
        let covariates = CovariateTable::new(ids.clone())
            .unwrap()
            .with_continuous("age", vec![2.0, 4.0, 6.0, 8.0, f64::NAN])
            .unwrap()
            .with_categorical(
                "sex",
                vec![Some("F".into()), Some("M".into()), Some("F".into()), Some("M".into()), None],
            )
            .unwrap();
        let table = associate_scores(
            scores.view(),
            &ids,
            &["Factor1".to_string(), "Factor2".to_string()],
            &covariates,
        )
        .unwrap()
        .with_benjamini_hochberg();

        let age = table.get(0, "age").unwrap();
        assert_eq!(age.kind, CovariateKind::Continuous);
        assert_eq!(age.num_samples, 4);
        assert_abs_diff_eq!(age.statistic, 1.0, epsilon = 1e-12);
        assert!(age.adjusted_p_value.is_some());

        let sex = table.get(1, "sex").unwrap();
        assert_eq!(sex.kind, CovariateKind::Categorical);
        assert_eq!(sex.num_samples, 4);
        assert!(table.neg_log10_p_values().iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(table.get(0, "diet").is_err());
        assert_eq!(table.entries().len(), 4);
    }

    #[test]
    fn unknown_sample_is_reported() {
        let scores = array![[1.0], [2.0]];
        let ids = vec!["a".to_string(), "b".to_string()];
        let covariates = CovariateTable::new(vec!["a".into()]).unwrap();
        let res = associate_scores(scores.view(), &ids, &["Factor1".to_string()], &covariates);
        assert!(matches!(res, Err(GfaError::UnknownSample(id)) if id == "b"));
    }
}
