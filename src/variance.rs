// src/variance.rs

//! Variance decomposition of a fitted model.
//!
//! For a view with (centered) observations `Y`, factor scores `Z` and loadings `W`,
//! the coefficient of determination of factor `k` is
//!
//! `R2_k = 1 - SS(Y - z_k w_k^T) / SS(Y)`
//!
//! and the joint coefficient is `1 - SS(Y - Z W^T) / SS(Y)`, with sums running over
//! observed entries only. Because factors are not orthogonal the per-factor values
//! can overlap; they are clamped at zero and, when their sum exceeds the joint value,
//! scaled down proportionally so the table always satisfies
//! `0 <= R2_k` and `sum_k R2_k <= R2_total <= 1`.

use crate::error::{GfaError, Result};
use crate::linalg_backends::outer;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

/// Sums of squares below this are treated as a view without variance.
const ZERO_VARIANCE_THRESHOLD: f64 = 1e-12;

/// Per-view decomposition, expressed as fractions in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDecomposition {
    pub per_factor: Array1<f64>,
    pub total: f64,
}

/// Decomposes one view.
///
/// * `data` - samples × features, NaN for missing entries.
/// * `scores` - samples × factors.
/// * `loadings` - features × factors.
pub fn decompose_view(
    data: ArrayView2<f64>,
    scores: ArrayView2<f64>,
    loadings: ArrayView2<f64>,
) -> ViewDecomposition {
    let num_factors = scores.ncols();
    let ss_total: f64 = data.iter().filter(|v| !v.is_nan()).map(|v| v * v).sum();
    if ss_total <= ZERO_VARIANCE_THRESHOLD {
        return ViewDecomposition {
            per_factor: Array1::zeros(num_factors),
            total: 0.0,
        };
    }

    let prediction = scores.dot(&loadings.t());
    let ss_residual = masked_residual_ss(data, prediction.view());
    let total = (1.0 - ss_residual / ss_total).clamp(0.0, 1.0);

    let mut per_factor = Array1::<f64>::zeros(num_factors);
    for k in 0..num_factors {
        let z_k = scores.column(k);
        let w_k = loadings.column(k);
        let rank_one = outer(z_k, w_k);
        let ss_k = masked_residual_ss(data, rank_one.view());
        per_factor[k] = (1.0 - ss_k / ss_total).clamp(0.0, 1.0);
    }

    let sum: f64 = per_factor.sum();
    if sum > total && sum > 0.0 {
        let shrink = total / sum;
        per_factor.mapv_inplace(|v| v * shrink);
    }

    ViewDecomposition { per_factor, total }
}

/// Joint R2 of each feature of a view (fraction); zero-variance features report 0.
pub fn feature_r2(
    data: ArrayView2<f64>,
    scores: ArrayView2<f64>,
    loadings: ArrayView2<f64>,
) -> Array1<f64> {
    let prediction = scores.dot(&loadings.t());
    let mut out = Array1::<f64>::zeros(data.ncols());
    for (j, slot) in out.iter_mut().enumerate() {
        let column = data.column(j);
        let ss_total: f64 = column.iter().filter(|v| !v.is_nan()).map(|v| v * v).sum();
        if ss_total <= ZERO_VARIANCE_THRESHOLD {
            continue;
        }
        let ss_residual: f64 = column
            .iter()
            .zip(prediction.column(j).iter())
            .filter(|(y, _)| !y.is_nan())
            .map(|(y, p)| (y - p) * (y - p))
            .sum();
        *slot = (1.0 - ss_residual / ss_total).clamp(0.0, 1.0);
    }
    out
}

fn masked_residual_ss(data: ArrayView2<f64>, prediction: ArrayView2<f64>) -> f64 {
    let mut acc = 0.0;
    Zip::from(data).and(prediction).for_each(|&y, &p| {
        if !y.is_nan() {
            acc += (y - p) * (y - p);
        }
    });
    acc
}

/// Variance explained per (view, factor), in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceExplained {
    view_names: Vec<String>,
    factor_names: Vec<String>,
    /// Shape: (num_views, num_factors), percent.
    per_factor: Array2<f64>,
    /// Shape: (num_views), percent.
    total: Array1<f64>,
}

impl VarianceExplained {
    /// Builds the table from per-view decompositions given as fractions.
    pub fn from_decompositions(
        view_names: Vec<String>,
        factor_names: Vec<String>,
        decompositions: &[ViewDecomposition],
    ) -> Result<Self> {
        if view_names.len() != decompositions.len() {
            return Err(GfaError::InvalidInput(format!(
                "{} view names for {} decompositions",
                view_names.len(),
                decompositions.len()
            )));
        }
        let num_factors = factor_names.len();
        let mut per_factor = Array2::<f64>::zeros((view_names.len(), num_factors));
        let mut total = Array1::<f64>::zeros(view_names.len());
        for (v, (name, dec)) in view_names.iter().zip(decompositions).enumerate() {
            if dec.per_factor.len() != num_factors {
                return Err(GfaError::dimension_mismatch(
                    name,
                    format!(
                        "decomposition has {} factors, expected {}",
                        dec.per_factor.len(),
                        num_factors
                    ),
                ));
            }
            per_factor.row_mut(v).assign(&dec.per_factor.mapv(|x| x * 100.0));
            total[v] = dec.total * 100.0;
        }
        Ok(Self {
            view_names,
            factor_names,
            per_factor,
            total,
        })
    }

    pub fn view_names(&self) -> &[String] {
        &self.view_names
    }

    pub fn factor_names(&self) -> &[String] {
        &self.factor_names
    }

    /// Views × factors, percent.
    pub fn per_factor(&self) -> ArrayView2<'_, f64> {
        self.per_factor.view()
    }

    /// Joint variance explained per view, percent.
    pub fn totals(&self) -> ArrayView1<'_, f64> {
        self.total.view()
    }

    pub fn get(&self, view: &str, factor: usize) -> Result<f64> {
        let v = self.view_index(view)?;
        if factor >= self.factor_names.len() {
            return Err(GfaError::FactorOutOfRange {
                index: factor,
                num_factors: self.factor_names.len(),
            });
        }
        Ok(self.per_factor[[v, factor]])
    }

    pub fn total(&self, view: &str) -> Result<f64> {
        Ok(self.total[self.view_index(view)?])
    }

    fn view_index(&self, view: &str) -> Result<usize> {
        self.view_names
            .iter()
            .position(|n| n == view)
            .ok_or_else(|| GfaError::UnknownView(view.to_string()))
    }

    pub(crate) fn set_view_names(&mut self, names: Vec<String>) {
        self.view_names = names;
    }

    pub(crate) fn set_factor_names(&mut self, names: Vec<String>) {
        self.factor_names = names;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn perfect_rank_one_fit_explains_everything() {
        let z = array![[1.0], [-1.0], [2.0]];
        let w = array![[0.5], [2.0]];
        let y = z.dot(&w.t());
        let dec = decompose_view(y.view(), z.view(), w.view());
        assert_abs_diff_eq!(dec.total, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dec.per_factor[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_variance_view_reports_zero_not_nan() {
        let y = Array2::<f64>::zeros((4, 3));
        let z = Array2::<f64>::ones((4, 2));
        let w = Array2::<f64>::ones((3, 2));
        let dec = decompose_view(y.view(), z.view(), w.view());
        assert_eq!(dec.total, 0.0);
        assert!(dec.per_factor.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn missing_entries_are_ignored() {
        let z = array![[1.0], [2.0]];
        let w = array![[1.0], [1.0]];
        let y = array![[1.0, f64::NAN], [2.0, 2.0]];
        let dec = decompose_view(y.view(), z.view(), w.view());
        assert_abs_diff_eq!(dec.total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn overlapping_factors_are_reconciled_with_total() {
        // Two identical factors each reproduce the data alone; together they overshoot.
        let z = array![[1.0, 1.0], [-1.0, -1.0], [0.5, 0.5]];
        let w = array![[0.5, 0.5], [1.0, 1.0]];
        let y = array![[1.0, 2.0], [-1.0, -2.0], [0.5, 1.0]];
        let dec = decompose_view(y.view(), z.view(), w.view());
        let sum: f64 = dec.per_factor.sum();
        assert!(sum <= dec.total + 1e-12);
        assert!(dec.per_factor.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn feature_r2_per_column() {
        let z = array![[1.0], [2.0], [3.0]];
        let w = array![[1.0], [0.0]];
        let y = array![[1.0, 0.0], [2.0, 0.0], [3.0, 0.0]];
        let r2 = feature_r2(y.view(), z.view(), w.view());
        assert_abs_diff_eq!(r2[0], 1.0, epsilon = 1e-12);
        assert_eq!(r2[1], 0.0);
    }

    #[test]
    fn table_lookup_by_view_and_factor() {
        let table = VarianceExplained::from_decompositions(
            vec!["rna".into(), "protein".into()],
            vec!["Factor1".into(), "Factor2".into()],
            &[
                ViewDecomposition {
                    per_factor: array![0.4, 0.1],
                    total: 0.5,
                },
                ViewDecomposition {
                    per_factor: array![0.0, 0.2],
                    total: 0.25,
                },
            ],
        )
        .unwrap();
        assert_abs_diff_eq!(table.get("rna", 0).unwrap(), 40.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.total("protein").unwrap(), 25.0, epsilon = 1e-12);
        assert!(matches!(table.get("lipids", 0), Err(GfaError::UnknownView(_))));
        assert!(matches!(
            table.get("rna", 5),
            Err(GfaError::FactorOutOfRange { .. })
        ));
    }
}
