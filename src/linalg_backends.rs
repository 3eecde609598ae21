// src/linalg_backends.rs

//! Linear algebra kernels used by the factor engine, behind backend traits.
//!
//! The engine only needs two dense decompositions: a symmetric eigendecomposition
//! (for inverting the small F × F posterior precision matrices) and a thin SVD
//! (for PCA initialization). Both go through traits so a different LAPACK binding
//! can be slotted in without touching the inference code.

use crate::error::{GfaError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh as NdLinalgEigh, SVDInto as NdLinalgSVDInto, UPLO};

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<f64>,
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<f64>,
}

/// Trait for symmetric eigendecomposition. Only the upper triangle is read.
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput>;
}

/// Output of a Singular Value Decomposition.
#[derive(Debug)]
pub struct SVDOutput {
    pub u: Option<Array2<f64>>,
    pub s: Array1<f64>,
    pub vt: Option<Array2<f64>>,
}

/// Trait for Singular Value Decomposition.
pub trait BackendSVD {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput>;
}

/// ndarray-linalg (LAPACK) implementation; the BLAS provider is picked by cargo features.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

impl BackendEigh for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput> {
        let (eigenvalues, eigenvectors) = matrix
            .eigh(UPLO::Upper)
            .map_err(|e| GfaError::Linalg(format!("symmetric eigendecomposition failed: {}", e)))?;
        Ok(EighOutput {
            eigenvalues,
            eigenvectors,
        })
    }
}

impl BackendSVD for NdarrayLinAlgBackend {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            let k_dim = nrows.min(ncols);
            return Ok(SVDOutput {
                u: if compute_u { Some(Array2::zeros((nrows, k_dim))) } else { None },
                s: Array1::zeros(k_dim),
                vt: if compute_v { Some(Array2::zeros((k_dim, ncols))) } else { None },
            });
        }
        let (u, s, vt) = matrix
            .svd_into(compute_u, compute_v)
            .map_err(|e| GfaError::Linalg(format!("SVD failed: {}", e)))?;
        Ok(SVDOutput { u, s, vt })
    }
}

/// Inverse of a symmetric positive (semi)definite matrix together with its log-determinant.
#[derive(Debug)]
pub struct SymmetricInverse {
    pub inverse: Array2<f64>,
    /// log |inverse|, i.e. minus the log-determinant of the input.
    pub log_det_inverse: f64,
    /// Number of eigenvalues raised to the floor.
    pub num_clamped: usize,
}

/// Inverts a symmetric positive definite matrix through its eigendecomposition.
///
/// Eigenvalues below `eigenvalue_floor` are raised to it, which acts as a ridge
/// on rank-deficient directions.
pub fn invert_symmetric<B: BackendEigh>(
    backend: &B,
    matrix: &Array2<f64>,
    eigenvalue_floor: f64,
) -> Result<SymmetricInverse> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return Err(GfaError::Linalg(format!(
            "cannot invert a non-square {}x{} matrix",
            n,
            matrix.ncols()
        )));
    }
    if n == 0 {
        return Ok(SymmetricInverse {
            inverse: Array2::zeros((0, 0)),
            log_det_inverse: 0.0,
            num_clamped: 0,
        });
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(GfaError::Linalg(
            "matrix to invert contains non-finite entries".into(),
        ));
    }

    let EighOutput {
        eigenvalues,
        eigenvectors,
    } = backend.eigh_upper(matrix)?;

    let mut num_clamped = 0usize;
    let clamped = eigenvalues.mapv(|lambda| {
        if lambda < eigenvalue_floor {
            num_clamped += 1;
            eigenvalue_floor
        } else {
            lambda
        }
    });
    let log_det_inverse = -clamped.mapv(f64::ln).sum();

    // V diag(1/lambda) V^T
    let mut scaled = eigenvectors.clone();
    for (mut col, &lambda) in scaled.axis_iter_mut(Axis(1)).zip(clamped.iter()) {
        col.mapv_inplace(|v| v / lambda);
    }
    let mut inverse = scaled.dot(&eigenvectors.t());
    symmetrize(&mut inverse);

    Ok(SymmetricInverse {
        inverse,
        log_det_inverse,
        num_clamped,
    })
}

/// a b^T
pub(crate) fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    let a2 = a.insert_axis(Axis(1));
    let b2 = b.insert_axis(Axis(0));
    a2.dot(&b2)
}

/// Replaces a square matrix with (A + A^T) / 2.
pub fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn inverse_of_spd_matrix() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = invert_symmetric(&NdarrayLinAlgBackend, &a, 1e-10).unwrap();
        let identity = a.dot(&inv.inverse);
        assert_abs_diff_eq!(identity[[0, 0]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(identity[[0, 1]], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(identity[[1, 1]], 1.0, epsilon = 1e-10);
        // det(a) = 11
        assert_abs_diff_eq!(inv.log_det_inverse, -(11.0_f64).ln(), epsilon = 1e-10);
        assert_eq!(inv.num_clamped, 0);
    }

    #[test]
    fn singular_matrix_is_regularized() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let inv = invert_symmetric(&NdarrayLinAlgBackend, &a, 1e-6).unwrap();
        assert_eq!(inv.num_clamped, 1);
        assert!(inv.inverse.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn non_finite_input_is_an_error() {
        let a = array![[f64::NAN, 0.0], [0.0, 1.0]];
        assert!(invert_symmetric(&NdarrayLinAlgBackend, &a, 1e-6).is_err());
    }

    #[test]
    fn svd_of_empty_matrix() {
        let out = NdarrayLinAlgBackend
            .svd_into(Array2::zeros((0, 3)), true, true)
            .unwrap();
        assert_eq!(out.s.len(), 0);
        assert_eq!(out.u.unwrap().dim(), (0, 0));
        assert_eq!(out.vt.unwrap().dim(), (0, 3));
    }
}
