//! Thin bridge between `ndarray` arrays and faer's dense Cholesky solver.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("matrix is numerically singular (pivot {pivot} = {value:.3e})")]
    NearlySingular { pivot: usize, value: f64 },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Borrows contiguous arrays in place and copies strided ones.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = match array.as_slice() {
            Some(slice) => FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1)),
            None => FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix1>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    pub fn solve_mat<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }

    /// `A⁻¹`, solved against the identity.
    pub fn inverse(&self) -> Array2<f64> {
        self.solve_mat(&Array2::<f64>::eye(self.dim()))
    }

    /// Diagonal of the lower factor `L`.
    pub fn diag(&self) -> Array1<f64> {
        let lower = self.factor.L();
        Array1::from_shape_fn(lower.nrows(), |i| lower[(i, i)])
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.factor.L().nrows()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn solves_a_symmetric_positive_definite_system() {
        let a = array![[4.0, 2.0, 0.6], [2.0, 5.0, 1.0], [0.6, 1.0, 3.0]];
        let b = array![1.0, -2.0, 0.5];
        let chol = a.cholesky(Side::Lower).expect("spd");
        let x = chol.solve_vec(&b);
        let residual = a.dot(&x) - &b;
        for r in residual.iter() {
            assert_abs_diff_eq!(*r, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let a = array![[2.0, -0.5], [-0.5, 1.0]];
        let inverse = a.cholesky(Side::Lower).expect("spd").inverse();
        let identity = a.dot(&inverse);
        assert_abs_diff_eq!(identity[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(identity[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(identity[[1, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(identity[[1, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn strided_inputs_are_copied_before_solving() {
        let wide = array![[9.0, 0.0, 3.0, 0.0], [3.0, 0.0, 5.0, 0.0]];
        let a = wide.slice(ndarray::s![.., ..;2]);
        let rhs_storage = array![1.0, 0.0, 2.0];
        let rhs = rhs_storage.slice(ndarray::s![..;2]);
        let x = a.cholesky(Side::Lower).expect("spd").solve_vec(&rhs);
        assert_abs_diff_eq!(9.0 * x[0] + 3.0 * x[1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(3.0 * x[0] + 5.0 * x[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn lower_factor_diagonal_holds_the_pivot_roots() {
        let a = array![[4.0, 2.0], [2.0, 10.0]];
        let diag = a.cholesky(Side::Lower).expect("spd").diag();
        assert_abs_diff_eq!(diag[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(diag[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn indefinite_matrices_fail_to_factor() {
        let indefinite = array![[-1.0, 0.0], [0.0, 1.0]];
        assert!(matches!(
            indefinite.cholesky(Side::Lower),
            Err(FaerLinalgError::Cholesky(_))
        ));
    }
}
