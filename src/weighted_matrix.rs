// src/weighted_matrix.rs

//! The small set of matrix capabilities the covariance builder and the projector
//! need, implemented once for dense `ndarray` storage and once for compressed
//! sparse `sprs` storage.
//!
//! Every operation returns a fresh value; the receiver is never modified.
//! Sparse implementations never allocate a dense matrix of the receiver's shape:
//! entrywise operations keep the sparsity pattern and products accumulate
//! directly from the compressed storage.

use crate::linalg_backends::ThreadSafeStdError;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use sprs::{CsMat, TriMat};
use std::borrow::Cow;

/// Capabilities of a data matrix `X` (rows are observations, columns are features).
pub trait WeightedMatrix: Sized + Sync {
    fn n_rows(&self) -> usize;
    fn n_cols(&self) -> usize;

    /// `weights^T X`, a vector of length `n_cols`.
    fn weighted_column_sums(&self, weights: &Array1<f64>) -> Result<Array1<f64>, ThreadSafeStdError>;

    /// `X` with every stored entry squared.
    fn squared(&self) -> Self;

    /// `X diag(factors)`: column `j` multiplied by `factors[j]`.
    fn scale_columns(&self, factors: &Array1<f64>) -> Result<Self, ThreadSafeStdError>;

    /// `diag(factors) X`: row `i` multiplied by `factors[i]`.
    fn scale_rows(&self, factors: &Array1<f64>) -> Result<Self, ThreadSafeStdError>;

    /// `X^T X`, dense `n_cols x n_cols`.
    fn gram_columns(&self) -> Array2<f64>;

    /// `X X^T`, dense `n_rows x n_rows`.
    fn gram_rows(&self) -> Array2<f64>;

    /// `X B` for a dense `B` with `n_cols` rows.
    fn dot_dense(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError>;

    /// `X^T B` for a dense `B` with `n_rows` rows.
    fn t_dot_dense(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError>;
}

fn check_dim(operation: &str, expected: usize, found: usize) -> Result<(), ThreadSafeStdError> {
    if expected != found {
        return Err(format!(
            "Shape mismatch in {}: expected dimension {}, found {}.",
            operation, expected, found
        )
        .into());
    }
    Ok(())
}

// --- Dense storage ---

impl WeightedMatrix for Array2<f64> {
    fn n_rows(&self) -> usize {
        self.nrows()
    }

    fn n_cols(&self) -> usize {
        self.ncols()
    }

    fn weighted_column_sums(&self, weights: &Array1<f64>) -> Result<Array1<f64>, ThreadSafeStdError> {
        check_dim("weights^T X", self.nrows(), weights.len())?;
        Ok(weights.dot(self))
    }

    fn squared(&self) -> Self {
        self.mapv(|v| v * v)
    }

    fn scale_columns(&self, factors: &Array1<f64>) -> Result<Self, ThreadSafeStdError> {
        check_dim("column scaling", self.ncols(), factors.len())?;
        Ok(self * factors)
    }

    fn scale_rows(&self, factors: &Array1<f64>) -> Result<Self, ThreadSafeStdError> {
        check_dim("row scaling", self.nrows(), factors.len())?;
        Ok(self * &factors.view().insert_axis(Axis(1)))
    }

    fn gram_columns(&self) -> Array2<f64> {
        self.t().dot(self)
    }

    fn gram_rows(&self) -> Array2<f64> {
        self.dot(&self.t())
    }

    fn dot_dense(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        check_dim("X B", self.ncols(), rhs.nrows())?;
        Ok(self.dot(rhs))
    }

    fn t_dot_dense(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        check_dim("X^T B", self.nrows(), rhs.nrows())?;
        Ok(self.t().dot(rhs))
    }
}

// --- Sparse storage ---

/// Visits every stored entry as `(row, col, value)`, independent of CSR/CSC layout.
fn for_each_entry<F: FnMut(usize, usize, f64)>(matrix: &CsMat<f64>, mut visit: F) {
    let is_csr = matrix.is_csr();
    for (outer_idx, lane) in matrix.outer_iterator().enumerate() {
        for (inner_idx, &value) in lane.iter() {
            if is_csr {
                visit(outer_idx, inner_idx, value);
            } else {
                visit(inner_idx, outer_idx, value);
            }
        }
    }
}

/// Rebuilds `matrix` with the same pattern and storage order, mapping each entry.
fn map_entries<F: Fn(usize, usize, f64) -> f64>(matrix: &CsMat<f64>, map: F) -> CsMat<f64> {
    let mut triplets = TriMat::with_capacity((matrix.rows(), matrix.cols()), matrix.nnz());
    for_each_entry(matrix, |row, col, value| {
        triplets.add_triplet(row, col, map(row, col, value));
    });
    if matrix.is_csr() {
        triplets.to_csr()
    } else {
        triplets.to_csc()
    }
}

fn as_storage(matrix: &CsMat<f64>, want_csr: bool) -> Cow<'_, CsMat<f64>> {
    if matrix.is_csr() == want_csr {
        return Cow::Borrowed(matrix);
    }
    let mut triplets = TriMat::with_capacity((matrix.rows(), matrix.cols()), matrix.nnz());
    for_each_entry(matrix, |row, col, value| triplets.add_triplet(row, col, value));
    Cow::Owned(if want_csr { triplets.to_csr() } else { triplets.to_csc() })
}

/// Dense `dim x dim` product `A B` where `by_output` holds `A` with its rows as outer
/// lanes and `by_shared` holds `B` with its rows as outer lanes.
///
/// Output row `a` is `sum_i A[a, i] B[i, :]`, so rows are filled independently in
/// parallel and the only dense allocation is the result itself.
fn sparse_gram(by_output: &CsMat<f64>, by_shared: &CsMat<f64>, dim: usize) -> Array2<f64> {
    let mut gram = Array2::<f64>::zeros((dim, dim));
    gram.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(a, mut out_row)| {
            let Some(lane) = by_output.outer_view(a) else {
                return;
            };
            for (shared, &va) in lane.iter() {
                if let Some(shared_lane) = by_shared.outer_view(shared) {
                    for (b, &vb) in shared_lane.iter() {
                        out_row[b] += va * vb;
                    }
                }
            }
        });
    gram
}

impl WeightedMatrix for CsMat<f64> {
    fn n_rows(&self) -> usize {
        self.rows()
    }

    fn n_cols(&self) -> usize {
        self.cols()
    }

    fn weighted_column_sums(&self, weights: &Array1<f64>) -> Result<Array1<f64>, ThreadSafeStdError> {
        check_dim("weights^T X", self.rows(), weights.len())?;
        let mut sums = Array1::<f64>::zeros(self.cols());
        for_each_entry(self, |row, col, value| sums[col] += weights[row] * value);
        Ok(sums)
    }

    fn squared(&self) -> Self {
        self.map(|&v| v * v)
    }

    fn scale_columns(&self, factors: &Array1<f64>) -> Result<Self, ThreadSafeStdError> {
        check_dim("column scaling", self.cols(), factors.len())?;
        Ok(map_entries(self, |_, col, value| value * factors[col]))
    }

    fn scale_rows(&self, factors: &Array1<f64>) -> Result<Self, ThreadSafeStdError> {
        check_dim("row scaling", self.rows(), factors.len())?;
        Ok(map_entries(self, |row, _, value| value * factors[row]))
    }

    // X^T X: lanes of CSC are the rows of X^T, lanes of CSR are the rows of X.
    fn gram_columns(&self) -> Array2<f64> {
        sparse_gram(&as_storage(self, false), &as_storage(self, true), self.cols())
    }

    // X X^T: lanes of CSR are the rows of X, lanes of CSC are the rows of X^T.
    fn gram_rows(&self) -> Array2<f64> {
        sparse_gram(&as_storage(self, true), &as_storage(self, false), self.rows())
    }

    fn dot_dense(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        check_dim("X B", self.cols(), rhs.nrows())?;
        let mut product = Array2::<f64>::zeros((self.rows(), rhs.ncols()));
        for_each_entry(self, |row, col, value| {
            product.row_mut(row).scaled_add(value, &rhs.row(col));
        });
        Ok(product)
    }

    fn t_dot_dense(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        check_dim("X^T B", self.rows(), rhs.nrows())?;
        let mut product = Array2::<f64>::zeros((self.cols(), rhs.ncols()));
        for_each_entry(self, |row, col, value| {
            product.row_mut(col).scaled_add(value, &rhs.row(row));
        });
        Ok(product)
    }
}
