// src/spectral.rs

use crate::linalg_backends::{
    column_norms, BackendEigh, BackendTruncatedEigh, IterativeSolverConfig, ThreadSafeStdError,
};
use crate::weighted_matrix::WeightedMatrix;
use float_cmp::approx_eq;
use log::{debug, warn};
use ndarray::{s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// How many principal components to keep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum ComponentSelection {
    /// `min(n_samples, n_features)` components.
    #[default]
    All,
    /// At most this many components; clamped to the data dimensions and to at least one.
    Count(usize),
    /// The smallest number of leading components whose cumulative explained variance
    /// ratio strictly exceeds this fraction.
    VarianceThreshold(f64),
}

impl ComponentSelection {
    /// Maps the integer convention where any negative value means "all components".
    pub fn from_sentinel(n_components: i64) -> Self {
        if n_components < 0 {
            ComponentSelection::All
        } else {
            ComponentSelection::Count(n_components as usize)
        }
    }
}

impl From<usize> for ComponentSelection {
    fn from(count: usize) -> Self {
        ComponentSelection::Count(count)
    }
}

impl From<f64> for ComponentSelection {
    fn from(fraction: f64) -> Self {
        ComponentSelection::VarianceThreshold(fraction)
    }
}

/// Which eigensolver the reducer uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolverMode {
    /// Full symmetric eigendecomposition, keeping the leading pairs.
    Exact,
    /// Randomized subspace iteration for the leading pairs only.
    Iterative(IterativeSolverConfig),
}

/// Leading eigenpairs of the covariance-like matrix, in descending order.
#[derive(Debug, Clone)]
pub struct SpectralDecomposition {
    pub eigenvalues: Array1<f64>,
    /// `d x k`, orthonormal columns in the basis of the decomposed matrix.
    pub eigenvectors: Array2<f64>,
    /// Trace of the decomposed matrix.
    pub total_variance: f64,
    pub n_components: usize,
}

impl SpectralDecomposition {
    pub fn explained_variance_ratio(&self) -> Array1<f64> {
        &self.eigenvalues / self.total_variance
    }
}

/// Resolves a variance fraction against descending eigenvalues.
///
/// Returns one more than the number of leading components whose cumulative ratio is
/// `<= fraction`: a cumulative ratio exactly equal to the fraction does not stop the
/// search, the next component is taken. The result is clamped to the number of
/// eigenvalues available.
pub fn resolve_variance_threshold(eigenvalues: &Array1<f64>, total_variance: f64, fraction: f64) -> usize {
    let mut running = 0.0;
    let cumulative: Vec<f64> = eigenvalues
        .iter()
        .map(|&value| {
            running += value / total_variance;
            running
        })
        .collect();
    let satisfied_before = cumulative.partition_point(|&ratio| ratio <= fraction);
    (satisfied_before + 1).min(eigenvalues.len()).max(1)
}

fn warn_if_asymmetric(matrix: &Array2<f64>) {
    let scale = matrix.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(1.0);
    let max_asymmetry = matrix
        .indexed_iter()
        .filter(|((i, j), _)| i < j)
        .fold(0.0_f64, |acc, ((i, j), &v)| acc.max((v - matrix[[j, i]]).abs()));
    if !approx_eq!(f64, max_asymmetry / scale, 0.0, epsilon = 1e-8) {
        warn!(
            "Covariance matrix is not symmetric (max |C - C^T| = {:e}); only its upper triangle is used.",
            max_asymmetry
        );
    }
}

/// Eigendecomposes the covariance-like matrix and keeps the leading components.
///
/// * `max_components` - `min(n_samples, n_features)` of the original data.
pub fn reduce<B: BackendEigh + BackendTruncatedEigh>(
    backend: &B,
    covariance: &Array2<f64>,
    selection: ComponentSelection,
    max_components: usize,
    solver: SolverMode,
) -> Result<SpectralDecomposition, ThreadSafeStdError> {
    let dim = covariance.nrows();
    if dim != covariance.ncols() {
        return Err(format!("Covariance matrix must be square, got {:?}.", covariance.dim()).into());
    }
    warn_if_asymmetric(covariance);

    // The trace stays exact when only part of the spectrum is computed.
    let total_variance = covariance.diag().sum();
    let cap = max_components.min(dim);
    let n_to_solve = match selection {
        ComponentSelection::Count(k) => k.clamp(1, cap.max(1)),
        ComponentSelection::All | ComponentSelection::VarianceThreshold(_) => cap,
    };

    let ascending = match solver {
        SolverMode::Exact => {
            let full = backend.eigh_upper(covariance)?;
            let start = full.eigenvalues.len().saturating_sub(n_to_solve);
            (
                full.eigenvalues.slice(s![start..]).to_owned(),
                full.eigenvectors.slice(s![.., start..]).to_owned(),
            )
        }
        SolverMode::Iterative(config) => {
            let top = backend.eigh_top_k(covariance, n_to_solve, &config)?;
            (top.eigenvalues, top.eigenvectors)
        }
    };
    let eigenvalues = ascending.0.slice(s![..;-1]).to_owned();
    let eigenvectors = ascending.1.slice(s![.., ..;-1]).to_owned();

    let n_components = match selection {
        ComponentSelection::VarianceThreshold(fraction) => {
            resolve_variance_threshold(&eigenvalues, total_variance, fraction)
        }
        _ => eigenvalues.len(),
    };
    debug!(
        "Resolved {:?} to {} components (total variance {:.6e}, {} eigenpairs solved).",
        selection,
        n_components,
        total_variance,
        eigenvalues.len()
    );

    Ok(SpectralDecomposition {
        eigenvalues: eigenvalues.slice(s![..n_components]).to_owned(),
        eigenvectors: eigenvectors.slice(s![.., ..n_components]).to_owned(),
        total_variance,
        n_components,
    })
}

/// Lifts eigenvectors of the weighted Gram matrix (sample space) to unit-length
/// principal axes in feature space.
///
/// For `Z = Wr (X - u)`, if `Z Z^T q = l q` then `Z^T q` is an eigenvector of `Z^T Z`,
/// and `Z^T Q = Xw^T Q - u^T (Wr^T Q)` with `Xw = Wr X`.
pub fn recover_feature_axes<M: WeightedMatrix>(
    weighted_data: &M,
    centering: &Array1<f64>,
    sqrt_weights: &Array1<f64>,
    sample_vectors: &Array2<f64>,
) -> Result<Array2<f64>, ThreadSafeStdError> {
    let mut axes = weighted_data.t_dot_dense(sample_vectors)?;
    let weighted_sums = sqrt_weights.dot(sample_vectors);
    axes -= &centering
        .view()
        .insert_axis(Axis(1))
        .dot(&weighted_sums.view().insert_axis(Axis(0)));

    let norms = column_norms(&axes);
    if norms.iter().any(|&n| n == 0.0) {
        warn!("A lifted principal axis has zero norm; its normalized entries will be NaN.");
    }
    axes /= &norms;
    Ok(axes)
}
