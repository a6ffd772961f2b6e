// src/linalg_backends.rs

use log::trace;
use ndarray::{s, Array1, Array2, Axis};
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use std::error::Error;

/// A thread-safe boxed error, shared by every fallible operation in the crate.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

// --- Trait Definitions ---

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<f64>,
}

/// Exact symmetric eigendecomposition (LAPACK DSYEVD or equivalent).
/// Implementers expect `matrix` to be symmetric and only read its upper triangle.
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError>;
}

/// QR decomposition, retrieving only the thin Q factor.
pub trait BackendQR {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError>;
}

/// Parameters of the randomized subspace iteration behind [`BackendTruncatedEigh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IterativeSolverConfig {
    /// Extra basis vectors carried beyond the requested `k` (block size `l = k + oversampling`).
    pub oversampling: usize,
    /// Number of `Q <- qr(C Q)` refinement steps.
    pub power_iterations: usize,
    /// Seed for the Gaussian start block.
    pub seed: u64,
}

impl Default for IterativeSolverConfig {
    fn default() -> Self {
        IterativeSolverConfig {
            oversampling: 10,
            power_iterations: 7,
            seed: 2025,
        }
    }
}

/// Truncated symmetric eigensolver computing only the `k` largest eigenpairs.
///
/// Like [`BackendEigh`], results are returned in ascending order of eigenvalue,
/// so the last column belongs to the largest eigenvalue.
pub trait BackendTruncatedEigh {
    fn eigh_top_k(
        &self,
        matrix: &Array2<f64>,
        k: usize,
        config: &IterativeSolverConfig,
    ) -> Result<EighOutput, ThreadSafeStdError>;
}

// --- NdarrayLinAlgBackend Implementation ---
use ndarray_linalg::{Eigh as NdLinalgEigh, QR as NdLinalgQR, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
    Box::new(e)
}

impl BackendEigh for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError> {
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendQR for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

// --- FaerLinAlgBackend Implementation ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendEigh, EighOutput, ThreadSafeStdError};
    use ndarray::{Array1, Array2};

    fn to_dyn_error_faer(msg: String) -> ThreadSafeStdError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    impl BackendEigh for FaerLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError> {
            if matrix.nrows() != matrix.ncols() {
                return Err(to_dyn_error_faer(format!(
                    "Matrix must be square for eigendecomposition, got {}x{}.",
                    matrix.nrows(),
                    matrix.ncols()
                )));
            }
            let d = matrix.nrows();
            if d == 0 {
                return Ok(EighOutput {
                    eigenvalues: Array1::zeros(0),
                    eigenvectors: Array2::zeros((0, 0)),
                });
            }
            // Copy through an owned faer matrix so any ndarray layout is accepted.
            let faer_mat = faer::Mat::<f64>::from_fn(d, d, |i, j| matrix[[i, j]]);
            let evd = faer_mat
                .as_ref()
                .self_adjoint_eigen(faer::Side::Upper)
                .map_err(|e| to_dyn_error_faer(format!("Faer eigendecomposition failed: {:?}", e)))?;
            let values = evd.S().column_vector();
            let vectors = evd.U();
            Ok(EighOutput {
                eigenvalues: Array1::from_shape_fn(d, |i| values[i]),
                eigenvectors: Array2::from_shape_fn((d, d), |(i, j)| vectors[(i, j)]),
            })
        }
    }
}

// --- LinAlgBackendProvider Dispatch ---

/// Dispatches to the linear algebra backend selected by compile-time feature flags.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider;

impl LinAlgBackendProvider {
    pub fn new() -> Self {
        Self
    }
}

impl BackendEigh for LinAlgBackendProvider {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.eigh_upper(matrix)
        }
    }
}

impl BackendQR for LinAlgBackendProvider {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.qr_q_factor(matrix)
    }
}

/// Randomized subspace iteration (Halko, Martinsson, Tropp 2011) specialised to a
/// symmetric positive semi-definite matrix, followed by Rayleigh-Ritz on the subspace.
impl BackendTruncatedEigh for LinAlgBackendProvider {
    fn eigh_top_k(
        &self,
        matrix: &Array2<f64>,
        k: usize,
        config: &IterativeSolverConfig,
    ) -> Result<EighOutput, ThreadSafeStdError> {
        let d = matrix.nrows();
        if d != matrix.ncols() {
            return Err(format!(
                "Truncated eigendecomposition needs a square matrix, got {}x{}.",
                d,
                matrix.ncols()
            )
            .into());
        }
        let k = k.min(d);
        if k == 0 {
            return Ok(EighOutput {
                eigenvalues: Array1::zeros(0),
                eigenvectors: Array2::zeros((d, 0)),
            });
        }
        let l_block = (k + config.oversampling).min(d);

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let normal = Normal::new(0.0, 1.0).map_err(to_dyn_error)?;
        let omega = Array2::<f64>::random_using((d, l_block), normal, &mut rng);

        let mut q_basis = self.qr_q_factor(&matrix.dot(&omega))?;
        for i in 0..config.power_iterations {
            if q_basis.ncols() == 0 {
                break;
            }
            q_basis = self
                .qr_q_factor(&matrix.dot(&q_basis))
                .map_err(|e| format!("QR in power iteration {} failed: {}", i, e))?;
        }
        if q_basis.ncols() == 0 {
            return Err("Subspace basis collapsed to zero columns during power iterations.".into());
        }

        // Rayleigh-Ritz: eigenpairs of Q^T C Q lifted back through Q.
        let mut projected = q_basis.t().dot(matrix).dot(&q_basis);
        let projected_t = projected.t().to_owned();
        projected += &projected_t;
        projected.mapv_inplace(|v| 0.5 * v);
        let small = self.eigh_upper(&projected)?;
        let ritz_vectors = q_basis.dot(&small.eigenvectors);

        let available = small.eigenvalues.len();
        let k_kept = k.min(available);
        trace!(
            "Subspace iteration: d={}, block={}, power_iterations={}, kept {} Ritz pairs.",
            d,
            l_block,
            config.power_iterations,
            k_kept
        );

        // Ascending order is kept; the top-k pairs are the trailing columns.
        let start = available - k_kept;
        Ok(EighOutput {
            eigenvalues: small.eigenvalues.slice(s![start..]).to_owned(),
            eigenvectors: ritz_vectors.slice(s![.., start..]).to_owned(),
        })
    }
}

/// Euclidean norm of each column.
pub fn column_norms(matrix: &Array2<f64>) -> Array1<f64> {
    matrix.map_axis(Axis(0), |column| column.dot(&column).sqrt())
}
