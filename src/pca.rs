// Weighted principal component analysis (PCA) via eigendecomposition

use crate::covariance::{build_covariance, CovariancePath};
use crate::linalg_backends::{IterativeSolverConfig, LinAlgBackendProvider, ThreadSafeStdError};
use crate::spectral::{recover_feature_axes, reduce, ComponentSelection, SolverMode};
use crate::weighted_matrix::WeightedMatrix;
use log::{debug, info};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Configuration of a [`WeightedEigenPCA`] model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaConfig {
    /// How many components to keep.
    pub n_components: ComponentSelection,
    /// Divide each feature by its weighted standard deviation before the decomposition.
    pub scale: bool,
    /// Always decompose the `n_samples x n_samples` Gram matrix, whatever the shape.
    pub force_samples_path: bool,
    /// Use randomized subspace iteration for the leading eigenpairs instead of a full
    /// symmetric eigendecomposition.
    pub use_iterative_solver: bool,
    /// Parameters of the iterative solver; ignored by the exact solver.
    pub iterative: IterativeSolverConfig,
}

impl Default for PcaConfig {
    fn default() -> Self {
        PcaConfig {
            n_components: ComponentSelection::All,
            scale: true,
            force_samples_path: false,
            use_iterative_solver: false,
            iterative: IterativeSolverConfig::default(),
        }
    }
}

impl PcaConfig {
    pub fn with_n_components<C: Into<ComponentSelection>>(mut self, n_components: C) -> Self {
        self.n_components = n_components.into();
        self
    }

    pub fn with_scale(mut self, scale: bool) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_force_samples_path(mut self, force: bool) -> Self {
        self.force_samples_path = force;
        self
    }

    pub fn with_iterative_solver(mut self, use_iterative_solver: bool) -> Self {
        self.use_iterative_solver = use_iterative_solver;
        self
    }

    pub fn with_iterative_config(mut self, iterative: IterativeSolverConfig) -> Self {
        self.iterative = iterative;
        self
    }

    fn solver_mode(&self) -> SolverMode {
        if self.use_iterative_solver {
            SolverMode::Iterative(self.iterative)
        } else {
            SolverMode::Exact
        }
    }
}

/// Parameters learned by `fit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FittedModel {
    /// Weighted mean of the training data. Shape: (n_features)
    mean: Array1<f64>,
    /// Weighted standard deviation, when scaling. Shape: (n_features)
    scale: Option<Array1<f64>>,
    /// Mean of the data as seen by the projection (`mean / scale` when scaling).
    centering: Array1<f64>,
    /// Unit-norm principal axes as columns. Shape: (n_features, n_components)
    components: Array2<f64>,
    /// Eigenvalues of the covariance, descending. Shape: (n_components)
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
    /// Trace of the covariance.
    total_variance: f64,
    path: CovariancePath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FitState {
    Unfitted,
    Fitted(FittedModel),
}

/// Weighted PCA whose rows may carry (non-integer) repetition weights.
///
/// Fitting `X` with weights `W` is equivalent to ordinary PCA on the matrix where
/// row `i` of `X` is repeated in proportion to `W[i]`. The centered matrix is never
/// formed, so sparse input (`sprs::CsMat<f64>`) stays sparse. Depending on the shape
/// of `X` either the feature covariance or the sample Gram matrix is eigendecomposed.
///
/// # Examples
///
/// ```
/// use ndarray::array;
/// use weighted_eigen_pca::{PcaConfig, WeightedEigenPCA};
///
/// let data = array![[1.0, 2.0], [3.0, 1.0], [0.0, 4.0]];
/// let weights = array![1.0, 2.0, 1.0];
///
/// let mut pca = WeightedEigenPCA::new(PcaConfig::default().with_scale(false));
/// let scores = pca.fit_transform(&data, Some(&weights)).unwrap();
/// assert_eq!(scores.dim(), (3, 2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedEigenPCA {
    config: PcaConfig,
    state: FitState,
}

impl Default for WeightedEigenPCA {
    fn default() -> Self {
        Self::new(PcaConfig::default())
    }
}

impl fmt::Display for WeightedEigenPCA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.n_components() {
            Some(k) => write!(f, "WeightedEigenPCA({})", k),
            None => write!(f, "WeightedEigenPCA()"),
        }
    }
}

impl WeightedEigenPCA {
    /// Creates an unfitted model.
    pub fn new(config: PcaConfig) -> Self {
        Self {
            config,
            state: FitState::Unfitted,
        }
    }

    pub fn config(&self) -> &PcaConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, FitState::Fitted(_))
    }

    fn fitted(&self) -> Option<&FittedModel> {
        match &self.state {
            FitState::Fitted(model) => Some(model),
            FitState::Unfitted => None,
        }
    }

    /// Weighted mean of the training data, shape (n_features).
    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.fitted().map(|m| &m.mean)
    }

    /// Weighted standard deviation of the training data, shape (n_features).
    /// `None` when unfitted or when scaling is disabled.
    pub fn scale(&self) -> Option<&Array1<f64>> {
        self.fitted().and_then(|m| m.scale.as_ref())
    }

    /// Principal axes as unit-norm columns, shape (n_features, n_components).
    pub fn components(&self) -> Option<&Array2<f64>> {
        self.fitted().map(|m| &m.components)
    }

    /// Variance along each principal axis, descending.
    pub fn explained_variance(&self) -> Option<&Array1<f64>> {
        self.fitted().map(|m| &m.explained_variance)
    }

    /// `explained_variance / total_variance`.
    pub fn explained_variance_ratio(&self) -> Option<&Array1<f64>> {
        self.fitted().map(|m| &m.explained_variance_ratio)
    }

    /// Total weighted variance, the trace of the decomposed covariance.
    pub fn total_variance(&self) -> Option<f64> {
        self.fitted().map(|m| m.total_variance)
    }

    /// Number of components kept by the last `fit`.
    ///
    /// Centering removes one dimension, so on wide data (`n_samples <= n_features`) with
    /// `ComponentSelection::All` at most `n_samples - 1` axes carry variance. The last
    /// axis then belongs to a zero eigenvalue: it is rounding noise scaled to unit
    /// length and is not orthogonal to the others.
    pub fn n_components(&self) -> Option<usize> {
        self.fitted().map(|m| m.components.ncols())
    }

    /// The covariance formulation used by the last `fit`.
    pub fn covariance_path(&self) -> Option<CovariancePath> {
        self.fitted().map(|m| m.path)
    }

    /// Fits mean, scale and principal axes to `data`.
    ///
    /// * `data` - shape (n_samples, n_features), dense `Array2<f64>` or sparse `CsMat<f64>`.
    ///   It is not modified.
    /// * `sample_weight` - non-negative weights of length n_samples; normalized to sum to
    ///   one internally. `None` weighs every row equally.
    ///
    /// Any previously fitted state is discarded first, so a failed `fit` leaves the
    /// model unfitted.
    ///
    /// # Errors
    /// Returns an error if the matrix is empty, the weights are malformed or of the wrong
    /// length, or the eigendecomposition fails.
    pub fn fit<M: WeightedMatrix>(
        &mut self,
        data: &M,
        sample_weight: Option<&Array1<f64>>,
    ) -> Result<&mut Self, ThreadSafeStdError> {
        self.state = FitState::Unfitted;
        let n_samples = data.n_rows();
        let n_features = data.n_cols();
        info!(
            "Fitting WeightedEigenPCA on {} samples x {} features ({:?}, scale={}, iterative={}).",
            n_samples,
            n_features,
            self.config.n_components,
            self.config.scale,
            self.config.use_iterative_solver
        );
        let fit_start_time = std::time::Instant::now();

        let build = build_covariance(
            data,
            sample_weight,
            self.config.scale,
            self.config.force_samples_path,
        )?;
        debug!("Built {:?}-path covariance in {:?}", build.path, fit_start_time.elapsed());

        let backend = LinAlgBackendProvider::new();
        let spectrum = reduce(
            &backend,
            &build.covariance,
            self.config.n_components,
            n_samples.min(n_features),
            self.config.solver_mode(),
        )?;

        let components = match (&build.path, &build.weighted_data) {
            (CovariancePath::Samples, Some(weighted_data)) => recover_feature_axes(
                weighted_data,
                &build.centering,
                &build.sqrt_weights,
                &spectrum.eigenvectors,
            )?,
            // Eigenvectors of the feature covariance are already unit-norm axes.
            _ => spectrum.eigenvectors.clone(),
        };

        let explained_variance_ratio = spectrum.explained_variance_ratio();
        info!(
            "Fitted {} components via the {:?} path in {:?}",
            spectrum.n_components,
            build.path,
            fit_start_time.elapsed()
        );

        self.state = FitState::Fitted(FittedModel {
            mean: build.mean,
            scale: build.scale,
            centering: build.centering,
            components,
            explained_variance: spectrum.eigenvalues,
            explained_variance_ratio,
            total_variance: spectrum.total_variance,
            path: build.path,
        });
        Ok(self)
    }

    /// Projects `data` onto the fitted principal axes.
    ///
    /// Computes `X C - u C` (after dividing `X` by the fitted scale, when scaling),
    /// where `C` are the components and `u` the fitted mean, without forming `X - u`.
    ///
    /// # Errors
    /// Returns an error if the model is unfitted or if `data` does not have the
    /// fitted number of features.
    pub fn transform<M: WeightedMatrix>(&self, data: &M) -> Result<Array2<f64>, ThreadSafeStdError> {
        let model = self
            .fitted()
            .ok_or("WeightedEigenPCA model is not fitted. Call fit first.")?;

        let projected = match &model.scale {
            Some(std_dev) => data
                .scale_columns(&std_dev.mapv(|s| 1.0 / s))?
                .dot_dense(&model.components)?,
            None => data.dot_dense(&model.components)?,
        };
        let projected_mean = model.centering.dot(&model.components);
        Ok(projected - &projected_mean)
    }

    /// `fit` followed by `transform` on the same data.
    pub fn fit_transform<M: WeightedMatrix>(
        &mut self,
        data: &M,
        sample_weight: Option<&Array1<f64>>,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        self.fit(data, sample_weight)?.transform(data)
    }

    /// Saves the model (configuration and fitted state) to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if file I/O or serialization fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let file = File::create(path.as_ref())
            .map_err(|e| format!("Failed to create file at {:?}: {}", path.as_ref(), e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| format!("Failed to serialize WeightedEigenPCA model: {}", e))?;
        Ok(())
    }

    /// Loads a model previously saved with [`save_model`](Self::save_model).
    ///
    /// # Errors
    /// Returns an error if file I/O or deserialization fails, or if the fitted
    /// parameters have inconsistent dimensions.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self, ThreadSafeStdError> {
        let file = File::open(path.as_ref())
            .map_err(|e| format!("Failed to open file at {:?}: {}", path.as_ref(), e))?;
        let mut reader = BufReader::new(file);
        let pca: WeightedEigenPCA =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| format!("Failed to deserialize WeightedEigenPCA model: {}", e))?;

        if let Some(model) = pca.fitted() {
            let n_features = model.mean.len();
            let n_components = model.components.ncols();
            let scale_ok = model.scale.as_ref().map_or(true, |s| s.len() == n_features);
            if model.components.nrows() != n_features
                || model.centering.len() != n_features
                || !scale_ok
            {
                return Err(format!(
                    "Loaded model has inconsistent feature dimensions: mean={}, centering={}, components={}",
                    n_features,
                    model.centering.len(),
                    model.components.nrows()
                )
                .into());
            }
            if model.explained_variance.len() != n_components
                || model.explained_variance_ratio.len() != n_components
            {
                return Err(format!(
                    "Loaded model has {} components but {} explained variances.",
                    n_components,
                    model.explained_variance.len()
                )
                .into());
            }
        }
        Ok(pca)
    }
}
