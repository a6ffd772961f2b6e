// src/covariance.rs

use crate::linalg_backends::ThreadSafeStdError;
use crate::weighted_matrix::WeightedMatrix;
use log::{debug, trace};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Which covariance-like matrix was eigendecomposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovariancePath {
    /// `n_features x n_features` covariance `Xw^T Xw - mean^T mean`.
    /// Its eigenvectors are the principal axes directly.
    Features,
    /// `n_samples x n_samples` weighted, centered Gram matrix.
    /// Its eigenvectors live in sample space and are lifted back to feature space.
    Samples,
}

impl CovariancePath {
    /// The features path is used only when samples outnumber features and the
    /// samples path has not been forced.
    pub fn choose(n_samples: usize, n_features: usize, force_samples_path: bool) -> Self {
        if !force_samples_path && n_samples > n_features {
            CovariancePath::Features
        } else {
            CovariancePath::Samples
        }
    }
}

/// Everything the covariance builder hands to the later fit stages.
#[derive(Debug)]
pub struct CovarianceBuild<M> {
    /// Symmetric PSD matrix, `n x n` on the features path and `m x m` on the samples path.
    pub covariance: Array2<f64>,
    /// Weighted mean of the unscaled input.
    pub mean: Array1<f64>,
    /// Weighted mean of the data as it enters the covariance (`mean / scale` when scaling).
    pub centering: Array1<f64>,
    /// Weighted standard deviation, present only when scaling is enabled.
    pub scale: Option<Array1<f64>>,
    /// Square roots of the normalized weights.
    pub sqrt_weights: Array1<f64>,
    /// `diag(sqrt_weights) X` (scaled), retained only on the samples path where the
    /// eigenvectors must be lifted back into feature space.
    pub weighted_data: Option<M>,
    pub path: CovariancePath,
}

/// Normalizes the sample weights to sum to one. `None` yields uniform weights `1/m`.
pub fn normalize_weights(
    n_samples: usize,
    sample_weight: Option<&Array1<f64>>,
) -> Result<Array1<f64>, ThreadSafeStdError> {
    let Some(raw_weights) = sample_weight else {
        return Ok(Array1::from_elem(n_samples, 1.0 / n_samples as f64));
    };
    if raw_weights.len() != n_samples {
        return Err(format!(
            "sample_weight has length {} but the data matrix has {} rows.",
            raw_weights.len(),
            n_samples
        )
        .into());
    }
    if raw_weights.iter().any(|&w| !w.is_finite() || w < 0.0) {
        return Err("sample_weight must contain only finite, non-negative values.".into());
    }
    let total = raw_weights.sum();
    if total <= 0.0 {
        return Err("sample_weight must not be all zero.".into());
    }
    Ok(raw_weights / total)
}

/// Builds the weighted, optionally scaled, centered covariance-like matrix without
/// ever materializing `X - mean`.
///
/// With `w` the normalized weights and `Wr = sqrt(w)`:
/// - mean `u = w^T X`
/// - scale `s = sqrt(w^T X^2 - u^2)`, and `X <- X / s`, `u <- u / s` when scaling
/// - features path: `C = (Wr X)^T (Wr X) - u^T u`
/// - samples path: `C = Wr (X X^T + u u^T - X u^T - (X u^T)^T) Wr^T`
///
/// Both are the Gram matrix of `Wr (X - u)` on one side or the other, so they
/// share their nonzero spectrum.
pub fn build_covariance<M: WeightedMatrix>(
    data: &M,
    sample_weight: Option<&Array1<f64>>,
    scale: bool,
    force_samples_path: bool,
) -> Result<CovarianceBuild<M>, ThreadSafeStdError> {
    let n_samples = data.n_rows();
    let n_features = data.n_cols();
    if n_samples == 0 || n_features == 0 {
        return Err("Input data matrix has zero samples or zero features.".into());
    }

    let weights = normalize_weights(n_samples, sample_weight)?;
    let mean = data.weighted_column_sums(&weights)?;

    // The second-moment identity keeps sparse input sparse: no `X - mean` is formed.
    // A constant column gives a zero scale here, and the division below yields inf/NaN.
    let (scaled_data, scale_vector) = if scale {
        let second_moment = data.squared().weighted_column_sums(&weights)?;
        let std_dev = (&second_moment - &mean.mapv(|v| v * v)).mapv(f64::sqrt);
        let scaled = data.scale_columns(&std_dev.mapv(|s| 1.0 / s))?;
        (Some(scaled), Some(std_dev))
    } else {
        (None, None)
    };
    let working_data: &M = scaled_data.as_ref().unwrap_or(data);
    let centering = match &scale_vector {
        Some(std_dev) => &mean / std_dev,
        None => mean.clone(),
    };

    let sqrt_weights = weights.mapv(f64::sqrt);
    let path = CovariancePath::choose(n_samples, n_features, force_samples_path);
    debug!(
        "Building {:?}-path covariance ({} samples, {} features, scale={}).",
        path, n_samples, n_features, scale
    );

    let centering_col = centering.view().insert_axis(Axis(1));
    let (covariance, weighted_data) = match path {
        CovariancePath::Features => {
            let weighted = working_data.scale_rows(&sqrt_weights)?;
            let mut covariance = weighted.gram_columns();
            covariance -= &centering_col.dot(&centering_col.t());
            (covariance, None)
        }
        CovariancePath::Samples => {
            let data_dot_mean = working_data.dot_dense(&centering_col.to_owned())?;
            let mut covariance = working_data.gram_rows();
            covariance += centering.dot(&centering);
            covariance -= &data_dot_mean;
            covariance -= &data_dot_mean.t();

            let sqrt_weights_col = sqrt_weights.view().insert_axis(Axis(1));
            covariance *= &sqrt_weights_col;
            covariance *= &sqrt_weights_col.t();

            let weighted = working_data.scale_rows(&sqrt_weights)?;
            (covariance, Some(weighted))
        }
    };
    trace!("Covariance matrix shape: {:?}", covariance.dim());

    Ok(CovarianceBuild {
        covariance,
        mean,
        centering,
        scale: scale_vector,
        sqrt_weights,
        weighted_data,
        path,
    })
}
