// Weighted principal component analysis (PCA)

#![doc = include_str!("../README.md")]

pub mod covariance;
pub mod linalg_backends;
pub mod pca;
pub mod spectral;
pub mod weighted_matrix;

pub use covariance::CovariancePath;
pub use linalg_backends::{IterativeSolverConfig, ThreadSafeStdError};
pub use pca::{PcaConfig, WeightedEigenPCA};
pub use spectral::ComponentSelection;
pub use weighted_matrix::WeightedMatrix;

#[cfg(test)]
mod pca_tests;
