use crate::covariance::build_covariance;
use crate::linalg_backends::IterativeSolverConfig;
use crate::{ComponentSelection, CovariancePath, PcaConfig, WeightedEigenPCA};
use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn generate_random_data(n_samples: usize, n_features: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::from_shape_fn((n_samples, n_features), |_| rng.gen_range(0.0..10.0))
}

fn generate_random_weights(n_samples: usize, seed: u64) -> Array1<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array1::from_shape_fn(n_samples, |_| rng.gen_range(1..10) as f64)
}

/// Asserts two matrices agree column by column, allowing each column to flip sign.
fn assert_columns_close_up_to_sign(left: &Array2<f64>, right: &Array2<f64>, tol: f64, context: &str) {
    assert_eq!(left.dim(), right.dim(), "Shape mismatch for {}", context);
    for c in 0..left.ncols() {
        let l = left.column(c);
        let r = right.column(c);
        let same = l.iter().zip(r.iter()).all(|(a, b)| (a - b).abs() < tol);
        let flipped = l.iter().zip(r.iter()).all(|(a, b)| (a + b).abs() < tol);
        assert!(
            same || flipped,
            "Column {} differs beyond sign for {}:\nleft={}\nright={}",
            c,
            context,
            l,
            r
        );
    }
}

#[cfg(test)]
mod pca_tests {
    use super::*;

    #[test]
    fn test_fit_transform_matches_fit_then_transform() {
        let data = generate_random_data(12, 5, 7);
        let weights = generate_random_weights(12, 8);

        let mut first = WeightedEigenPCA::default();
        let fused = first.fit_transform(&data, Some(&weights)).unwrap();

        let mut second = WeightedEigenPCA::default();
        second.fit(&data, Some(&weights)).unwrap();
        let separate = second.transform(&data).unwrap();

        assert_eq!(fused, separate);
    }

    #[test]
    fn test_refit_is_idempotent() {
        let data = generate_random_data(6, 9, 11);
        let weights = generate_random_weights(6, 12);
        let mut pca = WeightedEigenPCA::new(PcaConfig::default().with_n_components(5usize));

        pca.fit(&data, Some(&weights)).unwrap();
        let mean = pca.mean().unwrap().clone();
        let scale = pca.scale().unwrap().clone();
        let components = pca.components().unwrap().clone();
        let variance = pca.explained_variance().unwrap().clone();

        pca.fit(&data, Some(&weights)).unwrap();
        assert_eq!(pca.mean().unwrap(), &mean);
        assert_eq!(pca.scale().unwrap(), &scale);
        assert_eq!(pca.components().unwrap(), &components);
        assert_eq!(pca.explained_variance().unwrap(), &variance);
    }

    #[test]
    fn test_refit_overwrites_previous_model() {
        let mut pca = WeightedEigenPCA::new(PcaConfig::default().with_scale(false));
        pca.fit(&generate_random_data(10, 3, 1), None).unwrap();
        assert_eq!(pca.components().unwrap().nrows(), 3);

        pca.fit(&generate_random_data(10, 5, 2), None).unwrap();
        assert_eq!(pca.components().unwrap().nrows(), 5);
        assert_eq!(pca.mean().unwrap().len(), 5);
    }

    #[test]
    fn test_components_unit_norm_and_orthogonal_features_path() {
        let data = generate_random_data(20, 5, 21);
        let weights = generate_random_weights(20, 22);
        let mut pca = WeightedEigenPCA::default();
        pca.fit(&data, Some(&weights)).unwrap();
        assert_eq!(pca.covariance_path(), Some(CovariancePath::Features));

        let components = pca.components().unwrap();
        let gram = components.t().dot(components);
        assert_abs_diff_eq!(gram, Array2::<f64>::eye(5), epsilon = 1e-10);
    }

    #[test]
    fn test_components_unit_norm_and_orthogonal_samples_path() {
        let data = generate_random_data(6, 15, 31);
        let weights = generate_random_weights(6, 32);
        // A centered 6-row matrix has rank at most 5.
        let mut pca = WeightedEigenPCA::new(PcaConfig::default().with_n_components(5usize));
        pca.fit(&data, Some(&weights)).unwrap();
        assert_eq!(pca.covariance_path(), Some(CovariancePath::Samples));

        let components = pca.components().unwrap();
        assert_eq!(components.dim(), (15, 5));
        let gram = components.t().dot(components);
        assert_abs_diff_eq!(gram, Array2::<f64>::eye(5), epsilon = 1e-8);
    }

    #[test]
    fn test_variance_ratio_sums_to_one_for_all_components() {
        for (n_samples, n_features) in [(15, 4), (4, 15), (7, 7)] {
            let data = generate_random_data(n_samples, n_features, 41);
            let mut pca = WeightedEigenPCA::default();
            pca.fit(&data, Some(&generate_random_weights(n_samples, 42))).unwrap();
            let ratio = pca.explained_variance_ratio().unwrap();
            assert_eq!(ratio.len(), n_samples.min(n_features));
            assert_abs_diff_eq!(ratio.sum(), 1.0, epsilon = 1e-10);
            // Scaled data has unit variance per feature.
            assert_abs_diff_eq!(pca.total_variance().unwrap(), n_features as f64, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_truncated_ratio_uses_total_variance() {
        let data = generate_random_data(30, 6, 51);
        let mut all = WeightedEigenPCA::default();
        all.fit(&data, None).unwrap();
        let mut top2 = WeightedEigenPCA::new(PcaConfig::default().with_n_components(2usize));
        top2.fit(&data, None).unwrap();

        let ratio = top2.explained_variance_ratio().unwrap();
        assert_eq!(ratio.len(), 2);
        assert!(ratio.sum() < 1.0);
        assert_abs_diff_eq!(top2.total_variance().unwrap(), all.total_variance().unwrap(), epsilon = 1e-12);
        for k in 0..2 {
            assert_abs_diff_eq!(ratio[k], all.explained_variance_ratio().unwrap()[k], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_variance_threshold_selects_smallest_exceeding_count() {
        let data = generate_random_data(40, 8, 61);
        let mut all = WeightedEigenPCA::default();
        all.fit(&data, None).unwrap();
        let mut cumulative = 0.0;
        let mut expected = 0;
        for &r in all.explained_variance_ratio().unwrap().iter() {
            cumulative += r;
            expected += 1;
            if cumulative > 0.8 {
                break;
            }
        }

        let mut pca = WeightedEigenPCA::new(PcaConfig::default().with_n_components(0.8));
        pca.fit(&data, None).unwrap();
        assert_eq!(pca.n_components(), Some(expected));
        assert!(pca.explained_variance_ratio().unwrap().sum() > 0.8);
    }

    #[test]
    fn test_count_exceeding_dimensions_is_clamped() {
        let data = generate_random_data(10, 3, 71);
        let mut pca = WeightedEigenPCA::new(PcaConfig::default().with_n_components(50usize));
        pca.fit(&data, None).unwrap();
        assert_eq!(pca.n_components(), Some(3));
        assert_eq!(pca.to_string(), "WeightedEigenPCA(3)");
    }

    #[test]
    fn test_path_equivalence() {
        for scale in [false, true] {
            let data = generate_random_data(12, 4, 81);
            let weights = generate_random_weights(12, 82);

            let mut features = WeightedEigenPCA::new(PcaConfig::default().with_scale(scale));
            features.fit(&data, Some(&weights)).unwrap();
            let mut samples = WeightedEigenPCA::new(
                PcaConfig::default().with_scale(scale).with_force_samples_path(true),
            );
            samples.fit(&data, Some(&weights)).unwrap();

            assert_eq!(features.covariance_path(), Some(CovariancePath::Features));
            assert_eq!(samples.covariance_path(), Some(CovariancePath::Samples));
            assert_abs_diff_eq!(
                features.explained_variance().unwrap(),
                samples.explained_variance().unwrap(),
                epsilon = 1e-9
            );
            assert_abs_diff_eq!(
                features.total_variance().unwrap(),
                samples.total_variance().unwrap(),
                epsilon = 1e-9
            );
            assert_columns_close_up_to_sign(
                features.components().unwrap(),
                samples.components().unwrap(),
                1e-7,
                "components across covariance paths",
            );
            assert_columns_close_up_to_sign(
                &features.transform(&data).unwrap(),
                &samples.transform(&data).unwrap(),
                1e-6,
                "scores across covariance paths",
            );
        }
    }

    #[test]
    fn test_iterative_solver_with_full_block_is_exact() {
        let data = generate_random_data(60, 12, 91);
        let weights = generate_random_weights(60, 92);
        let base = PcaConfig::default().with_n_components(3usize);

        let mut exact = WeightedEigenPCA::new(base.clone());
        exact.fit(&data, Some(&weights)).unwrap();
        let mut iterative = WeightedEigenPCA::new(
            base.with_iterative_solver(true).with_iterative_config(IterativeSolverConfig {
                oversampling: 9,
                power_iterations: 10,
                seed: 3,
            }),
        );
        iterative.fit(&data, Some(&weights)).unwrap();

        // With oversampling the block spans all 12 dimensions, so the Ritz pairs are exact.
        assert_abs_diff_eq!(
            exact.explained_variance().unwrap(),
            iterative.explained_variance().unwrap(),
            epsilon = 1e-9
        );
        assert_columns_close_up_to_sign(
            exact.components().unwrap(),
            iterative.components().unwrap(),
            1e-7,
            "iterative vs exact components",
        );
    }

    /// Rank-five signal with decaying strength plus small noise.
    fn generate_low_rank_data(n_samples: usize, n_features: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let strengths = [10.0, 5.0, 2.5, 1.0, 0.5];
        let factors = Array2::from_shape_fn((n_samples, strengths.len()), |(_, j)| {
            strengths[j] * rng.gen_range(-1.0..1.0)
        });
        let loadings = Array2::from_shape_fn((strengths.len(), n_features), |_| rng.gen_range(-1.0..1.0));
        let noise = Array2::from_shape_fn((n_samples, n_features), |_| rng.gen_range(-0.01..0.01));
        factors.dot(&loadings) + noise + 3.0
    }

    fn assert_iterative_fit_matches_exact(n_samples: usize, n_features: usize, expected: CovariancePath) {
        let data = generate_low_rank_data(n_samples, n_features, 95);
        let weights = generate_random_weights(n_samples, 96);
        let base = PcaConfig::default().with_n_components(3usize);
        let solver = IterativeSolverConfig::default();
        // The subspace block must be strictly smaller than the decomposed matrix.
        assert!(3 + solver.oversampling < n_samples.min(n_features));

        let mut exact = WeightedEigenPCA::new(base.clone());
        let exact_scores = exact.fit_transform(&data, Some(&weights)).unwrap();
        let mut iterative = WeightedEigenPCA::new(base.with_iterative_solver(true));
        let iterative_scores = iterative.fit_transform(&data, Some(&weights)).unwrap();
        assert_eq!(iterative.covariance_path(), Some(expected));
        assert_eq!(iterative.n_components(), Some(3));

        let exact_variance = exact.explained_variance().unwrap();
        assert_abs_diff_eq!(
            iterative.explained_variance().unwrap(),
            exact_variance,
            epsilon = 1e-8 * exact_variance[0]
        );
        assert_abs_diff_eq!(
            iterative.total_variance().unwrap(),
            exact.total_variance().unwrap(),
            epsilon = 1e-9
        );

        let components = iterative.components().unwrap();
        let gram = components.t().dot(components);
        assert_abs_diff_eq!(gram, Array2::<f64>::eye(3), epsilon = 1e-8);
        assert_columns_close_up_to_sign(
            components,
            exact.components().unwrap(),
            1e-6,
            "iterative vs exact components",
        );
        assert_columns_close_up_to_sign(
            &iterative_scores,
            &exact_scores,
            1e-5,
            "iterative vs exact scores",
        );
    }

    #[test]
    fn test_truncated_iterative_solver_on_samples_path() {
        assert_iterative_fit_matches_exact(40, 200, CovariancePath::Samples);
    }

    #[test]
    fn test_truncated_iterative_solver_on_features_path() {
        assert_iterative_fit_matches_exact(300, 40, CovariancePath::Features);
    }

    #[test]
    fn test_all_components_on_wide_data_ends_with_null_direction() {
        let data = generate_random_data(5, 12, 97);
        let weights = generate_random_weights(5, 98);
        let mut pca = WeightedEigenPCA::default();
        pca.fit(&data, Some(&weights)).unwrap();
        assert_eq!(pca.n_components(), Some(5));

        // Centering removes one dimension: the last eigenvalue is zero up to rounding,
        // and only the first n_samples - 1 axes are orthonormal principal directions.
        let variance = pca.explained_variance().unwrap();
        assert!(variance[4].abs() < 1e-10 * pca.total_variance().unwrap());
        let leading = pca.components().unwrap().slice(ndarray::s![.., ..4]).to_owned();
        assert_abs_diff_eq!(leading.t().dot(&leading), Array2::<f64>::eye(4), epsilon = 1e-8);
    }

    #[test]
    fn test_weights_are_normalized_internally() {
        let data = generate_random_data(9, 4, 101);
        let weights = generate_random_weights(9, 102);
        let mut a = WeightedEigenPCA::default();
        a.fit(&data, Some(&weights)).unwrap();
        let mut b = WeightedEigenPCA::default();
        b.fit(&data, Some(&(&weights * 17.0))).unwrap();
        assert_abs_diff_eq!(a.mean().unwrap(), b.mean().unwrap(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            a.explained_variance().unwrap(),
            b.explained_variance().unwrap(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_uniform_weights_match_no_weights() {
        let data = generate_random_data(9, 4, 111);
        let mut a = WeightedEigenPCA::default();
        a.fit(&data, None).unwrap();
        let mut b = WeightedEigenPCA::default();
        b.fit(&data, Some(&Array1::ones(9))).unwrap();
        assert_abs_diff_eq!(
            a.explained_variance().unwrap(),
            b.explained_variance().unwrap(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_weighted_mean_and_scale() {
        let data = array![[1.0, 10.0], [3.0, 20.0], [5.0, 60.0]];
        let weights = array![2.0, 1.0, 1.0];
        let mut pca = WeightedEigenPCA::default();
        pca.fit(&data, Some(&weights)).unwrap();

        let expected_mean = array![2.5, 25.0];
        assert_abs_diff_eq!(pca.mean().unwrap(), &expected_mean, epsilon = 1e-12);
        // Weighted variance of column 0: 0.5*2.25 + 0.25*0.25 + 0.25*6.25 = 2.75
        let expected_scale = array![2.75_f64.sqrt(), (0.5 * 225.0 + 0.25 * 25.0 + 0.25 * 1225.0_f64).sqrt()];
        assert_abs_diff_eq!(pca.scale().unwrap(), &expected_scale, epsilon = 1e-10);
    }

    #[test]
    fn test_transformed_training_scores_are_weighted_centered() {
        let data = generate_random_data(10, 3, 121);
        let weights = generate_random_weights(10, 122);
        let mut pca = WeightedEigenPCA::default();
        let scores = pca.fit_transform(&data, Some(&weights)).unwrap();
        let normalized = &weights / weights.sum();
        let weighted_score_mean = normalized.dot(&scores);
        assert_abs_diff_eq!(weighted_score_mean, Array1::<f64>::zeros(3), epsilon = 1e-10);
        // Weighted second moment of each score column is its explained variance.
        let second_moment = normalized.dot(&scores.mapv(|v| v * v));
        assert_abs_diff_eq!(&second_moment, pca.explained_variance().unwrap(), epsilon = 1e-9);
    }

    #[test]
    fn test_transform_unfitted_model_errors() {
        let pca = WeightedEigenPCA::default();
        assert!(!pca.is_fitted());
        assert!(pca.components().is_none());
        assert_eq!(pca.to_string(), "WeightedEigenPCA()");
        let err = pca.transform(&array![[1.0, 2.0]]).unwrap_err();
        assert!(err.to_string().contains("not fitted"));
    }

    #[test]
    fn test_transform_feature_mismatch_errors() {
        let mut pca = WeightedEigenPCA::default();
        pca.fit(&generate_random_data(8, 3, 131), None).unwrap();
        assert!(pca.transform(&generate_random_data(2, 4, 132)).is_err());
    }

    #[test]
    fn test_fit_rejects_bad_weights_and_resets_state() {
        let data = generate_random_data(5, 2, 141);
        let mut pca = WeightedEigenPCA::default();
        pca.fit(&data, None).unwrap();
        assert!(pca.is_fitted());

        assert!(pca.fit(&data, Some(&array![1.0, 2.0])).is_err());
        assert!(!pca.is_fitted());
        assert!(pca.fit(&data, Some(&Array1::zeros(5))).is_err());
        assert!(pca.fit(&Array2::<f64>::zeros((0, 3)), None).is_err());
    }

    #[test]
    fn test_zero_variance_column_propagates_non_finite_values() {
        let data = array![[1.0, 5.0], [2.0, 5.0], [4.0, 5.0]];
        let build = build_covariance(&data, None, true, false).unwrap();
        let scale = build.scale.unwrap();
        assert!(scale[1] == 0.0 || scale[1].is_nan());
        assert!(!build.centering[1].is_finite());
        assert!(build.covariance.iter().any(|v| !v.is_finite()));
    }

    #[test]
    fn test_input_is_not_modified() {
        let data = generate_random_data(7, 3, 151);
        let copy = data.clone();
        let mut pca = WeightedEigenPCA::default();
        pca.fit_transform(&data, None).unwrap();
        assert_eq!(data, copy);
    }
}

#[cfg(test)]
mod model_persistence_tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_save_and_load_fitted_model() {
        let data = generate_random_data(10, 4, 161);
        let weights = generate_random_weights(10, 162);
        let mut pca = WeightedEigenPCA::new(PcaConfig::default().with_n_components(0.9));
        pca.fit(&data, Some(&weights)).unwrap();

        let file = NamedTempFile::new().unwrap();
        pca.save_model(file.path()).unwrap();
        let loaded = WeightedEigenPCA::load_model(file.path()).unwrap();

        assert_eq!(loaded.config(), pca.config());
        assert_eq!(loaded.n_components(), pca.n_components());
        assert_eq!(loaded.covariance_path(), pca.covariance_path());
        assert_eq!(loaded.transform(&data).unwrap(), pca.transform(&data).unwrap());
    }

    #[test]
    fn test_save_and_load_unfitted_model() {
        let pca = WeightedEigenPCA::new(PcaConfig::default().with_n_components(ComponentSelection::Count(2)));
        let file = NamedTempFile::new().unwrap();
        pca.save_model(file.path()).unwrap();
        let loaded = WeightedEigenPCA::load_model(file.path()).unwrap();
        assert!(!loaded.is_fitted());
        assert_eq!(loaded.config().n_components, ComponentSelection::Count(2));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WeightedEigenPCA::load_model(dir.path().join("missing.bin")).is_err());
    }
}
