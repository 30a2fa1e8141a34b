//! Agreement between the dense-oracle strategy and the blockwise strategy
//! on selection matrices that admit both representations, plus an
//! end-to-end run of the branch pipeline.

use approx::assert_relative_eq;
use ndarray::{array, Array1, Array2};
use ou_grad::{
    BlockDiagonalizableBackprop, BranchAdjointSet, BranchCache, BranchGradient,
    BroadcastAdjointProvider, CanonicalAdjoint, CompositeMapper, CompoundSymmetricMapper,
    CosSinRotationMapper, GeneralBackprop, GradientConfig, MapCacheProvider, OptimumMapper,
    ParameterMapper, PrimitiveBackprop,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_adjoints(rng: &mut StdRng, d: usize) -> BranchAdjointSet {
    BranchAdjointSet {
        wrt_actualization: Array2::from_shape_fn((d, d), |_| rng.random_range(-1.0..1.0)),
        wrt_variance: Array2::from_shape_fn((d, d), |_| rng.random_range(-1.0..1.0)),
        wrt_precision: Array2::zeros((d, d)),
        wrt_residual: Array1::zeros(d),
        wrt_offset: Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0)),
    }
}

fn rotation_mapper(seed: u64) -> CosSinRotationMapper {
    // One real block, one rotation-scaling pair, one more real block.
    let mut rng = StdRng::seed_from_u64(seed);
    let basis = Array2::from_shape_fn((4, 4), |(i, j)| {
        if i == j {
            1.0
        } else {
            rng.random_range(-0.25..0.25)
        }
    });
    CosSinRotationMapper::new(
        vec![0.6, 1.1, 2.0],
        vec![0.5],
        vec![0.8],
        &[1, 2, 1],
        basis,
    )
    .unwrap()
}

#[test]
fn strategies_agree_on_block_expressible_selection() {
    let mut rng = StdRng::seed_from_u64(211);
    let mapper = rotation_mapper(300);
    let selection = mapper.selection_matrix();
    let d = 4;

    let raw = Array2::from_shape_fn((d, d), |_| rng.random_range(-0.4..0.4));
    let diffusion = raw.dot(&raw.t()) + Array2::<f64>::eye(d);
    let optimum = Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0));
    let observation = Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0));
    let cache =
        BranchCache::from_model(&selection, &diffusion, &optimum, 0.8, &observation)
            .unwrap();

    let config = GradientConfig::new(d).with_diffusion_gradient(true);
    let general = GeneralBackprop::new(config);
    let block = BlockDiagonalizableBackprop::new(
        config,
        mapper.compressed(),
        mapper.basis().clone(),
    )
    .unwrap();

    for _ in 0..3 {
        let adjoints = random_adjoints(&mut rng, d);
        let dense = general.gradients(&cache, &adjoints).unwrap();
        let blocked = block.gradients(&cache, &adjoints).unwrap();

        for i in 0..d {
            assert_relative_eq!(
                dense.wrt_optimum[i],
                blocked.wrt_optimum[i],
                epsilon = 1e-10,
                max_relative = 1e-8
            );
            for j in 0..d {
                assert_relative_eq!(
                    dense.wrt_selection[[i, j]],
                    blocked.wrt_selection[[i, j]],
                    epsilon = 1e-8,
                    max_relative = 1e-8
                );
                assert_relative_eq!(
                    dense.wrt_stationary[[i, j]],
                    blocked.wrt_stationary[[i, j]],
                    epsilon = 1e-10,
                    max_relative = 1e-8
                );
                assert_relative_eq!(
                    dense.wrt_diffusion.as_ref().unwrap()[[i, j]],
                    blocked.wrt_diffusion.as_ref().unwrap()[[i, j]],
                    epsilon = 1e-8,
                    max_relative = 1e-8
                );
            }
        }
    }
}

#[test]
fn strategies_agree_across_branch_lengths_and_frequencies() {
    // Fast rotations over long branches push ‖tS‖ well past the small-norm
    // regime; both strategies must still match to tight tolerance.
    let mut rng = StdRng::seed_from_u64(409);
    let d = 2;
    let config = GradientConfig::new(d).with_diffusion_gradient(true);
    let general = GeneralBackprop::new(config);

    for &omega in &[0.5, 1.0, 2.0] {
        let selection = array![[1.0, omega], [-omega, 1.0]];
        let generator = ou_grad::CompressedBlockDiagonal::new(
            vec![1.0, 1.0],
            vec![omega],
            vec![-omega],
        )
        .unwrap();
        let block =
            BlockDiagonalizableBackprop::new(config, generator, Array2::<f64>::eye(d)).unwrap();

        for &t in &[0.5, 2.0, 4.0] {
            let raw = Array2::from_shape_fn((d, d), |_| rng.random_range(-0.4..0.4));
            let diffusion = raw.dot(&raw.t()) + Array2::<f64>::eye(d);
            let optimum = Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0));
            let observation = Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0));
            let cache =
                BranchCache::from_model(&selection, &diffusion, &optimum, t, &observation)
                    .unwrap();
            let adjoints = random_adjoints(&mut rng, d);
            let dense = general.gradients(&cache, &adjoints).unwrap();
            let blocked = block.gradients(&cache, &adjoints).unwrap();

            for i in 0..d {
                assert_relative_eq!(
                    dense.wrt_optimum[i],
                    blocked.wrt_optimum[i],
                    epsilon = 1e-10,
                    max_relative = 1e-8
                );
                for j in 0..d {
                    assert_relative_eq!(
                        dense.wrt_selection[[i, j]],
                        blocked.wrt_selection[[i, j]],
                        epsilon = 1e-8,
                        max_relative = 1e-8
                    );
                    assert_relative_eq!(
                        dense.wrt_stationary[[i, j]],
                        blocked.wrt_stationary[[i, j]],
                        epsilon = 1e-10,
                        max_relative = 1e-8
                    );
                    assert_relative_eq!(
                        dense.wrt_diffusion.as_ref().unwrap()[[i, j]],
                        blocked.wrt_diffusion.as_ref().unwrap()[[i, j]],
                        epsilon = 1e-8,
                        max_relative = 1e-8
                    );
                }
            }
        }
    }
}

#[test]
fn scalar_closed_form() {
    // d = 1, S = 0.5, t = 2, only the actualization adjoint active:
    // dL/dS = -t exp(-S t) = -2 e^{-1}.
    let cache = BranchCache::from_model(
        &array![[0.5]],
        &array![[1.0]],
        &array![0.0],
        2.0,
        &array![0.0],
    )
    .unwrap();
    let adjoints = BranchAdjointSet {
        wrt_actualization: array![[1.0]],
        wrt_variance: array![[0.0]],
        wrt_precision: array![[0.0]],
        wrt_residual: array![0.0],
        wrt_offset: array![0.0],
    };
    let expected = -2.0 * (-1.0f64).exp();

    let general = GeneralBackprop::new(GradientConfig::new(1));
    let dense = general.gradients(&cache, &adjoints).unwrap();
    assert_relative_eq!(dense.wrt_selection[[0, 0]], expected, epsilon = 1e-10);

    let block = BlockDiagonalizableBackprop::new(
        GradientConfig::new(1),
        ou_grad::CompressedBlockDiagonal::new(vec![0.5], vec![], vec![]).unwrap(),
        array![[1.0]],
    )
    .unwrap();
    let blocked = block.gradients(&cache, &adjoints).unwrap();
    assert_relative_eq!(blocked.wrt_selection[[0, 0]], expected, epsilon = 1e-9);
}

#[test]
fn pipeline_strategies_agree_end_to_end() {
    let mut rng = StdRng::seed_from_u64(223);
    let mapper_for_block = rotation_mapper(300);
    let selection = mapper_for_block.selection_matrix();
    let generator = mapper_for_block.compressed();
    let basis = mapper_for_block.basis().clone();
    let d = 4;

    let sigma_diagonals = vec![1.4, 0.9, 1.1, 2.0];
    let rho = 0.3;
    let diffusion = CompoundSymmetricMapper::new(sigma_diagonals.clone(), rho).covariance();
    let optimum = Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0));

    let composite = |mapper: CosSinRotationMapper| {
        CompositeMapper::new(vec![
            Box::new(mapper) as Box<dyn ParameterMapper>,
            Box::new(CompoundSymmetricMapper::new(sigma_diagonals.clone(), rho)),
            Box::new(OptimumMapper::new(d)),
        ])
    };

    let mut caches = MapCacheProvider::new();
    for node in 1..5 {
        let observation = Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0));
        caches.insert(
            node,
            BranchCache::from_model(
                &selection,
                &diffusion,
                &optimum,
                0.3 * node as f64,
                &observation,
            )
            .unwrap(),
        );
    }
    let raw = Array2::from_shape_fn((d, d), |_| rng.random_range(-0.5..0.5));
    let adjoints = BroadcastAdjointProvider::new(CanonicalAdjoint {
        wrt_precision: (&raw + &raw.t()).mapv(|v| 0.5 * v),
        wrt_information: Array1::from_shape_fn(d, |_| rng.random_range(-1.0..1.0)),
        wrt_constant: rng.random_range(-1.0..1.0),
    });

    let config = GradientConfig::new(d).with_diffusion_gradient(true);
    let dense_pipeline = BranchGradient::new(
        PrimitiveBackprop::General(GeneralBackprop::new(config)),
        Box::new(composite(rotation_mapper(300))),
        0,
    );
    let block_pipeline = BranchGradient::new(
        PrimitiveBackprop::BlockDiagonalizable(
            BlockDiagonalizableBackprop::new(config, generator, basis).unwrap(),
        ),
        Box::new(composite(rotation_mapper(300))),
        0,
    );

    // 3 block scales + radius + angle + 16 basis entries + 4 diffusion
    // diagonals + correlation + 4 optimum entries.
    assert_eq!(dense_pipeline.dimension(), 3 + 2 + 16 + 5 + 4);

    let nodes = vec![0, 1, 2, 3, 4];
    let dense_out = dense_pipeline
        .gradients_for_branches(&nodes, &caches, &adjoints)
        .unwrap();
    let block_out = block_pipeline
        .gradients_for_branches(&nodes, &caches, &adjoints)
        .unwrap();

    assert!(dense_out[0].iter().all(|v| *v == 0.0));
    assert!(dense_out[1].iter().any(|v| v.abs() > 1e-12));
    for (row_dense, row_block) in dense_out.iter().zip(&block_out) {
        for (a, b) in row_dense.iter().zip(row_block) {
            assert_relative_eq!(a, b, epsilon = 1e-8, max_relative = 1e-7);
        }
    }
}
