//! Backprop strategies from branch-level adjoints to primitive OU
//! parameters.
//!
//! Both strategies share the same contract: consume a BranchCache and a
//! BranchAdjointSet, produce gradients with respect to S, Σ_stat, μ and
//! optionally the diffusion Σ. `GeneralBackprop` works on an arbitrary dense
//! S through the augmented-matrix Fréchet derivative and a Kronecker-system
//! Lyapunov solve; it scales as O(d⁶) per branch and doubles as the
//! correctness oracle. `BlockDiagonalizableBackprop` exploits a known
//! eigen-decomposition S = R D R⁻¹ with block-diagonal D and runs in O(d²)
//! blockwise arithmetic plus dense basis changes.

use ndarray::{Array1, Array2};

use crate::block::frechet::frechet_block_diagonal;
use crate::block::lyapunov::solve_lyapunov_blocks;
use crate::block::{BasisChange, BlockStructure, CompressedBlockDiagonal, STRUCTURE_EPSILON};
use crate::linalg::expm::expm_frechet_adjoint;
use crate::linalg::kron::LyapunovOperator;
use crate::linalg::{frobenius_inner, outer, symmetrize_in_place};
use crate::types::{BranchAdjointSet, BranchCache, GradientConfig, GradientError, PrimitiveGradientSet};

/// Strategy choice, resolved once per model from the structural properties
/// of the selection parameterization.
#[derive(Debug, Clone)]
pub enum PrimitiveBackprop {
    General(GeneralBackprop),
    BlockDiagonalizable(BlockDiagonalizableBackprop),
}

impl PrimitiveBackprop {
    pub fn gradients(
        &self,
        cache: &BranchCache,
        adjoints: &BranchAdjointSet,
    ) -> Result<PrimitiveGradientSet, GradientError> {
        match self {
            Self::General(s) => s.gradients(cache, adjoints),
            Self::BlockDiagonalizable(s) => s.gradients(cache, adjoints),
        }
    }
}

/// The direction matrix for the exponential contributions to ∂L/∂S, summing
/// the actualization, offset and variance channels. The adjoint of the
/// Fréchet derivative is linear in its direction, so one application covers
/// all three.
fn exponential_direction(
    cache: &BranchCache,
    adjoints: &BranchAdjointSet,
) -> Array2<f64> {
    let a_stat = cache.actualization.dot(&cache.stationary_covariance);
    &adjoints.wrt_actualization
        - &outer(&adjoints.wrt_offset, &cache.optimum)
        - &(adjoints.wrt_variance.dot(&a_stat) + adjoints.wrt_variance.t().dot(&a_stat))
}

fn common_gradients(
    cache: &BranchCache,
    adjoints: &BranchAdjointSet,
    config: &GradientConfig,
) -> Result<(Array1<f64>, Array2<f64>), GradientError> {
    let d = cache.dim();
    if d != config.dim {
        return Err(GradientError::DimensionMismatch {
            context: "strategy trait dimension",
            expected: config.dim,
            actual: d,
        });
    }
    if adjoints.wrt_actualization.nrows() != d {
        return Err(GradientError::DimensionMismatch {
            context: "strategy adjoint dimension",
            expected: d,
            actual: adjoints.wrt_actualization.nrows(),
        });
    }

    // ∂L/∂μ = (I − A)ᵀ ∂L/∂b.
    let wrt_optimum = &adjoints.wrt_offset
        - &cache.actualization.t().dot(&adjoints.wrt_offset);

    // ∂L/∂Σ_stat, direct part: ∂L/∂V − Aᵀ (∂L/∂V) A.
    let wrt_stationary = &adjoints.wrt_variance
        - &cache
            .actualization
            .t()
            .dot(&adjoints.wrt_variance)
            .dot(&cache.actualization);

    Ok((wrt_optimum, wrt_stationary))
}

/// Dense-matrix strategy for an unconstrained selection matrix.
#[derive(Debug, Clone)]
pub struct GeneralBackprop {
    config: GradientConfig,
}

impl GeneralBackprop {
    pub fn new(config: GradientConfig) -> Self {
        Self { config }
    }

    pub fn gradients(
        &self,
        cache: &BranchCache,
        adjoints: &BranchAdjointSet,
    ) -> Result<PrimitiveGradientSet, GradientError> {
        let d = cache.dim();
        let (wrt_optimum, wrt_stationary) =
            common_gradients(cache, adjoints, &self.config)?;

        // Exponential channel: ∂L/∂S += −t Adj(−tS, G).
        let minus_ts = cache.selection.mapv(|v| -cache.length * v);
        let direction = exponential_direction(cache, adjoints);
        let mut wrt_selection = expm_frechet_adjoint(&minus_ts, &direction)?
            .mapv(|v| -cache.length * v);

        // Implicit channel through Σ_stat: one Kronecker factorization,
        // one solve per entry of S.
        let lyapunov = LyapunovOperator::new(&cache.selection)?;
        let stat = &cache.stationary_covariance;
        for i in 0..d {
            for j in 0..d {
                let mut rhs = Array2::zeros((d, d));
                for k in 0..d {
                    rhs[[i, k]] -= stat[[j, k]];
                    rhs[[k, i]] -= stat[[k, j]];
                }
                let x = lyapunov.solve(&rhs)?;
                wrt_selection[[i, j]] += frobenius_inner(&x, &wrt_stationary);
            }
        }

        let wrt_diffusion = if self.config.compute_diffusion_gradient {
            let mut g = Array2::zeros((d, d));
            for p in 0..d {
                for q in 0..d {
                    let mut rhs = Array2::zeros((d, d));
                    rhs[[p, q]] = 1.0;
                    let x = lyapunov.solve(&rhs)?;
                    g[[p, q]] = frobenius_inner(&x, &wrt_stationary);
                }
            }
            symmetrize_in_place(&mut g);
            Some(g)
        } else {
            None
        };

        Ok(PrimitiveGradientSet {
            wrt_selection,
            wrt_stationary,
            wrt_diffusion,
            wrt_optimum,
        })
    }
}

/// Blockwise strategy for S = R D R⁻¹ with a block-diagonal generator D.
#[derive(Debug, Clone)]
pub struct BlockDiagonalizableBackprop {
    config: GradientConfig,
    generator: CompressedBlockDiagonal,
    structure: BlockStructure,
    basis: BasisChange,
}

impl BlockDiagonalizableBackprop {
    /// Structure detection happens once here; callers must rebuild the
    /// strategy if the parameterization's sparsity pattern changes.
    pub fn new(
        config: GradientConfig,
        generator: CompressedBlockDiagonal,
        basis: Array2<f64>,
    ) -> Result<Self, GradientError> {
        if generator.dim() != config.dim {
            return Err(GradientError::DimensionMismatch {
                context: "block strategy generator dimension",
                expected: config.dim,
                actual: generator.dim(),
            });
        }
        let structure = BlockStructure::detect(&generator, STRUCTURE_EPSILON);
        let basis = BasisChange::new(basis)?;
        Ok(Self {
            config,
            generator,
            structure,
            basis,
        })
    }

    pub fn generator(&self) -> &CompressedBlockDiagonal {
        &self.generator
    }

    pub fn selection_matrix(&self) -> Array2<f64> {
        self.basis
            .r
            .dot(&self.generator.to_dense(&self.structure))
            .dot(&self.basis.r_inv)
    }

    /// Adj(−tS, X) mapped through the eigenbasis: with −tSᵀ = R⁻ᵀ(−tDᵀ)Rᵀ,
    /// the identity DExp(P M P⁻¹)[X] = P DExp(M)[P⁻¹ X P] P⁻¹ applies with
    /// P = R⁻ᵀ.
    fn exponential_adjoint(
        &self,
        length: f64,
        x: &Array2<f64>,
    ) -> Result<Array2<f64>, GradientError> {
        let r = &self.basis.r;
        let r_inv = &self.basis.r_inv;
        let scaled = self.generator.scaled(-length).transposed();
        let inner = r.t().dot(x).dot(&r_inv.t());
        let core = frechet_block_diagonal(
            &scaled,
            &self.structure,
            &inner,
            self.config.singular_epsilon,
        )?;
        Ok(r_inv.t().dot(&core).dot(&r.t()))
    }

    pub fn gradients(
        &self,
        cache: &BranchCache,
        adjoints: &BranchAdjointSet,
    ) -> Result<PrimitiveGradientSet, GradientError> {
        let (wrt_optimum, wrt_stationary) =
            common_gradients(cache, adjoints, &self.config)?;
        let r = &self.basis.r;
        let r_inv = &self.basis.r_inv;

        // Exponential channel.
        let direction = exponential_direction(cache, adjoints);
        let mut wrt_selection = self
            .exponential_adjoint(cache.length, &direction)?
            .mapv(|v| -cache.length * v);

        // Implicit channel: solve Dᵀ Ỹ + Ỹ D = −G̃ with G̃ = Rᵀ G R in the
        // generator basis, then Y = R⁻ᵀ Ỹ R⁻¹ and
        // ∂L/∂S += Y Σ_stat + Yᵀ Σ_stat.
        let g_tilde = r.t().dot(&wrt_stationary).dot(r).mapv(|v| -v);
        let y_tilde = solve_lyapunov_blocks(
            &self.generator.transposed(),
            &self.structure,
            &g_tilde,
            self.config.pivot_epsilon,
        )?;
        let y = r_inv.t().dot(&y_tilde).dot(r_inv);
        let y_stat = y.dot(&cache.stationary_covariance);
        let yt_stat = y.t().dot(&cache.stationary_covariance);
        wrt_selection += &(&y_stat + &yt_stat);

        let wrt_diffusion = if self.config.compute_diffusion_gradient {
            // ∂L/∂Σ is the adjoint Lyapunov solution itself, Z = −Y.
            let mut g = y.mapv(|v| -v);
            symmetrize_in_place(&mut g);
            Some(g)
        } else {
            None
        };

        Ok(PrimitiveGradientSet {
            wrt_selection,
            wrt_stationary,
            wrt_diffusion,
            wrt_optimum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1, Array2};

    fn scalar_adjoints() -> BranchAdjointSet {
        BranchAdjointSet {
            wrt_actualization: array![[1.0]],
            wrt_variance: array![[0.0]],
            wrt_precision: array![[0.0]],
            wrt_residual: array![0.0],
            wrt_offset: array![0.0],
        }
    }

    // Scalar OU with only the actualization channel active:
    // ∂L/∂S = −t e^{−St}.
    #[test]
    fn scalar_exponential_channel_general() {
        let cache = BranchCache::from_model(
            &array![[0.5]],
            &array![[1.0]],
            &array![0.0],
            2.0,
            &array![0.3],
        )
        .unwrap();
        let strategy = GeneralBackprop::new(GradientConfig::new(1));
        let out = strategy.gradients(&cache, &scalar_adjoints()).unwrap();
        assert_relative_eq!(
            out.wrt_selection[[0, 0]],
            -2.0 * (-1.0f64).exp(),
            epsilon = 1e-10
        );
        assert_relative_eq!(out.wrt_optimum[0], 0.0, epsilon = 1e-14);
    }

    #[test]
    fn scalar_exponential_channel_block() {
        let cache = BranchCache::from_model(
            &array![[0.5]],
            &array![[1.0]],
            &array![0.0],
            2.0,
            &array![0.3],
        )
        .unwrap();
        let generator =
            CompressedBlockDiagonal::new(vec![0.5], vec![], vec![]).unwrap();
        let strategy = BlockDiagonalizableBackprop::new(
            GradientConfig::new(1),
            generator,
            array![[1.0]],
        )
        .unwrap();
        let out = strategy.gradients(&cache, &scalar_adjoints()).unwrap();
        assert_relative_eq!(
            out.wrt_selection[[0, 0]],
            -2.0 * (-1.0f64).exp(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn diffusion_gradient_is_symmetric() {
        let s = array![[1.0, 0.2], [-0.1, 1.5]];
        let sigma = array![[1.0, 0.3], [0.3, 0.9]];
        let cache = BranchCache::from_model(
            &s,
            &sigma,
            &array![0.1, -0.2],
            0.8,
            &array![0.5, 0.5],
        )
        .unwrap();
        let adjoints = BranchAdjointSet {
            wrt_actualization: array![[0.3, -0.1], [0.2, 0.4]],
            wrt_variance: array![[0.5, 0.1], [0.1, -0.3]],
            wrt_precision: Array2::zeros((2, 2)),
            wrt_residual: Array1::zeros(2),
            wrt_offset: array![0.2, -0.6],
        };
        let strategy = GeneralBackprop::new(
            GradientConfig::new(2).with_diffusion_gradient(true),
        );
        let out = strategy.gradients(&cache, &adjoints).unwrap();
        let g = out.wrt_diffusion.unwrap();
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(g[[i, j]], g[[j, i]], epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let cache = BranchCache::from_model(
            &array![[0.5]],
            &array![[1.0]],
            &array![0.0],
            1.0,
            &array![0.0],
        )
        .unwrap();
        let strategy = GeneralBackprop::new(GradientConfig::new(2));
        assert!(strategy.gradients(&cache, &scalar_adjoints()).is_err());
    }
}
