//! Data model of the per-branch gradient core: cached forward quantities,
//! incoming canonical adjoints, and the transient adjoint/gradient sets
//! produced while walking one branch.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::linalg::expm::expm;
use crate::linalg::faer_ndarray::{invert, FaerLinalgError};
use crate::linalg::kron::LyapunovOperator;
use crate::linalg::symmetrize_in_place;

#[derive(Debug, Error)]
pub enum GradientError {
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("singular linear system in {context} (node {node:?})")]
    SingularSystem {
        context: &'static str,
        node: Option<usize>,
    },
    #[error("singular {rows}x{cols} block system at block pair ({i}, {j})")]
    SingularBlock {
        i: usize,
        j: usize,
        rows: usize,
        cols: usize,
    },
    #[error("mapper writes outside its registered range: offset {offset} + dimension {dimension} > target length {target_len}")]
    MapperRange {
        offset: usize,
        dimension: usize,
        target_len: usize,
    },
    #[error("parameter mapper requires the diffusion gradient but the strategy was not configured to compute it")]
    MissingDiffusionGradient,
    #[error("dense factorization failed: {0}")]
    Faer(#[from] FaerLinalgError),
}

/// Engine-level configuration for one gradient model.
///
/// The epsilons are fixed scales, not tunables per call: `singular_epsilon`
/// guards the closed-form block Fréchet systems (below it the quadrature
/// fallback engages) and `pivot_epsilon` floors the small-solver pivots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GradientConfig {
    pub dim: usize,
    /// Whether ∂L/∂Σ (diffusion) is computed in addition to ∂L/∂Σ_stat.
    pub compute_diffusion_gradient: bool,
    pub singular_epsilon: f64,
    pub pivot_epsilon: f64,
}

impl GradientConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            compute_diffusion_gradient: false,
            singular_epsilon: 1e-10,
            pivot_epsilon: 1e-12,
        }
    }

    pub fn with_diffusion_gradient(mut self, on: bool) -> Self {
        self.compute_diffusion_gradient = on;
        self
    }
}

/// Immutable forward quantities for one branch, produced by the forward OU
/// integration. Mutual consistency of the fields under the forward equations
/// is the forward pass's contract and is not re-verified here.
#[derive(Debug, Clone)]
pub struct BranchCache {
    /// Branch length t > 0.
    pub length: f64,
    /// Actualization A = exp(−S t).
    pub actualization: Array2<f64>,
    /// Branch variance V = Σ_stat − A Σ_stat Aᵀ (symmetric PSD).
    pub branch_variance: Array2<f64>,
    /// V⁻¹.
    pub branch_precision: Array2<f64>,
    /// Stationary covariance Σ_stat solving S Σ + Σ Sᵀ = Σ_diffusion.
    pub stationary_covariance: Array2<f64>,
    /// Branch offset b = (I − A) μ.
    pub offset: Array1<f64>,
    /// Residual r = y − b for the branch's (pseudo-)observation y.
    pub residual: Array1<f64>,
    /// Selection strength S (model-global).
    pub selection: Array2<f64>,
    /// Long-term optimum μ (model-global).
    pub optimum: Array1<f64>,
}

impl BranchCache {
    pub fn dim(&self) -> usize {
        self.optimum.len()
    }

    /// Run the forward OU integration for one branch from primitive model
    /// parameters: selection S, diffusion Σ, optimum μ, branch length t and
    /// observation y. Intended for hosts and tests that need caches
    /// consistent by construction.
    pub fn from_model(
        selection: &Array2<f64>,
        diffusion: &Array2<f64>,
        optimum: &Array1<f64>,
        length: f64,
        observation: &Array1<f64>,
    ) -> Result<Self, GradientError> {
        let d = optimum.len();
        if selection.nrows() != d || selection.ncols() != d {
            return Err(GradientError::DimensionMismatch {
                context: "BranchCache::from_model selection",
                expected: d,
                actual: selection.nrows().max(selection.ncols()),
            });
        }
        if diffusion.nrows() != d || diffusion.ncols() != d {
            return Err(GradientError::DimensionMismatch {
                context: "BranchCache::from_model diffusion",
                expected: d,
                actual: diffusion.nrows().max(diffusion.ncols()),
            });
        }
        if observation.len() != d {
            return Err(GradientError::DimensionMismatch {
                context: "BranchCache::from_model observation",
                expected: d,
                actual: observation.len(),
            });
        }

        let stationary = LyapunovOperator::new(selection)?.solve(diffusion)?;

        let actualization = expm(&selection.mapv(|v| -length * v))?;
        let mut branch_variance = &stationary
            - &actualization.dot(&stationary).dot(&actualization.t());
        symmetrize_in_place(&mut branch_variance);
        let branch_precision = invert(&branch_variance)?;

        let offset = optimum - &actualization.dot(optimum);
        let residual = observation - &offset;

        Ok(Self {
            length,
            actualization,
            branch_variance,
            branch_precision,
            stationary_covariance: stationary,
            offset,
            residual,
            selection: selection.clone(),
            optimum: optimum.clone(),
        })
    }
}

/// Adjoints of one node's canonical Gaussian parameters (precision J,
/// information vector η, normalizing constant c), produced externally.
#[derive(Debug, Clone)]
pub struct CanonicalAdjoint {
    pub wrt_precision: Array2<f64>,
    pub wrt_information: Array1<f64>,
    pub wrt_constant: f64,
}

/// Branch-level adjoints, produced by message backprop and consumed within
/// the same branch's gradient computation.
#[derive(Debug, Clone)]
pub struct BranchAdjointSet {
    pub wrt_actualization: Array2<f64>,
    pub wrt_variance: Array2<f64>,
    pub wrt_precision: Array2<f64>,
    pub wrt_residual: Array1<f64>,
    pub wrt_offset: Array1<f64>,
}

/// Gradients with respect to the primitive OU parameters for one branch.
#[derive(Debug, Clone)]
pub struct PrimitiveGradientSet {
    pub wrt_selection: Array2<f64>,
    pub wrt_stationary: Array2<f64>,
    /// Only present when `GradientConfig::compute_diffusion_gradient` is set.
    pub wrt_diffusion: Option<Array2<f64>>,
    pub wrt_optimum: Array1<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn from_model_scalar_ou() {
        // d=1: Σ_stat = σ²/(2s), A = e^{-st}, V = Σ_stat (1 - e^{-2st}).
        let s = array![[0.5]];
        let sigma = array![[1.0]];
        let mu = array![0.0];
        let y = array![1.0];
        let t = 2.0;
        let cache = BranchCache::from_model(&s, &sigma, &mu, t, &y).unwrap();
        assert_relative_eq!(cache.stationary_covariance[[0, 0]], 1.0, epsilon = 1e-12);
        assert_relative_eq!(cache.actualization[[0, 0]], (-1.0f64).exp(), epsilon = 1e-12);
        let v = 1.0 - (-2.0f64).exp();
        assert_relative_eq!(cache.branch_variance[[0, 0]], v, epsilon = 1e-12);
        assert_relative_eq!(cache.branch_precision[[0, 0]], 1.0 / v, epsilon = 1e-12);
        assert_relative_eq!(cache.residual[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn from_model_consistency_2d() {
        let s = array![[1.0, 0.3], [-0.2, 1.4]];
        let sigma = array![[1.0, 0.2], [0.2, 0.8]];
        let mu = array![0.5, -0.5];
        let y = array![1.0, 1.0];
        let cache = BranchCache::from_model(&s, &sigma, &mu, 0.7, &y).unwrap();

        // Lyapunov residual of the stationary covariance.
        let g = &cache.stationary_covariance;
        let back = s.dot(g) + g.dot(&s.t());
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(back[[i, j]], sigma[[i, j]], epsilon = 1e-10);
            }
        }
        // V⁻¹ V = I.
        let prod = cache.branch_precision.dot(&cache.branch_variance);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(prod[[i, j]], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn from_model_rejects_bad_dims() {
        let s = array![[1.0, 0.0], [0.0, 1.0]];
        let sigma = array![[1.0]];
        let mu = array![0.0, 0.0];
        let y = array![0.0, 0.0];
        assert!(BranchCache::from_model(&s, &sigma, &mu, 1.0, &y).is_err());
    }
}
