//! Kronecker-product formulation of the continuous Lyapunov equation
//! `S X + X Sᵀ = V`.
//!
//! With row-major vectorization the equation becomes
//! `(S ⊗ I + I ⊗ S) vec(X) = vec(V)`, a d²×d² dense system. The operator is
//! formed and LU-factored once per branch and then reused across the d²
//! elementary right-hand sides of the selection-gradient sweep. Cost is
//! O(d⁶); this path is the correctness oracle and the fallback for an
//! unstructured `S`.

use ndarray::{Array1, Array2};

use crate::linalg::faer_ndarray::LuFactor;
use crate::types::GradientError;

pub struct LyapunovOperator {
    dim: usize,
    factor: LuFactor,
}

impl LyapunovOperator {
    /// Form and factor `S ⊗ I + I ⊗ S`.
    ///
    /// Fails when the operator is singular (some pair of eigenvalues of `S`
    /// sums to zero), which means the stationary covariance is not
    /// identifiable from `S` and the diffusion.
    pub fn new(selection: &Array2<f64>) -> Result<Self, GradientError> {
        let d = selection.nrows();
        if selection.ncols() != d {
            return Err(GradientError::DimensionMismatch {
                context: "LyapunovOperator::new",
                expected: d,
                actual: selection.ncols(),
            });
        }

        let n = d * d;
        let mut op = Array2::<f64>::zeros((n, n));
        for i in 0..d {
            for k in 0..d {
                let row = i * d + k;
                for j in 0..d {
                    // vec(S X): S_ij picks row j of X, same column k.
                    op[[row, j * d + k]] += selection[[i, j]];
                    // vec(X Sᵀ): S_kj picks column j of X, same row i.
                    op[[row, i * d + j]] += selection[[k, j]];
                }
            }
        }

        let factor = LuFactor::new(&op).map_err(GradientError::from)?;
        let operator = Self { dim: d, factor };

        // Singularity probe: the LU itself always completes, so check one
        // solve against its residual before accepting the factorization.
        let probe_rhs = Array1::from_elem(n, 1.0);
        let probe = operator
            .factor
            .solve_vec(&probe_rhs)
            .map_err(GradientError::from)?;
        let mut residual = probe_rhs;
        let scale = 1.0 + probe.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        for i in 0..d {
            for k in 0..d {
                let row = i * d + k;
                let mut sum = 0.0;
                for j in 0..d {
                    sum += selection[[i, j]] * probe[j * d + k];
                    sum += selection[[k, j]] * probe[i * d + j];
                }
                residual[row] -= sum;
            }
        }
        let worst = residual.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if worst > 1e-8 * scale {
            return Err(GradientError::SingularSystem {
                context: "Lyapunov operator S⊗I + I⊗S",
                node: None,
            });
        }
        Ok(operator)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Solve `S X + X Sᵀ = V` for `X`.
    pub fn solve(&self, v: &Array2<f64>) -> Result<Array2<f64>, GradientError> {
        let d = self.dim;
        if v.nrows() != d || v.ncols() != d {
            return Err(GradientError::DimensionMismatch {
                context: "LyapunovOperator::solve",
                expected: d,
                actual: v.nrows().max(v.ncols()),
            });
        }
        let rhs = Array1::from_iter(v.iter().copied());
        let sol = self.factor.solve_vec(&rhs).map_err(GradientError::from)?;
        let mut out = Array2::<f64>::zeros((d, d));
        for i in 0..d {
            for j in 0..d {
                out[[i, j]] = sol[i * d + j];
            }
        }
        Ok(out)
    }
}
