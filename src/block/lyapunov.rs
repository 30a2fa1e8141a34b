//! Lyapunov solves exploiting block-diagonal structure.
//!
//! For a block-diagonal A the equation A X + X Aᵀ = C decouples over block
//! pairs: each sub-block X_IJ solves A_I X_IJ + X_IJ A_Jᵀ = C_IJ, a system of
//! at most four unknowns.

use ndarray::Array2;

use super::{Block, BlockStructure, CompressedBlockDiagonal};
use crate::linalg::small::{solve2, solve3, solve4};
use crate::types::GradientError;

/// Solve A X + X Aᵀ = C for a block-diagonal A given in compressed form.
pub fn solve_lyapunov_blocks(
    generator: &CompressedBlockDiagonal,
    structure: &BlockStructure,
    rhs: &Array2<f64>,
    pivot_epsilon: f64,
) -> Result<Array2<f64>, GradientError> {
    let d = generator.dim();
    if rhs.nrows() != d || rhs.ncols() != d {
        return Err(GradientError::DimensionMismatch {
            context: "solve_lyapunov_blocks rhs",
            expected: d,
            actual: rhs.nrows().max(rhs.ncols()),
        });
    }

    let mut x = Array2::zeros((d, d));
    for bi in &structure.blocks {
        for bj in &structure.blocks {
            solve_pair(generator, bi, bj, rhs, &mut x, pivot_epsilon)?;
        }
    }
    Ok(x)
}

fn singular(bi: &Block, bj: &Block) -> GradientError {
    GradientError::SingularBlock {
        i: bi.start,
        j: bj.start,
        rows: bi.size,
        cols: bj.size,
    }
}

fn solve_pair(
    generator: &CompressedBlockDiagonal,
    bi: &Block,
    bj: &Block,
    rhs: &Array2<f64>,
    x: &mut Array2<f64>,
    eps: f64,
) -> Result<(), GradientError> {
    let (i, j) = (bi.start, bj.start);
    match (bi.size, bj.size) {
        (1, 1) => {
            let denom = generator.diag[i] + generator.diag[j];
            if denom.abs() < eps {
                return Err(singular(bi, bj));
            }
            x[[i, j]] = rhs[[i, j]] / denom;
        }
        (1, 2) => {
            // a_i x + x A_jᵀ = v for the 1x2 row x: (a_i I + A_j) x = v.
            let a = generator.block2(j);
            let ai = generator.diag[i];
            let sys = [[ai + a[0][0], a[0][1]], [a[1][0], ai + a[1][1]]];
            let sol = solve2(&sys, &[rhs[[i, j]], rhs[[i, j + 1]]], eps)
                .ok_or_else(|| singular(bi, bj))?;
            x[[i, j]] = sol[0];
            x[[i, j + 1]] = sol[1];
        }
        (2, 1) => {
            // A_i x + x a_j = v for the 2x1 column x: (A_i + a_j I) x = v.
            let a = generator.block2(i);
            let aj = generator.diag[j];
            let sys = [[a[0][0] + aj, a[0][1]], [a[1][0], a[1][1] + aj]];
            let sol = solve2(&sys, &[rhs[[i, j]], rhs[[i + 1, j]]], eps)
                .ok_or_else(|| singular(bi, bj))?;
            x[[i, j]] = sol[0];
            x[[i + 1, j]] = sol[1];
        }
        (2, 2) if i == j => {
            // Symmetric unknown (x11, x12, x22) against a symmetric rhs.
            let [[a, b], [c, dd]] = generator.block2(i);
            let sys = [
                [2.0 * a, 2.0 * b, 0.0],
                [c, a + dd, b],
                [0.0, 2.0 * c, 2.0 * dd],
            ];
            let v = [rhs[[i, i]], rhs[[i, i + 1]], rhs[[i + 1, i + 1]]];
            let sol = solve3(&sys, &v, eps).ok_or_else(|| singular(bi, bj))?;
            x[[i, i]] = sol[0];
            x[[i, i + 1]] = sol[1];
            x[[i + 1, i]] = sol[1];
            x[[i + 1, i + 1]] = sol[2];
        }
        (2, 2) => {
            let ai = generator.block2(i);
            let aj = generator.block2(j);
            let mut sys = [[0.0; 4]; 4];
            for r in 0..2 {
                for c in 0..2 {
                    for p in 0..2 {
                        for q in 0..2 {
                            let mut coeff = 0.0;
                            if q == c {
                                coeff += ai[r][p];
                            }
                            if p == r {
                                coeff += aj[c][q];
                            }
                            sys[r * 2 + c][p * 2 + q] = coeff;
                        }
                    }
                }
            }
            let v = [
                rhs[[i, j]],
                rhs[[i, j + 1]],
                rhs[[i + 1, j]],
                rhs[[i + 1, j + 1]],
            ];
            let sol = solve4(&sys, &v, eps).ok_or_else(|| singular(bi, bj))?;
            x[[i, j]] = sol[0];
            x[[i, j + 1]] = sol[1];
            x[[i + 1, j]] = sol[2];
            x[[i + 1, j + 1]] = sol[3];
        }
        _ => unreachable!("block sizes are 1 or 2"),
    }
    Ok(())
}
