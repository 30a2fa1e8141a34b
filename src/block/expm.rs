//! Closed-form exponentials of 1x1 and 2x2 blocks.

use ndarray::Array2;

use super::{BlockStructure, CompressedBlockDiagonal};

/// Discriminant magnitude below which the 2x2 exponential uses its
/// degenerate-eigenvalue limit.
const DEGENERATE_EPSILON: f64 = 1e-12;

/// exp of one 2x2 block [[a, b], [c, d]].
///
/// With m = (a+d)/2 and delta^2 = ((a-d)/2)^2 + bc, the exponential is
/// e^m (cosh(delta) I + sinh(delta)/delta (M - m I)), where the hyperbolic
/// pair becomes a trigonometric pair for negative delta^2 and the ratio
/// tends to 1 as delta^2 tends to 0.
pub fn exp_block2(block: &[[f64; 2]; 2]) -> [[f64; 2]; 2] {
    let a = block[0][0];
    let b = block[0][1];
    let c = block[1][0];
    let d = block[1][1];
    let m = 0.5 * (a + d);
    let half_gap = 0.5 * (a - d);
    let disc = half_gap * half_gap + b * c;

    let (cosh_like, ratio) = if disc > DEGENERATE_EPSILON {
        let delta = disc.sqrt();
        (delta.cosh(), delta.sinh() / delta)
    } else if disc < -DEGENERATE_EPSILON {
        let omega = (-disc).sqrt();
        (omega.cos(), omega.sin() / omega)
    } else {
        // sinh(x)/x and sin(x)/x both tend to 1.
        (1.0, 1.0)
    };

    let scale = m.exp();
    [
        [
            scale * (cosh_like + ratio * half_gap),
            scale * ratio * b,
        ],
        [
            scale * ratio * c,
            scale * (cosh_like - ratio * half_gap),
        ],
    ]
}

/// Dense exponential of a block-diagonal generator, block by block.
pub fn expm_block_diagonal(
    generator: &CompressedBlockDiagonal,
    structure: &BlockStructure,
) -> Array2<f64> {
    let d = generator.dim();
    let mut out = Array2::zeros((d, d));
    for block in &structure.blocks {
        let i = block.start;
        if block.size == 1 {
            out[[i, i]] = generator.diag[i].exp();
        } else {
            let e = exp_block2(&generator.block2(i));
            out[[i, i]] = e[0][0];
            out[[i, i + 1]] = e[0][1];
            out[[i + 1, i]] = e[1][0];
            out[[i + 1, i + 1]] = e[1][1];
        }
    }
    out
}
