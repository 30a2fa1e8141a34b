//! Block-diagonal representation of a diagonalized selection generator.
//!
//! The generator D = R⁻¹ S R is stored in compressed tridiagonal form: a main
//! diagonal plus one super- and one sub-diagonal. Real eigenvalues occupy 1x1
//! blocks; complex conjugate pairs occupy 2x2 blocks where both adjacent
//! off-diagonal entries are nonzero.

use ndarray::Array2;

use crate::linalg::faer_ndarray::invert;
use crate::types::GradientError;

pub mod expm;
pub mod frechet;
pub mod lyapunov;

/// Off-diagonal magnitude below which an entry is treated as structurally
/// zero during block detection.
pub const STRUCTURE_EPSILON: f64 = 1e-14;

/// A block-diagonal matrix stored as three bands.
#[derive(Debug, Clone)]
pub struct CompressedBlockDiagonal {
    pub diag: Vec<f64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

impl CompressedBlockDiagonal {
    pub fn new(diag: Vec<f64>, upper: Vec<f64>, lower: Vec<f64>) -> Result<Self, GradientError> {
        let d = diag.len();
        if upper.len() + 1 != d {
            return Err(GradientError::DimensionMismatch {
                context: "CompressedBlockDiagonal upper band",
                expected: d.saturating_sub(1),
                actual: upper.len(),
            });
        }
        if lower.len() + 1 != d {
            return Err(GradientError::DimensionMismatch {
                context: "CompressedBlockDiagonal lower band",
                expected: d.saturating_sub(1),
                actual: lower.len(),
            });
        }
        Ok(Self { diag, upper, lower })
    }

    pub fn from_dense(m: &Array2<f64>) -> Result<Self, GradientError> {
        let d = m.nrows();
        let diag = (0..d).map(|i| m[[i, i]]).collect();
        let upper = (0..d.saturating_sub(1)).map(|i| m[[i, i + 1]]).collect();
        let lower = (0..d.saturating_sub(1)).map(|i| m[[i + 1, i]]).collect();
        Self::new(diag, upper, lower)
    }

    pub fn dim(&self) -> usize {
        self.diag.len()
    }

    /// Scalar multiple of the generator, same block structure.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            diag: self.diag.iter().map(|v| factor * v).collect(),
            upper: self.upper.iter().map(|v| factor * v).collect(),
            lower: self.lower.iter().map(|v| factor * v).collect(),
        }
    }

    /// Transpose, which swaps the two off-diagonal bands.
    pub fn transposed(&self) -> Self {
        Self {
            diag: self.diag.clone(),
            upper: self.lower.clone(),
            lower: self.upper.clone(),
        }
    }

    /// The 2x2 block starting at diagonal index `start`, as a row-major array.
    pub fn block2(&self, start: usize) -> [[f64; 2]; 2] {
        [
            [self.diag[start], self.upper[start]],
            [self.lower[start], self.diag[start + 1]],
        ]
    }

    pub fn to_dense(&self, structure: &BlockStructure) -> Array2<f64> {
        let d = self.dim();
        let mut out = Array2::zeros((d, d));
        for block in &structure.blocks {
            out[[block.start, block.start]] = self.diag[block.start];
            if block.size == 2 {
                out[[block.start, block.start + 1]] = self.upper[block.start];
                out[[block.start + 1, block.start]] = self.lower[block.start];
                out[[block.start + 1, block.start + 1]] = self.diag[block.start + 1];
            }
        }
        out
    }
}

/// One diagonal block: starting index and size (1 or 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub size: usize,
}

/// The partition of a compressed generator into 1x1 and 2x2 blocks.
#[derive(Debug, Clone)]
pub struct BlockStructure {
    pub blocks: Vec<Block>,
    dim: usize,
}

impl BlockStructure {
    /// Scan the bands left to right. A 2x2 block is declared at index i when
    /// both off-diagonal entries coupling i and i+1 exceed the threshold;
    /// otherwise index i stands alone.
    pub fn detect(generator: &CompressedBlockDiagonal, eps: f64) -> Self {
        let d = generator.dim();
        let mut blocks = Vec::new();
        let mut i = 0;
        while i < d {
            if i + 1 < d
                && generator.upper[i].abs() > eps
                && generator.lower[i].abs() > eps
            {
                blocks.push(Block { start: i, size: 2 });
                i += 2;
            } else {
                blocks.push(Block { start: i, size: 1 });
                i += 1;
            }
        }
        Self { blocks, dim: d }
    }

    /// Build a structure from declared block sizes (each 1 or 2), for
    /// parameterizations that fix the partition up front.
    pub fn from_sizes(sizes: &[usize]) -> Result<Self, GradientError> {
        let mut blocks = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for &size in sizes {
            if size != 1 && size != 2 {
                return Err(GradientError::DimensionMismatch {
                    context: "BlockStructure::from_sizes block size",
                    expected: 2,
                    actual: size,
                });
            }
            blocks.push(Block { start, size });
            start += size;
        }
        Ok(Self { blocks, dim: start })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

/// The eigenbasis pair (R, R⁻¹) relating S = R D R⁻¹.
#[derive(Debug, Clone)]
pub struct BasisChange {
    pub r: Array2<f64>,
    pub r_inv: Array2<f64>,
}

impl BasisChange {
    pub fn new(r: Array2<f64>) -> Result<Self, GradientError> {
        let r_inv = invert(&r)?;
        Ok(Self { r, r_inv })
    }
}
