//! Chain rules from primitive OU gradients to the free parameters of a
//! concrete model parameterization.
//!
//! Each mapper owns one parameter block and writes exactly `dimension()`
//! values into its slice of the flat output vector. A composite mapper
//! concatenates an ordered list, so the host's registration order fixes the
//! output layout.

use ndarray::Array2;

use crate::block::{BasisChange, BlockStructure, CompressedBlockDiagonal};
use crate::types::{BranchCache, GradientError, PrimitiveGradientSet};

pub trait ParameterMapper: Send + Sync {
    /// Number of free parameters this mapper owns.
    fn dimension(&self) -> usize;

    /// Write the gradient of this mapper's parameters into
    /// `target[offset..offset + dimension()]`.
    fn map(
        &self,
        cache: &BranchCache,
        gradients: &PrimitiveGradientSet,
        target: &mut [f64],
        offset: usize,
    ) -> Result<(), GradientError>;
}

fn check_range(
    offset: usize,
    dimension: usize,
    target_len: usize,
) -> Result<(), GradientError> {
    if offset + dimension > target_len {
        return Err(GradientError::MapperRange {
            offset,
            dimension,
            target_len,
        });
    }
    Ok(())
}

/// Selection parameterization S = R D R⁻¹ where each 2x2 block of D is a
/// rotation-scaling written with a shared diagonal `a`, a radius `r` and an
/// angle `θ`: the off-diagonals are u = r (cos θ − sin θ) above and
/// l = r (cos θ + sin θ) below. 1x1 blocks carry only their `a`.
///
/// Output layout: one gradient per block scale `a`, then one per radius,
/// then one per angle, then the d² entries of R in row-major order.
pub struct CosSinRotationMapper {
    scales: Vec<f64>,
    radii: Vec<f64>,
    angles: Vec<f64>,
    structure: BlockStructure,
    basis: BasisChange,
}

impl CosSinRotationMapper {
    pub fn new(
        scales: Vec<f64>,
        radii: Vec<f64>,
        angles: Vec<f64>,
        block_sizes: &[usize],
        basis: Array2<f64>,
    ) -> Result<Self, GradientError> {
        let structure = BlockStructure::from_sizes(block_sizes)?;
        let pairs = structure.blocks.iter().filter(|b| b.size == 2).count();
        if scales.len() != structure.blocks.len() {
            return Err(GradientError::DimensionMismatch {
                context: "CosSinRotationMapper scales",
                expected: structure.blocks.len(),
                actual: scales.len(),
            });
        }
        if radii.len() != pairs || angles.len() != pairs {
            return Err(GradientError::DimensionMismatch {
                context: "CosSinRotationMapper rotation parameters",
                expected: pairs,
                actual: radii.len().max(angles.len()),
            });
        }
        if basis.nrows() != structure.dim() || basis.ncols() != structure.dim() {
            return Err(GradientError::DimensionMismatch {
                context: "CosSinRotationMapper basis",
                expected: structure.dim(),
                actual: basis.nrows().max(basis.ncols()),
            });
        }
        let basis = BasisChange::new(basis)?;
        Ok(Self {
            scales,
            radii,
            angles,
            structure,
            basis,
        })
    }

    pub fn structure(&self) -> &BlockStructure {
        &self.structure
    }

    pub fn basis(&self) -> &Array2<f64> {
        &self.basis.r
    }

    /// The generator D assembled from the current parameter values.
    pub fn compressed(&self) -> CompressedBlockDiagonal {
        let d = self.structure.dim();
        let mut diag = vec![0.0; d];
        let mut upper = vec![0.0; d.saturating_sub(1)];
        let mut lower = vec![0.0; d.saturating_sub(1)];
        let mut pair = 0;
        for (k, block) in self.structure.blocks.iter().enumerate() {
            diag[block.start] = self.scales[k];
            if block.size == 2 {
                let (r, theta) = (self.radii[pair], self.angles[pair]);
                diag[block.start + 1] = self.scales[k];
                upper[block.start] = r * (theta.cos() - theta.sin());
                lower[block.start] = r * (theta.cos() + theta.sin());
                pair += 1;
            }
        }
        CompressedBlockDiagonal { diag, upper, lower }
    }

    pub fn selection_matrix(&self) -> Array2<f64> {
        self.basis
            .r
            .dot(&self.compressed().to_dense(&self.structure))
            .dot(&self.basis.r_inv)
    }
}

/// Right-multiplication by the transpose of a compressed generator:
/// (W Dᵀ)_ij = W_ij diag_j + W_{i,j+1} upper_j + W_{i,j−1} lower_{j−1}.
fn right_multiply_transposed(
    w: &Array2<f64>,
    d: &CompressedBlockDiagonal,
) -> Array2<f64> {
    let n = d.dim();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            let mut v = w[[i, j]] * d.diag[j];
            if j + 1 < n {
                v += w[[i, j + 1]] * d.upper[j];
            }
            if j > 0 {
                v += w[[i, j - 1]] * d.lower[j - 1];
            }
            out[[i, j]] = v;
        }
    }
    out
}

impl ParameterMapper for CosSinRotationMapper {
    fn dimension(&self) -> usize {
        let d = self.structure.dim();
        self.scales.len() + 2 * self.radii.len() + d * d
    }

    fn map(
        &self,
        cache: &BranchCache,
        gradients: &PrimitiveGradientSet,
        target: &mut [f64],
        offset: usize,
    ) -> Result<(), GradientError> {
        check_range(offset, self.dimension(), target.len())?;
        let r = &self.basis.r;
        let r_inv = &self.basis.r_inv;
        let g_s = &gradients.wrt_selection;

        // Pull ∂L/∂S back into the generator basis: S = R D R⁻¹ with R held
        // fixed gives dS = R dD R⁻¹, hence ∂L/∂D = Rᵀ (∂L/∂S) R⁻ᵀ.
        let g_d = r.t().dot(g_s).dot(&r_inv.t());

        let n_blocks = self.scales.len();
        let n_pairs = self.radii.len();
        let mut pair = 0;
        for (k, block) in self.structure.blocks.iter().enumerate() {
            let s = block.start;
            let mut g_scale = g_d[[s, s]];
            if block.size == 2 {
                g_scale += g_d[[s + 1, s + 1]];
                let (radius, theta) = (self.radii[pair], self.angles[pair]);
                let (g_u, g_l) = (g_d[[s, s + 1]], g_d[[s + 1, s]]);
                let (cos, sin) = (theta.cos(), theta.sin());
                target[offset + n_blocks + pair] =
                    g_u * (cos - sin) + g_l * (cos + sin);
                target[offset + n_blocks + n_pairs + pair] = g_u * (-radius * (sin + cos))
                    + g_l * radius * (cos - sin);
                pair += 1;
            }
            target[offset + k] = g_scale;
        }

        // ∂L/∂R = W Dᵀ − Sᵀ W with W = (∂L/∂S) R⁻ᵀ, from varying R in
        // S = R D R⁻¹ with D held fixed.
        let w = g_s.dot(&r_inv.t());
        let g_r = right_multiply_transposed(&w, &self.compressed())
            - cache.selection.t().dot(&w);
        let base = offset + n_blocks + 2 * n_pairs;
        let n = self.structure.dim();
        for i in 0..n {
            for j in 0..n {
                target[base + i * n + j] = g_r[[i, j]];
            }
        }
        Ok(())
    }
}

/// Diffusion parameterization Σ_ii = d_i, Σ_ij = ρ √(d_i d_j) with one
/// correlation shared by all off-diagonal entries. Output layout: the d
/// diagonal gradients, then the correlation gradient.
pub struct CompoundSymmetricMapper {
    diagonals: Vec<f64>,
    correlation: f64,
}

impl CompoundSymmetricMapper {
    pub fn new(diagonals: Vec<f64>, correlation: f64) -> Self {
        Self {
            diagonals,
            correlation,
        }
    }

    pub fn covariance(&self) -> Array2<f64> {
        let d = self.diagonals.len();
        Array2::from_shape_fn((d, d), |(i, j)| {
            if i == j {
                self.diagonals[i]
            } else {
                self.correlation * (self.diagonals[i] * self.diagonals[j]).sqrt()
            }
        })
    }
}

impl ParameterMapper for CompoundSymmetricMapper {
    fn dimension(&self) -> usize {
        self.diagonals.len() + 1
    }

    fn map(
        &self,
        _cache: &BranchCache,
        gradients: &PrimitiveGradientSet,
        target: &mut [f64],
        offset: usize,
    ) -> Result<(), GradientError> {
        check_range(offset, self.dimension(), target.len())?;
        let g = gradients
            .wrt_diffusion
            .as_ref()
            .ok_or(GradientError::MissingDiffusionGradient)?;
        let d = self.diagonals.len();
        if g.nrows() != d {
            return Err(GradientError::DimensionMismatch {
                context: "CompoundSymmetricMapper diffusion gradient",
                expected: d,
                actual: g.nrows(),
            });
        }

        for k in 0..d {
            let mut acc = g[[k, k]];
            for j in 0..d {
                if j != k {
                    let scale = self.correlation * (self.diagonals[j]).sqrt()
                        / (2.0 * self.diagonals[k].sqrt());
                    acc += (g[[k, j]] + g[[j, k]]) * scale;
                }
            }
            target[offset + k] = acc;
        }

        let mut g_rho = 0.0;
        for i in 0..d {
            for j in 0..d {
                if i != j {
                    g_rho += g[[i, j]] * (self.diagonals[i] * self.diagonals[j]).sqrt();
                }
            }
        }
        target[offset + d] = g_rho;
        Ok(())
    }
}

/// Identity mapper for the optimum vector μ.
pub struct OptimumMapper {
    dim: usize,
}

impl OptimumMapper {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl ParameterMapper for OptimumMapper {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn map(
        &self,
        _cache: &BranchCache,
        gradients: &PrimitiveGradientSet,
        target: &mut [f64],
        offset: usize,
    ) -> Result<(), GradientError> {
        check_range(offset, self.dim, target.len())?;
        if gradients.wrt_optimum.len() != self.dim {
            return Err(GradientError::DimensionMismatch {
                context: "OptimumMapper optimum gradient",
                expected: self.dim,
                actual: gradients.wrt_optimum.len(),
            });
        }
        for (k, v) in gradients.wrt_optimum.iter().enumerate() {
            target[offset + k] = *v;
        }
        Ok(())
    }
}

/// Concatenation of mappers in registration order.
pub struct CompositeMapper {
    mappers: Vec<Box<dyn ParameterMapper>>,
}

impl CompositeMapper {
    pub fn new(mappers: Vec<Box<dyn ParameterMapper>>) -> Self {
        Self { mappers }
    }
}

impl ParameterMapper for CompositeMapper {
    fn dimension(&self) -> usize {
        self.mappers.iter().map(|m| m.dimension()).sum()
    }

    fn map(
        &self,
        cache: &BranchCache,
        gradients: &PrimitiveGradientSet,
        target: &mut [f64],
        offset: usize,
    ) -> Result<(), GradientError> {
        check_range(offset, self.dimension(), target.len())?;
        let mut cursor = offset;
        for mapper in &self.mappers {
            mapper.map(cache, gradients, target, cursor)?;
            cursor += mapper.dimension();
        }
        Ok(())
    }
}
