//! Reverse-mode propagation from canonical-parameter adjoints to
//! branch-level adjoints.
//!
//! A branch's outgoing Gaussian message has canonical parameters built from
//! the branch quantities (A, V, V⁻¹, r, b). Given the adjoints of the
//! canonical parameters (∂L/∂J, ∂L/∂η, ∂L/∂c), the closed-form identities
//! below push them back onto the branch quantities.

use crate::linalg::{outer, symmetrize_in_place};
use crate::types::{BranchAdjointSet, BranchCache, CanonicalAdjoint, GradientError};

pub fn backprop_messages(
    cache: &BranchCache,
    adjoint: &CanonicalAdjoint,
) -> Result<BranchAdjointSet, GradientError> {
    let d = cache.dim();
    if adjoint.wrt_precision.nrows() != d || adjoint.wrt_precision.ncols() != d {
        return Err(GradientError::DimensionMismatch {
            context: "backprop_messages precision adjoint",
            expected: d,
            actual: adjoint
                .wrt_precision
                .nrows()
                .max(adjoint.wrt_precision.ncols()),
        });
    }
    if adjoint.wrt_information.len() != d {
        return Err(GradientError::DimensionMismatch {
            context: "backprop_messages information adjoint",
            expected: d,
            actual: adjoint.wrt_information.len(),
        });
    }

    let a = &cache.actualization;
    let v = &cache.branch_variance;
    let v_inv = &cache.branch_precision;
    let r = &cache.residual;
    let g_precision = &adjoint.wrt_precision;
    let g_information = &adjoint.wrt_information;
    let g_constant = adjoint.wrt_constant;

    let v_inv_r = v_inv.dot(r);

    // ∂L/∂A = 2 V⁻¹ A (∂L/∂J) + (V⁻¹ r)(∂L/∂η)ᵀ.
    let wrt_actualization =
        v_inv.dot(a).dot(g_precision).mapv(|x| 2.0 * x) + outer(&v_inv_r, g_information);

    // ∂L/∂V⁻¹ = sym(A (∂L/∂J) Aᵀ + (A ∂L/∂η) rᵀ + ∂L/∂c (−½ r rᵀ + ½ V)).
    let a_g_information = a.dot(g_information);
    let mut wrt_precision = a.dot(g_precision).dot(&a.t())
        + outer(&a_g_information, r)
        + (outer(r, r).mapv(|x| -0.5 * x) + v.mapv(|x| 0.5 * x)).mapv(|x| g_constant * x);
    symmetrize_in_place(&mut wrt_precision);

    // ∂L/∂V = −V⁻¹ (∂L/∂V⁻¹) V⁻¹.
    let wrt_variance = v_inv.dot(&wrt_precision).dot(v_inv).mapv(|x| -x);

    // ∂L/∂r = V⁻ᵀ A (∂L/∂η) − ∂L/∂c V⁻¹ r.
    let wrt_residual =
        v_inv.t().dot(&a_g_information) - v_inv_r.mapv(|x| g_constant * x);

    let wrt_offset = wrt_residual.mapv(|x| -x);

    Ok(BranchAdjointSet {
        wrt_actualization,
        wrt_variance,
        wrt_precision,
        wrt_residual,
        wrt_offset,
    })
}
