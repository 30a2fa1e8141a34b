//! Dense linear-algebra kernels shared by both backprop strategies.

pub mod expm;
pub mod faer_ndarray;
pub mod kron;
pub mod small;

use ndarray::{Array1, Array2};

/// Outer product `u vᵀ`.
pub fn outer(u: &Array1<f64>, v: &Array1<f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((u.len(), v.len()));
    for i in 0..u.len() {
        for j in 0..v.len() {
            out[[i, j]] = u[i] * v[j];
        }
    }
    out
}

/// Frobenius inner product `⟨A, B⟩ = tr(Aᵀ B)`.
pub fn frobenius_inner(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Replace `m` with `(M + Mᵀ)/2`.
pub fn symmetrize_in_place(m: &mut Array2<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[[i, j]] + m[[j, i]]);
            m[[i, j]] = avg;
            m[[j, i]] = avg;
        }
    }
}
