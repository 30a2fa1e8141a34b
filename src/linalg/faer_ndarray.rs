//! Bridge between `ndarray` storage and `faer` dense solvers.
//!
//! The gradient core keeps all user-facing matrices in `ndarray` and drops
//! into `faer` for factorizations: the Kronecker Lyapunov operator and the
//! Padé denominator are non-symmetric, so the workhorse here is a
//! partial-pivot LU.

use faer::linalg::solvers::{PartialPivLu, Solve};
use faer::{Mat, MatMut, MatRef};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("LU solve produced a non-finite solution (matrix is singular or near-singular)")]
    SingularLu,
}

/// Zero-copy `MatRef` view over an ndarray, with an owned compact copy as
/// fallback for layouts faer kernels cannot traverse (non-positive strides).
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live
        // ndarray view with positive strides, or from an owned compact copy
        // stored inside this wrapper, which guarantees validity for the
        // returned view lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];
    // SAFETY: raw parts taken directly from the live ndarray buffer.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

pub fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

/// Partial-pivot LU factorization reused across many right-hand sides.
pub struct LuFactor {
    lu: PartialPivLu<f64>,
    dim: usize,
}

impl LuFactor {
    pub fn new(matrix: &Array2<f64>) -> Result<Self, FaerLinalgError> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        let view = FaerArrayView::new(matrix);
        let lu = PartialPivLu::new(view.as_ref());
        Ok(Self { lu, dim: rows })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Solve `A x = b` for one right-hand side vector.
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Result<Array1<f64>, FaerLinalgError> {
        let mut col = Mat::<f64>::zeros(self.dim, 1);
        for i in 0..self.dim {
            col[(i, 0)] = rhs[i];
        }
        let sol = self.lu.solve(col.as_ref());
        let mut out = Array1::<f64>::zeros(self.dim);
        for i in 0..self.dim {
            let v = sol[(i, 0)];
            if !v.is_finite() {
                return Err(FaerLinalgError::SingularLu);
            }
            out[i] = v;
        }
        Ok(out)
    }

    /// Solve `A X = B` in place.
    pub fn solve_in_place(&self, rhs: &mut Array2<f64>) -> Result<(), FaerLinalgError> {
        let mut view = array2_to_mat_mut(rhs);
        self.lu.solve_in_place(view.as_mut());
        if rhs.iter().any(|v| !v.is_finite()) {
            return Err(FaerLinalgError::SingularLu);
        }
        Ok(())
    }
}

/// Dense inverse through the LU path; the caller owns the decision of
/// whether the matrix is expected to be well conditioned.
pub fn invert(matrix: &Array2<f64>) -> Result<Array2<f64>, FaerLinalgError> {
    let factor = LuFactor::new(matrix)?;
    let mut inv = Array2::<f64>::eye(factor.dim());
    factor.solve_in_place(&mut inv)?;
    Ok(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn lu_solve_round_trip() {
        let a = array![[4.0, 1.0, -2.0], [1.0, 3.0, 0.5], [-2.0, 0.5, 5.0]];
        let b = array![1.0, -1.0, 2.0];
        let factor = LuFactor::new(&a).unwrap();
        let x = factor.solve_vec(&b).unwrap();
        let r = a.dot(&x);
        for i in 0..3 {
            assert_relative_eq!(r[i], b[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn invert_identity() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let inv = invert(&a).unwrap();
        let prod = a.dot(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(prod[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn view_handles_transposed_layout() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let at = a.t();
        let view = FaerArrayView::new(&at);
        let m = view.as_ref();
        assert_eq!(m[(0, 1)], 3.0);
        assert_eq!(m[(1, 0)], 2.0);
    }
}
