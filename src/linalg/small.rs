//! Closed-form solvers for the tiny linear systems produced by the block
//! engines. Every block pair in the Lyapunov and Fréchet solvers reduces to
//! one of these; they are the innermost kernels and deliberately have no
//! external dependency.
//!
//! All solvers return `None` when the determinant (or a pivot) falls below
//! the caller's epsilon, so callers can decide between failing and falling
//! back to quadrature.

/// Determinant floor used by callers that have no better scale estimate.
pub const DET_EPSILON: f64 = 1e-12;

#[inline]
pub fn det2(a: &[[f64; 2]; 2]) -> f64 {
    a[0][0] * a[1][1] - a[0][1] * a[1][0]
}

/// Solve a 2x2 system by Cramer's rule.
#[inline]
pub fn solve2(a: &[[f64; 2]; 2], b: &[f64; 2], eps: f64) -> Option<[f64; 2]> {
    let det = det2(a);
    if det.abs() < eps {
        return None;
    }
    Some([
        (b[0] * a[1][1] - b[1] * a[0][1]) / det,
        (b[1] * a[0][0] - b[0] * a[1][0]) / det,
    ])
}

#[inline]
pub fn det3(a: &[[f64; 3]; 3]) -> f64 {
    a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
        - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
        + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0])
}

/// Solve a 3x3 system by Cramer's rule.
pub fn solve3(a: &[[f64; 3]; 3], b: &[f64; 3], eps: f64) -> Option<[f64; 3]> {
    let det = det3(a);
    if det.abs() < eps {
        return None;
    }
    let mut x = [0.0; 3];
    for col in 0..3 {
        let mut m = *a;
        for row in 0..3 {
            m[row][col] = b[row];
        }
        x[col] = det3(&m) / det;
    }
    Some(x)
}

/// Solve a 4x4 system by Gaussian elimination with partial pivoting.
pub fn solve4(a: &[[f64; 4]; 4], b: &[f64; 4], eps: f64) -> Option<[f64; 4]> {
    let mut m = *a;
    let mut rhs = *b;

    for k in 0..4 {
        // Pivot selection.
        let mut pivot_row = k;
        let mut pivot_mag = m[k][k].abs();
        for row in (k + 1)..4 {
            let mag = m[row][k].abs();
            if mag > pivot_mag {
                pivot_row = row;
                pivot_mag = mag;
            }
        }
        if pivot_mag < eps {
            return None;
        }
        if pivot_row != k {
            m.swap(k, pivot_row);
            rhs.swap(k, pivot_row);
        }

        for row in (k + 1)..4 {
            let factor = m[row][k] / m[k][k];
            if factor == 0.0 {
                continue;
            }
            for col in k..4 {
                m[row][col] -= factor * m[k][col];
            }
            rhs[row] -= factor * rhs[k];
        }
    }

    let mut x = [0.0; 4];
    for k in (0..4).rev() {
        let mut sum = rhs[k];
        for col in (k + 1)..4 {
            sum -= m[k][col] * x[col];
        }
        x[k] = sum / m[k][k];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn residual2(a: &[[f64; 2]; 2], x: &[f64; 2], b: &[f64; 2]) -> f64 {
        let mut worst: f64 = 0.0;
        for i in 0..2 {
            let r = a[i][0] * x[0] + a[i][1] * x[1] - b[i];
            worst = worst.max(r.abs());
        }
        worst
    }

    #[test]
    fn solve2_round_trip() {
        let a = [[3.0, -1.0], [0.5, 2.0]];
        let b = [1.0, -2.0];
        let x = solve2(&a, &b, DET_EPSILON).unwrap();
        assert!(residual2(&a, &x, &b) < 1e-14);
    }

    #[test]
    fn solve2_rejects_singular() {
        let a = [[1.0, 2.0], [2.0, 4.0]];
        assert!(solve2(&a, &[1.0, 1.0], DET_EPSILON).is_none());
    }

    #[test]
    fn solve3_round_trip() {
        let a = [[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 4.0]];
        let b = [1.0, 2.0, 3.0];
        let x = solve3(&a, &b, DET_EPSILON).unwrap();
        for i in 0..3 {
            let r: f64 = (0..3).map(|j| a[i][j] * x[j]).sum();
            assert_relative_eq!(r, b[i], epsilon = 1e-13);
        }
    }

    #[test]
    fn solve4_round_trip_needs_pivoting() {
        // Leading zero forces a row swap.
        let a = [
            [0.0, 2.0, 1.0, -1.0],
            [1.0, -1.0, 0.5, 2.0],
            [3.0, 0.0, -2.0, 1.0],
            [-1.0, 1.0, 1.0, 1.0],
        ];
        let b = [1.0, 0.0, -1.0, 2.0];
        let x = solve4(&a, &b, DET_EPSILON).unwrap();
        for i in 0..4 {
            let r: f64 = (0..4).map(|j| a[i][j] * x[j]).sum();
            assert_relative_eq!(r, b[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn solve4_rejects_singular() {
        let a = [
            [1.0, 2.0, 3.0, 4.0],
            [2.0, 4.0, 6.0, 8.0],
            [0.0, 1.0, 0.0, 1.0],
            [1.0, 0.0, 1.0, 0.0],
        ];
        assert!(solve4(&a, &[1.0; 4], DET_EPSILON).is_none());
    }
}
