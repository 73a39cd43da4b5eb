//! Small dense linear algebra on flattened row-major matrices.

/// Cholesky factor `L` (lower triangular, row-major) of a symmetric positive
/// definite `n × n` matrix, such that `A = L × Lᵀ`.
#[derive(Debug, Clone)]
pub struct Cholesky {
    n: usize,
    lower: Vec<f64>,
}

/// Pivots below this fraction of the largest diagonal entry are treated as
/// zero.
const RELATIVE_PIVOT_TOLERANCE: f64 = 1e-13;

impl Cholesky {
    /// Factor `matrix`. Returns `None` if the matrix is not (numerically)
    /// positive definite or holds non-finite values.
    pub fn factor(matrix: &[f64], n: usize) -> Option<Self> {
        if matrix.len() != n * n || matrix.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let scale = (0..n)
            .map(|i| matrix[i * n + i].abs())
            .fold(0.0_f64, f64::max);
        let tolerance = scale * RELATIVE_PIVOT_TOLERANCE;

        let mut lower = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = matrix[i * n + j];
                for k in 0..j {
                    sum -= lower[i * n + k] * lower[j * n + k];
                }

                if i == j {
                    if sum <= tolerance || !sum.is_finite() {
                        return None;
                    }
                    lower[i * n + i] = sum.sqrt();
                } else {
                    lower[i * n + j] = sum / lower[j * n + j];
                }
            }
        }

        Some(Self { n, lower })
    }

    /// Solve `A × x = b`.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;

        // forward substitution: L × y = b
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for k in 0..i {
                sum -= self.lower[i * n + k] * y[k];
            }
            y[i] = sum / self.lower[i * n + i];
        }

        // back substitution: Lᵀ × x = y
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = y[i];
            for k in (i + 1)..n {
                sum -= self.lower[k * n + i] * x[k];
            }
            x[i] = sum / self.lower[i * n + i];
        }

        x
    }

    /// Inverse of `A`, row-major.
    pub fn inverse(&self) -> Vec<f64> {
        let n = self.n;
        let mut inverse = vec![0.0; n * n];
        let mut unit = vec![0.0; n];

        for col in 0..n {
            unit.iter_mut().for_each(|v| *v = 0.0);
            unit[col] = 1.0;
            let column = self.solve(&unit);
            for (row, value) in column.into_iter().enumerate() {
                inverse[row * n + col] = value;
            }
        }

        inverse
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `matrix × vector` for a square row-major matrix.
pub fn mat_vec(matrix: &[f64], vector: &[f64]) -> Vec<f64> {
    let n = vector.len();
    (0..n)
        .map(|i| dot(&matrix[i * n..(i + 1) * n], vector))
        .collect()
}

/// `vᵀ × M × v`.
pub fn quadratic_form(matrix: &[f64], vector: &[f64]) -> f64 {
    dot(vector, &mat_vec(matrix, vector))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_spd_system() {
        // [[4, 2], [2, 3]] × [1, 2] = [8, 8]
        let matrix = [4.0, 2.0, 2.0, 3.0];
        let chol = Cholesky::factor(&matrix, 2).unwrap();
        let x = chol.solve(&[8.0, 8.0]);

        assert!((x[0] - 1.0).abs() < 1e-12, "x0={}", x[0]);
        assert!((x[1] - 2.0).abs() < 1e-12, "x1={}", x[1]);
    }

    #[test]
    fn test_inverse_times_matrix_is_identity() {
        let matrix = [6.0, 2.0, 1.0, 2.0, 5.0, 2.0, 1.0, 2.0, 4.0];
        let inverse = Cholesky::factor(&matrix, 3).unwrap().inverse();

        for i in 0..3 {
            for j in 0..3 {
                let mut sum = 0.0;
                for k in 0..3 {
                    sum += matrix[i * 3 + k] * inverse[k * 3 + j];
                }
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((sum - expected).abs() < 1e-12, "({i},{j}) = {sum}");
            }
        }
    }

    #[test]
    fn test_singular_matrix_is_rejected() {
        // rank one
        let matrix = [1.0, 2.0, 2.0, 4.0];
        assert!(Cholesky::factor(&matrix, 2).is_none());
    }

    #[test]
    fn test_non_finite_matrix_is_rejected() {
        let matrix = [1.0, 0.0, 0.0, f64::NAN];
        assert!(Cholesky::factor(&matrix, 2).is_none());
    }

    #[test]
    fn test_quadratic_form() {
        let matrix = [2.0, 0.0, 0.0, 3.0];
        assert!((quadratic_form(&matrix, &[1.0, 2.0]) - 14.0).abs() < 1e-12);
    }
}
