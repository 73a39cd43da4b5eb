use thiserror::Error;

use super::{
    linalg::{Cholesky, dot, quadratic_form},
    window::TrainingWindow,
};

/// Maximum number of evidence re-estimation rounds per fit.
const MAX_EVIDENCE_ITERATIONS: usize = 100;

/// Relative change in both hyper-parameters below which the evidence
/// iteration is considered converged.
const CONVERGENCE_TOLERANCE: f64 = 1e-6;

/// Bounds on the prior and noise precisions. a noise-free stream drives
/// `beta` towards infinity, a zero weight vector does the same to `alpha`.
const MIN_PRECISION: f64 = 1e-10;
const MAX_PRECISION: f64 = 1e10;

const TINY: f64 = 1e-300;

/// Smallest ridge `alpha/beta`, as a fraction of the largest diagonal entry
/// of the gram matrix. Two orders of magnitude above the Cholesky pivot
/// tolerance.
const MIN_RELATIVE_RIDGE: f64 = 1e-11;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("training window is empty")]
    Empty,

    #[error("regression system is singular or ill-conditioned")]
    Singular,

    #[error("fit produced non-finite parameters")]
    NonFinite,
}

/// Bayesian linear regression model with hyper-parameters chosen by evidence
/// maximization.
///
/// The prior over weights is `N(0, alpha⁻¹ I)` and observation noise has
/// precision `beta`. Fitting yields the posterior mean (the weights used for
/// prediction) and the posterior covariance `S_N`.
#[derive(Debug, Clone)]
pub struct BlrModel {
    /// Posterior mean of the weights, one per regressor.
    pub(super) weights: Vec<f64>,

    /// Posterior covariance `S_N` (row-major, dims × dims).
    pub(super) covariance: Vec<f64>,

    /// Prior precision.
    pub(super) alpha: f64,

    /// Noise precision.
    pub(super) beta: f64,

    /// Detector sample count at the time of the fit.
    pub(super) fitted_at: u64,
}

impl BlrModel {
    /// Fit the model to every sample in `window`.
    pub fn fit(window: &TrainingWindow, fitted_at: u64) -> Result<Self, FitError> {
        let n = window.len();
        if n == 0 {
            return Err(FitError::Empty);
        }
        let dims = window.dims();

        // gram matrix G = ΦᵀΦ and h = Φᵀt
        let mut gram = vec![0.0; dims * dims];
        let mut proj = vec![0.0; dims];
        let mut target_sum = 0.0;
        for (row, target) in window.iter() {
            for i in 0..dims {
                proj[i] += row[i] * target;
                for j in 0..dims {
                    gram[i * dims + j] += row[i] * row[j];
                }
            }
            target_sum += target;
        }

        let mean = target_sum / n as f64;
        let variance = window
            .iter()
            .map(|(_, t)| (t - mean).powi(2))
            .sum::<f64>()
            / n as f64;

        // a column that is constant over the window (or all zero) makes G
        // singular; the ridge must stay above the factorisation's pivot
        // tolerance relative to G's scale
        let scale = (0..dims).map(|i| gram[i * dims + i]).fold(0.0_f64, f64::max);
        let min_ratio = (scale * MIN_RELATIVE_RIDGE).max(TINY);

        let mut alpha = 1.0;
        let mut beta = (1.0 / variance.max(TINY)).clamp(MIN_PRECISION, MAX_PRECISION);
        let mut factored = (alpha, beta);

        for iteration in 0..MAX_EVIDENCE_ITERATIONS {
            // solve in the scaled form (G + (alpha/beta) I) m = h, which is
            // the posterior mean without multiplying G by a huge beta
            let ratio = (alpha / beta).max(min_ratio);
            let chol = match factor_regularized(&gram, dims, ratio) {
                Ok(chol) => chol,
                // fall back to the last hyper-parameters that factored
                Err(_) if iteration > 0 => {
                    (alpha, beta) = factored;
                    break;
                }
                Err(e) => return Err(e),
            };
            factored = (alpha, beta);
            let weights = chol.solve(&proj);
            let inverse = chol.inverse();

            let trace: f64 = (0..dims).map(|i| inverse[i * dims + i]).sum();
            // effective number of well-determined parameters
            let gamma = (dims as f64 - ratio * trace).clamp(0.0, dims as f64);

            let sse = sum_squared_error(window, &weights);
            let norm = dot(&weights, &weights);

            let new_alpha = (gamma / norm.max(TINY)).clamp(MIN_PRECISION, MAX_PRECISION);
            let new_beta = ((n as f64 - gamma).max(f64::EPSILON) / sse.max(TINY))
                .clamp(MIN_PRECISION, MAX_PRECISION);

            let converged = relative_change(alpha, new_alpha) < CONVERGENCE_TOLERANCE
                && relative_change(beta, new_beta) < CONVERGENCE_TOLERANCE;

            alpha = new_alpha;
            beta = new_beta;

            if converged {
                break;
            }
        }

        let ratio = (alpha / beta).max(min_ratio);
        let chol = factor_regularized(&gram, dims, ratio)?;
        let weights = chol.solve(&proj);
        let covariance: Vec<f64> = chol.inverse().into_iter().map(|v| v / beta).collect();

        if weights.iter().chain(&covariance).any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite);
        }

        Ok(Self {
            weights,
            covariance,
            alpha,
            beta,
            fitted_at,
        })
    }

    /// A model that ignores every regressor and predicts `mean` through the
    /// bias term (the last regressor).
    pub fn constant(mean: f64, dims: usize, fitted_at: u64) -> Self {
        let mut weights = vec![0.0; dims];
        if let Some(bias) = weights.last_mut() {
            *bias = mean;
        }

        Self {
            weights,
            covariance: vec![0.0; dims * dims],
            alpha: MAX_PRECISION,
            beta: MIN_PRECISION,
            fitted_at,
        }
    }

    /// Posterior mean prediction for a regressor row.
    pub fn predict(&self, row: &[f64]) -> f64 {
        dot(&self.weights, row)
    }

    /// Variance of the predictive distribution: noise plus weight
    /// uncertainty.
    pub fn predictive_variance(&self, row: &[f64]) -> f64 {
        1.0 / self.beta + quadratic_form(&self.covariance, row)
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn fitted_at(&self) -> u64 {
        self.fitted_at
    }
}

fn factor_regularized(gram: &[f64], dims: usize, ratio: f64) -> Result<Cholesky, FitError> {
    let mut matrix = gram.to_vec();
    for i in 0..dims {
        matrix[i * dims + i] += ratio;
    }
    Cholesky::factor(&matrix, dims).ok_or(FitError::Singular)
}

fn sum_squared_error(window: &TrainingWindow, weights: &[f64]) -> f64 {
    window
        .iter()
        .map(|(row, target)| (target - dot(weights, row)).powi(2))
        .sum()
}

fn relative_change(old: f64, new: f64) -> f64 {
    (new - old).abs() / old.abs().max(TINY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_from(rows: &[(Vec<f64>, f64)]) -> TrainingWindow {
        let mut window = TrainingWindow::new(rows.len(), rows[0].0.len());
        for (row, target) in rows {
            window.push(row.clone(), *target);
        }
        window
    }

    #[test]
    fn test_fit_recovers_exact_linear_relationship() {
        // y = 2·x0 − 3·x1 + 5
        let rows: Vec<_> = (0..60)
            .map(|i| {
                let x0 = (i % 7) as f64 + 0.5 * i as f64;
                let x1 = ((i * 3) % 11) as f64;
                (vec![x0, x1, 1.0], 2.0 * x0 - 3.0 * x1 + 5.0)
            })
            .collect();

        let model = BlrModel::fit(&window_from(&rows), 60).unwrap();

        let weights = model.weights();
        assert!((weights[0] - 2.0).abs() < 1e-6, "w0={}", weights[0]);
        assert!((weights[1] + 3.0).abs() < 1e-6, "w1={}", weights[1]);
        assert!((weights[2] - 5.0).abs() < 1e-5, "bias={}", weights[2]);
        assert_eq!(model.fitted_at(), 60);
    }

    #[test]
    fn test_noisy_fit_estimates_noise_precision() {
        // deterministic ±1 noise around y = x + 10
        let rows: Vec<_> = (0..200)
            .map(|i| {
                let x = (i % 25) as f64;
                let noise = if i % 2 == 0 { 1.0 } else { -1.0 };
                (vec![x, 1.0], x + 10.0 + noise)
            })
            .collect();

        let model = BlrModel::fit(&window_from(&rows), 200).unwrap();

        // noise variance is 1, so beta should land near 1
        assert!(
            (0.5..2.0).contains(&model.beta),
            "beta={}",
            model.beta
        );
        assert!((model.weights()[0] - 1.0).abs() < 0.1);

        // predictive variance is at least the noise variance
        let variance = model.predictive_variance(&[12.0, 1.0]);
        assert!(variance >= 1.0 / model.beta);
    }

    #[test]
    fn test_constant_column_does_not_block_the_fit() {
        // y = 2·x0 + 5 with a sensor stuck at 21 and one stuck at 0
        let rows: Vec<_> = (0..40)
            .map(|i| {
                let x0 = ((i * 5) % 9) as f64;
                (vec![x0, 21.0, 0.0, 1.0], 2.0 * x0 + 5.0)
            })
            .collect();

        let model = BlrModel::fit(&window_from(&rows), 40).unwrap();

        for (row, target) in &rows {
            let error = (model.predict(row) - target).abs();
            assert!(error < 1e-6, "error {error} on {row:?}");
        }
        assert!((model.weights()[0] - 2.0).abs() < 1e-6);
        assert_eq!(model.weights()[2], 0.0);
    }

    #[test]
    fn test_overflowing_window_is_degenerate() {
        let rows = vec![
            (vec![1e200, 1.0], 1.0),
            (vec![2e200, 1.0], 2.0),
            (vec![3e200, 1.0], 3.0),
        ];

        assert!(BlrModel::fit(&window_from(&rows), 3).is_err());
    }

    #[test]
    fn test_empty_window_cannot_be_fitted() {
        let window = TrainingWindow::new(4, 2);
        assert_eq!(BlrModel::fit(&window, 0).unwrap_err(), FitError::Empty);
    }

    #[test]
    fn test_constant_model_predicts_mean() {
        let model = BlrModel::constant(42.0, 3, 10);
        assert_eq!(model.predict(&[5.0, -7.0, 1.0]), 42.0);
    }
}
