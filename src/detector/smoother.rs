/// Variances at or below this are treated as "no spread estimated yet".
pub const MIN_VARIANCE: f64 = 1e-12;

/// Exponentially weighted mean and variance of prediction residuals.
#[derive(Debug, Clone)]
pub struct ResidualSmoother {
    alpha: f64,
    mean: Option<f64>,
    variance: Option<f64>,
}

impl ResidualSmoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            mean: None,
            variance: None,
        }
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Score `residual` against the current statistics, then fold it in.
    ///
    /// Returns `None` until a positive variance is available: the first
    /// residual only seeds the mean, the second seeds the variance.
    pub fn observe(&mut self, residual: f64) -> Option<f64> {
        let Some(mean) = self.mean else {
            self.mean = Some(residual);
            return None;
        };

        let deviation = residual - mean;
        let zscore = self
            .variance
            .filter(|v| *v > MIN_VARIANCE)
            .map(|v| deviation / v.sqrt());

        let a = self.alpha;
        self.variance = Some(match self.variance {
            Some(prev) => a * deviation * deviation + (1.0 - a) * prev,
            None => deviation * deviation,
        });
        self.mean = Some(a * residual + (1.0 - a) * mean);

        zscore
    }

    pub fn mean(&self) -> Option<f64> {
        self.mean
    }

    pub fn variance(&self) -> Option<f64> {
        self.variance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_two_residuals_only_seed() {
        let mut smoother = ResidualSmoother::new(0.5);
        assert!(smoother.observe(1.0).is_none());
        assert_eq!(smoother.mean(), Some(1.0));
        assert!(smoother.variance().is_none());

        assert!(smoother.observe(3.0).is_none());
        assert_eq!(smoother.variance(), Some(4.0));
        assert!(smoother.observe(2.0).is_some());
    }

    #[test]
    fn test_alpha_one_uses_only_last_two_residuals() {
        let mut smoother = ResidualSmoother::new(1.0);
        for r in [5.0, -3.0, 8.0, 1.0] {
            smoother.observe(r);
        }

        // mean is the last residual, variance the squared last difference
        assert_eq!(smoother.mean(), Some(1.0));
        assert_eq!(smoother.variance(), Some(49.0));

        // z = (4 − 1) / 7
        let z = smoother.observe(4.0).unwrap();
        assert!((z - 3.0 / 7.0).abs() < 1e-12, "z={z}");
    }

    #[test]
    fn test_ewma_blends_history() {
        let mut smoother = ResidualSmoother::new(0.25);
        smoother.observe(0.0);
        smoother.observe(4.0);

        // mean = 0.25·4 + 0.75·0
        assert!((smoother.mean().unwrap() - 1.0).abs() < 1e-12);

        smoother.observe(1.0);
        // deviation 0 → variance decays: 0.75·16
        assert!((smoother.variance().unwrap() - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_spread_gives_no_score() {
        let mut smoother = ResidualSmoother::new(0.5);
        for _ in 0..5 {
            assert!(smoother.observe(2.0).is_none());
        }
    }
}
