mod linalg;
mod model;
mod smoother;
mod window;

use std::collections::VecDeque;

use thiserror::Error;

pub use self::model::BlrModel;
use self::{smoother::ResidualSmoother, window::TrainingWindow};
use crate::settings::{ConfigError, Settings};

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("feature {index} is not finite: {value}")]
    NonFinite { index: usize, value: f64 },
}

/// Lifecycle of the detector. `Collecting` lasts until the training window is
/// full for the first time; `Active` is never left.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DetectorState {
    Collecting,
    Active,
}

/// Anomaly decision rule: anomalous when `|z| · omega > lambda`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SeverityPolicy {
    pub omega: f64,
    pub lambda: f64,
}

impl SeverityPolicy {
    pub fn is_anomalous(&self, zscore: f64) -> bool {
        zscore.abs() * self.omega > self.lambda
    }
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            omega: settings.severity_omega,
            lambda: settings.severity_lambda,
        }
    }
}

/// Result of evaluating one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub target: f64,
    pub prediction: Option<f64>,
    pub anomaly: Option<bool>,
    pub zscore: Option<f64>,
}

/// Sequential Bayesian linear regression anomaly detector.
///
/// Each evaluated vector holds `num_features` predictors followed by the
/// target. The target is predicted from the predictors (and optionally from
/// previous targets); residuals are smoothed with an EWMA and converted to a
/// z-score that the severity policy turns into an anomaly decision.
#[derive(Debug, Clone)]
pub struct Detector {
    num_features: usize,
    training_interval: usize,
    auto_regression: usize,

    window: TrainingWindow,
    model: Option<BlrModel>,
    smoother: ResidualSmoother,
    severity: SeverityPolicy,

    /// Most recent targets, newest last, at most `auto_regression` long.
    recent_targets: VecDeque<f64>,
    /// First target ever observed, used to back-fill missing lags.
    first_target: Option<f64>,

    state: DetectorState,
    samples_seen: u64,
    since_fit: usize,
    refits: u64,
    skipped_refits: u64,
}

impl Detector {
    pub fn new(
        num_features: usize,
        training_window: usize,
        training_interval: usize,
    ) -> Result<Self, ConfigError> {
        for (name, value) in [
            ("num_features", num_features),
            ("training_window", training_window),
            ("training_interval", training_interval),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        Ok(Self {
            num_features,
            training_interval,
            auto_regression: 0,
            // predictors plus bias
            window: TrainingWindow::new(training_window, num_features + 1),
            model: None,
            smoother: ResidualSmoother::new(Settings::default().ema_alpha),
            severity: SeverityPolicy::default(),
            recent_targets: VecDeque::new(),
            first_target: None,
            state: DetectorState::Collecting,
            samples_seen: 0,
            since_fit: 0,
            refits: 0,
            skipped_refits: 0,
        })
    }

    /// Build a detector configured from analysis settings.
    pub fn from_settings(num_features: usize, settings: &Settings) -> Result<Self, ConfigError> {
        let mut detector = Self::new(
            num_features,
            settings.training_window,
            settings.training_interval,
        )?;
        detector.configure_severity(settings.severity_omega, settings.severity_lambda)?;
        detector.configure_smoothing(settings.ema_alpha)?;
        detector.configure_auto_regression(settings.auto_regression)?;
        Ok(detector)
    }

    pub fn configure_severity(&mut self, omega: f64, lambda: f64) -> Result<(), ConfigError> {
        if !omega.is_finite() || !lambda.is_finite() || omega < 0.0 || lambda < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "severity must be finite and non-negative, got omega={omega}, lambda={lambda}"
            )));
        }
        self.severity = SeverityPolicy { omega, lambda };
        Ok(())
    }

    pub fn configure_smoothing(&mut self, alpha: f64) -> Result<(), ConfigError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "ema alpha must be in (0, 1], got {alpha}"
            )));
        }
        self.smoother.set_alpha(alpha);
        Ok(())
    }

    /// Use the previous `lags` targets as extra regressors. Only allowed
    /// before the first evaluation, since it changes the regressor layout.
    pub fn configure_auto_regression(&mut self, lags: usize) -> Result<(), ConfigError> {
        if self.samples_seen > 0 {
            return Err(ConfigError::Invalid(
                "auto regression can't change after evaluation has started".into(),
            ));
        }
        self.auto_regression = lags;
        self.window = TrainingWindow::new(self.window.capacity(), self.num_features + lags + 1);
        Ok(())
    }

    /// Evaluate one tick's vector (`num_features` predictors then the target).
    pub fn evaluate(&mut self, features: &[f64]) -> Result<Evaluation, DetectorError> {
        if features.len() != self.num_features + 1 {
            return Err(ConfigError::Invalid(format!(
                "expected {} values ({} features and a target), got {}",
                self.num_features + 1,
                self.num_features,
                features.len()
            ))
            .into());
        }
        if let Some((index, &value)) = features.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(DetectorError::NonFinite { index, value });
        }

        let (predictors, target) = (&features[..self.num_features], features[self.num_features]);
        let row = self.regressors(predictors, target);
        self.remember_target(target);
        self.samples_seen += 1;

        let Some(model) = &self.model else {
            self.window.push(row, target);
            if self.window.is_full() {
                self.activate();
            }
            return Ok(Evaluation {
                target,
                prediction: None,
                anomaly: None,
                zscore: None,
            });
        };

        let prediction = model.predict(&row);
        log::trace!(
            "prediction {prediction:.3} ± {:.3}",
            model.predictive_variance(&row).sqrt()
        );

        let residual = target - prediction;
        let zscore = if residual.is_finite() {
            self.smoother.observe(residual)
        } else {
            None
        };
        let anomaly = zscore.map(|z| self.severity.is_anomalous(z));
        log::trace!(
            "residual {residual:.3}, ewma mean {:?}, variance {:?}",
            self.smoother.mean(),
            self.smoother.variance()
        );

        self.window.push(row, target);
        self.since_fit += 1;
        if self.since_fit >= self.training_interval {
            self.refit();
        }

        Ok(Evaluation {
            target,
            prediction: Some(prediction),
            anomaly,
            zscore,
        })
    }

    /// Regressor row: predictors, lagged targets (newest first), then bias.
    fn regressors(&self, predictors: &[f64], target: f64) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.window.dims());
        row.extend_from_slice(predictors);

        let fill = self.first_target.unwrap_or(target);
        for lag in 0..self.auto_regression {
            let value = self
                .recent_targets
                .len()
                .checked_sub(lag + 1)
                .map(|i| self.recent_targets[i])
                .unwrap_or(fill);
            row.push(value);
        }

        row.push(1.0);
        row
    }

    fn remember_target(&mut self, target: f64) {
        self.first_target.get_or_insert(target);
        if self.auto_regression == 0 {
            return;
        }
        if self.recent_targets.len() == self.auto_regression {
            self.recent_targets.pop_front();
        }
        self.recent_targets.push_back(target);
    }

    /// First fit once the window is full. A degenerate window still yields a
    /// usable constant model so predictions are never absent once active.
    fn activate(&mut self) {
        let model = match BlrModel::fit(&self.window, self.samples_seen) {
            Ok(model) => {
                self.refits += 1;
                model
            }
            Err(e) => {
                log::warn!("initial fit failed ({e}), predicting the window mean until next refit");
                self.skipped_refits += 1;
                let mean = self.window.mean_target().unwrap_or(0.0);
                BlrModel::constant(mean, self.window.dims(), self.samples_seen)
            }
        };

        log::info!(
            "training window filled after {} samples, detector active",
            self.samples_seen
        );
        self.model = Some(model);
        self.state = DetectorState::Active;
        self.since_fit = 0;
    }

    fn refit(&mut self) {
        self.since_fit = 0;
        match BlrModel::fit(&self.window, self.samples_seen) {
            Ok(model) => {
                log::debug!(
                    "refit at sample {}: alpha={:.3e}, beta={:.3e}, weights {:?}",
                    self.samples_seen,
                    model.alpha,
                    model.beta,
                    model.weights()
                );
                self.model = Some(model);
                self.refits += 1;
            }
            Err(e) => {
                log::warn!(
                    "skipping refit at sample {}, keeping previous model: {e}",
                    self.samples_seen
                );
                self.skipped_refits += 1;
            }
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn refits(&self) -> u64 {
        self.refits
    }

    pub fn skipped_refits(&self) -> u64 {
        self.skipped_refits
    }

    pub fn model(&self) -> Option<&BlrModel> {
        self.model.as_ref()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn severity(&self) -> SeverityPolicy {
        self.severity
    }

    pub fn ema_alpha(&self) -> f64 {
        self.smoother.alpha()
    }
}
