use std::time::Duration;

use chrono::Utc;

use crate::{
    datalog::RecordSink,
    detector::{Detector, Evaluation},
    sources::FeatureSource,
};

/// Longest single sleep while waiting for the next fire time. Bounds how late
/// a tick can start.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Source of wall-clock time.
#[allow(async_fn_in_trait)]
pub trait Clock {
    /// Seconds since the unix epoch.
    fn now(&self) -> f64;

    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Absolute fire times, `granularity` seconds apart.
///
/// The next fire time is always the previous one plus the granularity, never
/// "now plus granularity", so slow ticks don't shift the schedule.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Schedule {
    next_fire: i64,
    granularity: i64,
}

impl Schedule {
    /// Start at the current second, or when aligning, at the next multiple of
    /// `granularity` after it.
    pub fn new(now: f64, granularity: u64, time_align: bool) -> Self {
        let now = now.floor() as i64;
        let granularity = granularity.max(1) as i64;
        let next_fire = if time_align {
            now + granularity - now.rem_euclid(granularity)
        } else {
            now
        };

        Self {
            next_fire,
            granularity,
        }
    }

    pub fn next_fire(&self) -> i64 {
        self.next_fire
    }

    /// Consume the pending fire time and schedule the following one.
    pub fn advance(&mut self) -> i64 {
        let fired = self.next_fire;
        self.next_fire += self.granularity;
        fired
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub granularity: u64,
    pub time_align: bool,
    pub collect_only: bool,
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub fire_time: i64,
    pub values: Vec<f64>,
    pub evaluation: Option<Evaluation>,
}

/// The acquisition loop: waits for each fire time, samples the features, logs
/// them and runs detection. Ticks are processed strictly one at a time.
pub struct Scheduler<C, S, D, R> {
    clock: C,
    source: S,
    detector: Detector,
    data_log: D,
    results_log: R,
    schedule: Schedule,
    options: SchedulerOptions,
}

impl<C, S, D, R> Scheduler<C, S, D, R>
where
    C: Clock,
    S: FeatureSource,
    D: RecordSink,
    R: RecordSink,
{
    pub fn new(
        clock: C,
        source: S,
        detector: Detector,
        data_log: D,
        results_log: R,
        options: SchedulerOptions,
    ) -> Self {
        let width = source.header().len();
        if width != detector.num_features() + 1 {
            log::warn!(
                "source produces {width} values but the detector expects {} features and a target",
                detector.num_features()
            );
        }

        let schedule = Schedule::new(clock.now(), options.granularity, options.time_align);
        log::info!(
            "first sample at {}, then every {}s",
            schedule.next_fire(),
            options.granularity
        );

        Self {
            clock,
            source,
            detector,
            data_log,
            results_log,
            schedule,
            options,
        }
    }

    /// Run forever.
    pub async fn run(&mut self) {
        loop {
            let outcome = self.step().await;
            if outcome.evaluation.is_none() && !self.options.collect_only {
                log::debug!(
                    "tick at {} not evaluated: {:?}",
                    outcome.fire_time,
                    outcome.values
                );
            }
        }
    }

    /// Wait for the next fire time and process that tick.
    pub async fn step(&mut self) -> TickOutcome {
        let fire_time = self.wait_for_fire().await;
        log::debug!("recording sample at {fire_time}");

        let tick = self.source.acquire().await;
        if !tick.degraded.is_empty() {
            log::warn!(
                "tick at {fire_time} has {} substituted features",
                tick.degraded.len()
            );
        }

        if let Err(e) = self.data_log.log(&tick.values, fire_time) {
            log::error!("couldn't log sample: {e:#}");
        }

        if self.options.collect_only {
            return TickOutcome {
                fire_time,
                values: tick.values,
                evaluation: None,
            };
        }

        let evaluation = match self.detector.evaluate(&tick.values) {
            Ok(evaluation) => {
                self.record(&evaluation, fire_time);
                log::debug!(
                    "detector {:?}: {} refits, {} skipped, model from sample {:?}",
                    self.detector.state(),
                    self.detector.refits(),
                    self.detector.skipped_refits(),
                    self.detector.model().map(|model| model.fitted_at())
                );
                Some(evaluation)
            }
            Err(e) => {
                log::error!("couldn't evaluate sample at {fire_time}: {e}");
                None
            }
        };

        TickOutcome {
            fire_time,
            values: tick.values,
            evaluation,
        }
    }

    fn record(&mut self, evaluation: &Evaluation, fire_time: i64) {
        let (Some(prediction), Some(anomaly)) = (evaluation.prediction, evaluation.anomaly) else {
            match evaluation.prediction {
                Some(prediction) => log::info!("{} {prediction}", evaluation.target),
                None => log::info!(
                    "{} (collecting {}/{})",
                    evaluation.target,
                    self.detector.window_len(),
                    self.detector.samples_seen()
                ),
            }
            return;
        };

        if anomaly {
            log::warn!(
                "anomaly at {fire_time}: target {} prediction {prediction} z {:.3}",
                evaluation.target,
                evaluation.zscore.unwrap_or_default()
            );
        } else {
            log::info!("{} {prediction} {anomaly}", evaluation.target);
        }

        let row = [evaluation.target, prediction, if anomaly { 1.0 } else { 0.0 }];
        if let Err(e) = self.results_log.log(&row, fire_time) {
            log::error!("couldn't log result: {e:#}");
        }
    }

    /// Poll the clock until the pending fire time has been reached, then
    /// advance the schedule. Returns the fire time.
    async fn wait_for_fire(&mut self) -> i64 {
        let fire_time = self.schedule.next_fire();
        loop {
            let remaining = fire_time as f64 - self.clock.now();
            if remaining <= 0.0 {
                break;
            }
            let nap = POLL_INTERVAL.min(Duration::from_secs_f64(remaining));
            self.clock.sleep(nap).await;
        }
        self.schedule.advance()
    }
}
