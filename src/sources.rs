pub mod power;
pub mod retry;
pub mod sound;
pub mod zway;

use std::time::Duration;

use tokio::time::Instant;

use self::{power::PowerSource, sound::SoundSampler, zway::ZwayClient};

/// Outcome of one collaborator call.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Reading {
    Value(f64),
    /// The collaborator gave up after exhausting its retries.
    Unavailable,
}

/// One tick's assembled readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Feature values in header order; the target is last.
    pub values: Vec<f64>,
    /// Indices of values that were substituted because their source was
    /// unavailable.
    pub degraded: Vec<usize>,
}

/// Anything that can produce one feature vector per tick.
#[allow(async_fn_in_trait)]
pub trait FeatureSource {
    /// Column names, in value order, target last.
    fn header(&self) -> Vec<String>;

    async fn acquire(&mut self) -> Tick;
}

/// Replaces unavailable readings with the last good value of the same
/// feature, or zero if that feature has never been read.
#[derive(Debug, Clone)]
pub struct Substitution {
    last_good: Vec<Option<f64>>,
}

impl Substitution {
    pub fn new(len: usize) -> Self {
        Self {
            last_good: vec![None; len],
        }
    }

    pub fn resolve(&mut self, readings: &[Reading], names: &[String]) -> Tick {
        debug_assert_eq!(readings.len(), self.last_good.len());

        let mut values = Vec::with_capacity(readings.len());
        let mut degraded = Vec::new();

        for (i, reading) in readings.iter().enumerate() {
            match reading {
                Reading::Value(v) if v.is_finite() => {
                    self.last_good[i] = Some(*v);
                    values.push(*v);
                }
                _ => {
                    let substitute = self.last_good[i].unwrap_or(0.0);
                    log::warn!(
                        "{} unavailable, substituting {substitute}",
                        names.get(i).map_or("feature", String::as_str)
                    );
                    values.push(substitute);
                    degraded.push(i);
                }
            }
        }

        Tick { values, degraded }
    }
}

/// Reads every telemetry channel, then sound (if enabled), then aggregate
/// power, into one vector per tick.
pub struct FeatureAssembler {
    telemetry: ZwayClient,
    sound: Option<SoundSampler>,
    power: PowerSource,
    header: Vec<String>,
    substitution: Substitution,
    telemetry_budget: Option<Duration>,
}

impl FeatureAssembler {
    pub fn new(telemetry: ZwayClient, sound: Option<SoundSampler>, power: PowerSource) -> Self {
        let mut header = telemetry.header_names();
        if sound.is_some() {
            header.push("Sound".to_string());
        }
        header.push("Total_power".to_string());

        Self {
            substitution: Substitution::new(header.len()),
            telemetry,
            sound,
            power,
            header,
            telemetry_budget: None,
        }
    }

    /// Bound the time spent reading telemetry channels on one tick. Channels
    /// not read by then count as unavailable.
    pub fn with_telemetry_budget(mut self, budget: Duration) -> Self {
        self.telemetry_budget = Some(budget);
        self
    }

    /// Number of predictors, i.e. every feature except the target.
    pub fn num_features(&self) -> usize {
        self.header.len() - 1
    }
}

impl FeatureSource for FeatureAssembler {
    fn header(&self) -> Vec<String> {
        self.header.clone()
    }

    async fn acquire(&mut self) -> Tick {
        let mut readings = Vec::with_capacity(self.header.len());

        let deadline = self.telemetry_budget.map(|budget| Instant::now() + budget);
        for channel in self.telemetry.channels() {
            let reading = match deadline {
                Some(deadline) => read_before(deadline, self.telemetry.read(channel)).await,
                None => self.telemetry.read(channel).await,
            };
            readings.push(reading);
        }
        if let Some(sound) = &self.sound {
            readings.push(sound.sample().await);
        }
        readings.push(self.power.read().await);

        self.substitution.resolve(&readings, &self.header)
    }
}

/// Await `read`, or give up as unavailable once `deadline` passes.
async fn read_before(deadline: Instant, read: impl Future<Output = Reading>) -> Reading {
    tokio::time::timeout_at(deadline, read)
        .await
        .unwrap_or(Reading::Unavailable)
}
