use std::{fmt::Display, future::Future, time::Duration};

/// Bounded retry with exponential backoff.
///
/// The total time a collaborator may stall the acquisition loop is bounded by
/// [`RetryPolicy::max_total_wait`] plus the duration of the attempts
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_factor: f64,
    /// Cap on a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff_factor: 1.0,
            max_delay: delay,
        }
    }

    /// Short policy for reads made on every tick, where a long stall would
    /// delay the whole sample.
    pub fn per_tick() -> Self {
        Self::fixed(2, Duration::from_millis(500))
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay
            .mul_f64(factor.max(0.0))
            .min(self.max_delay)
    }

    /// Sum of all delays if every attempt fails.
    pub fn max_total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.delay_for(a)).sum()
    }
}

/// Run `op` until it succeeds or the policy is exhausted, sleeping between
/// attempts. Returns the last error on exhaustion.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts => {
                log::error!("{what} failed after {attempt} attempts: {e}");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                log::warn!("{what} failed (attempt {attempt}), retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
