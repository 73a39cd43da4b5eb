use std::{process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::process::Command;

use super::{
    Reading,
    retry::{RetryPolicy, retry},
};

/// Extra time allowed on top of the recording duration before a capture is
/// considered hung.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// Samples microphone loudness through `arecord` piped into `sox stat`.
#[derive(Debug, Clone)]
pub struct SoundSampler {
    device: String,
    sample_duration: Duration,
    policy: RetryPolicy,
}

impl Default for SoundSampler {
    fn default() -> Self {
        Self::new(
            "plughw:1,0",
            Duration::from_secs(1),
            RetryPolicy::fixed(10, Duration::from_secs(1)),
        )
    }
}

impl SoundSampler {
    pub fn new(device: impl Into<String>, sample_duration: Duration, policy: RetryPolicy) -> Self {
        Self {
            device: device.into(),
            sample_duration,
            policy,
        }
    }

    /// Record for the sample duration and return the maximum amplitude.
    pub async fn sample(&self) -> Reading {
        match retry(&self.policy, "audio capture", || self.capture()).await {
            Ok(amplitude) => Reading::Value(amplitude),
            Err(_) => Reading::Unavailable,
        }
    }

    /// `arecord -D <device> -d <seconds> -f S16_LE | sox -t .wav - -n stat`,
    /// with both ends spawned directly so a timeout kills both.
    async fn capture(&self) -> Result<f64> {
        let seconds = self.sample_duration.as_secs().max(1).to_string();

        let mut recorder = Command::new("arecord")
            .args(["-D", &self.device, "-d", &seconds, "-f", "S16_LE"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("couldn't start arecord")?;
        let audio: Stdio = recorder
            .stdout
            .take()
            .context("arecord has no stdout")?
            .try_into()?;

        let analyzer = Command::new("sox")
            .args(["-t", ".wav", "-", "-n", "stat"])
            .stdin(audio)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("couldn't start sox")?;

        let output = tokio::time::timeout(self.sample_duration + CAPTURE_GRACE, async {
            let output = analyzer.wait_with_output().await?;
            recorder.wait().await?;
            Ok::<_, std::io::Error>(output)
        })
        .await
        .context("audio capture timed out")?
        .context("audio capture failed")?;

        // sox writes its statistics to stderr
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stderr),
            String::from_utf8_lossy(&output.stdout)
        );
        match parse_max_amplitude(&text) {
            Some(amplitude) => Ok(amplitude),
            None => bail!("no amplitude in sox output (status {})", output.status),
        }
    }
}

/// Find the "Maximum amplitude" line of `sox stat` output.
fn parse_max_amplitude(output: &str) -> Option<f64> {
    output
        .lines()
        .find(|line| line.contains("Maximum amplitude"))
        .and_then(|line| line.split_whitespace().last())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOX_OUTPUT: &str = "\
Samples read:              8000
Length (seconds):      1.000000
Scaled by:         2147483647.0
Maximum amplitude:     0.123444
Minimum amplitude:    -0.118256
Midline amplitude:      0.002594
";

    #[test]
    fn test_parse_max_amplitude() {
        assert_eq!(parse_max_amplitude(SOX_OUTPUT), Some(0.123444));
    }

    #[test]
    fn test_parse_without_amplitude() {
        assert_eq!(parse_max_amplitude("arecord: main: audio open error"), None);
        assert_eq!(parse_max_amplitude(""), None);
    }

    #[tokio::test]
    async fn test_missing_device_is_unavailable() {
        let sampler = SoundSampler::new(
            "nonexistent-device",
            Duration::from_secs(1),
            RetryPolicy::fixed(2, Duration::from_millis(10)),
        );

        // whether or not arecord and sox are installed, this device can't be
        // opened, and each attempt ends well before its timeout
        let started = std::time::Instant::now();
        assert_eq!(sampler.sample().await, Reading::Unavailable);
        assert!(
            started.elapsed() < Duration::from_secs(1) + CAPTURE_GRACE,
            "capture took {:?}",
            started.elapsed()
        );
    }
}
