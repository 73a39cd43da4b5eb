use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{
    Reading,
    retry::{RetryPolicy, retry},
};

const DEFAULT_PORT: u16 = 8083;
const API_PATH: &str = "/ZAutomation/api/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for a single channel read on a tick.
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Device types that expose a numeric (or on/off) level.
const SAMPLED_DEVICE_TYPES: &[&str] = &[
    "sensorMultilevel",
    "sensorBinary",
    "switchMultilevel",
    "switchBinary",
];

#[derive(Deserialize, Debug)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize, Debug)]
struct DeviceList {
    devices: Vec<Device>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Device {
    id: String,
    device_type: String,
    #[serde(default, rename = "permanently_hidden")]
    permanently_hidden: bool,
    metrics: Metrics,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Metrics {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    probe_title: Option<String>,
    #[serde(default)]
    level: Value,
}

/// One telemetry channel: a Z-Way virtual device.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

/// Client for a Z-Way home automation server.
///
/// The channel list is discovered once at construction and stays fixed for
/// the life of the client, so the feature layout never changes mid-run.
pub struct ZwayClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
    channels: Vec<Channel>,
    read_policy: RetryPolicy,
}

impl ZwayClient {
    /// Discover the channels of the server at `host`, retrying under
    /// `discovery`. Channel reads afterwards use [`RetryPolicy::per_tick`].
    pub async fn connect(
        host: &str,
        credentials: Option<(String, String)>,
        discovery: RetryPolicy,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("couldn't build http client")?;

        let mut client = Self {
            http,
            base_url: base_url(host),
            credentials,
            channels: Vec::new(),
            read_policy: RetryPolicy::per_tick(),
        };

        let devices = retry(&discovery, "z-way device discovery", || {
            client.get::<DeviceList>("/devices", REQUEST_TIMEOUT)
        })
        .await?;
        client.channels = select_channels(&devices.devices);

        log::info!(
            "discovered {} z-way channels at {}",
            client.channels.len(),
            client.base_url
        );
        Ok(client)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Human readable channel names, in channel order, for log headers.
    pub fn header_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    /// Read the current level of one channel.
    pub async fn read(&self, channel: &Channel) -> Reading {
        let path = format!("/devices/{}", channel.id);
        let what = format!("z-way read of {}", channel.id);

        let fetch = || self.get::<Device>(&path, READ_TIMEOUT);
        match retry(&self.read_policy, &what, fetch).await {
            Ok(device) => match parse_level(&device.metrics.level) {
                Some(level) => Reading::Value(level),
                None => {
                    log::warn!(
                        "z-way channel {} has non-numeric level {}",
                        channel.id,
                        device.metrics.level
                    );
                    Reading::Unavailable
                }
            },
            Err(_) => Reading::Unavailable,
        }
    }

    pub fn read_policy(&self) -> &RetryPolicy {
        &self.read_policy
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str, timeout: Duration) -> Result<T> {
        let mut request = self
            .http
            .get(format!("{}{API_PATH}{path}", self.base_url))
            .timeout(timeout);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let envelope: Envelope<T> = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("unexpected z-way response for {path}"))?;
        Ok(envelope.data)
    }
}

fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };

    // only the authority part may carry a port
    let authority = with_scheme.split_once("://").map_or("", |(_, rest)| rest);
    if authority.contains(':') {
        with_scheme
    } else {
        format!("{with_scheme}:{DEFAULT_PORT}")
    }
}

fn select_channels(devices: &[Device]) -> Vec<Channel> {
    devices
        .iter()
        .filter(|d| !d.permanently_hidden)
        .filter(|d| SAMPLED_DEVICE_TYPES.contains(&d.device_type.as_str()))
        .map(|d| Channel {
            id: d.id.clone(),
            name: d
                .metrics
                .title
                .clone()
                .or_else(|| d.metrics.probe_title.clone())
                .unwrap_or_else(|| d.id.clone()),
        })
        .collect()
}

/// Convert a Z-Way `level` into a number. Binary devices report "on"/"off".
fn parse_level(level: &Value) -> Option<f64> {
    match level {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "open" => Some(1.0),
            "off" | "close" | "closed" => Some(0.0),
            other => other.parse().ok(),
        },
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("192.168.1.20"), "http://192.168.1.20:8083");
        assert_eq!(base_url("zway.local:9000"), "http://zway.local:9000");
        assert_eq!(base_url("https://zway.example/"), "https://zway.example:8083");
        assert_eq!(base_url("http://10.0.0.2:8083"), "http://10.0.0.2:8083");
    }

    #[tokio::test]
    async fn test_unreachable_channel_fails_fast() {
        let client = ZwayClient {
            http: reqwest::Client::new(),
            // reserved port, nothing listens there
            base_url: base_url("127.0.0.1:1"),
            credentials: None,
            channels: Vec::new(),
            read_policy: RetryPolicy::per_tick(),
        };
        let channel = Channel {
            id: "ZWayVDev_zway_2-0-49-1".into(),
            name: "Temperature".into(),
        };

        let started = std::time::Instant::now();
        assert_eq!(client.read(&channel).await, Reading::Unavailable);

        let bound = client.read_policy().max_total_wait() + READ_TIMEOUT * 2;
        assert!(started.elapsed() < bound, "read took {:?}", started.elapsed());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(&json!(21.5)), Some(21.5));
        assert_eq!(parse_level(&json!("on")), Some(1.0));
        assert_eq!(parse_level(&json!("off")), Some(0.0));
        assert_eq!(parse_level(&json!("12.5")), Some(12.5));
        assert_eq!(parse_level(&json!(null)), None);
        assert_eq!(parse_level(&json!("unknown")), None);
    }

    #[test]
    fn test_select_channels_keeps_order_and_filters() {
        let list: Envelope<DeviceList> = serde_json::from_value(json!({
            "data": {
                "devices": [
                    {
                        "id": "ZWayVDev_zway_2-0-49-1",
                        "deviceType": "sensorMultilevel",
                        "metrics": { "title": "Temperature", "level": 21.0 }
                    },
                    {
                        "id": "ZWayVDev_zway_2-0-113",
                        "deviceType": "battery",
                        "metrics": { "title": "Battery", "level": 90 }
                    },
                    {
                        "id": "ZWayVDev_zway_3-0-48-1",
                        "deviceType": "sensorBinary",
                        "metrics": { "probeTitle": "Motion", "level": "off" }
                    },
                    {
                        "id": "ZWayVDev_zway_4-0-37",
                        "deviceType": "switchBinary",
                        "permanently_hidden": true,
                        "metrics": { "level": "on" }
                    },
                    {
                        "id": "ZWayVDev_zway_5-0-49-3",
                        "deviceType": "sensorMultilevel",
                        "metrics": { "level": 120 }
                    }
                ]
            }
        }))
        .unwrap();

        let channels = select_channels(&list.data.devices);
        let names: Vec<_> = channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Temperature", "Motion", "ZWayVDev_zway_5-0-49-3"]
        );
    }
}
