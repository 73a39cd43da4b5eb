use std::{fs, path::Path};

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use thiserror::Error;

/// Errors raised while loading or validating configuration. These are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Analysis settings. Every field must be present in a settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// File name prefix for the data and results logs
    pub prefix: String,
    /// Seconds between samples
    #[serde(deserialize_with = "whole_number")]
    pub granularity: u64,
    /// Number of samples used to fit the model
    #[serde(deserialize_with = "whole_number")]
    pub training_window: usize,
    /// Number of samples between refits
    #[serde(deserialize_with = "whole_number")]
    pub training_interval: usize,
    /// Smoothing factor for the residual EWMA, in (0, 1]
    pub ema_alpha: f64,
    /// Weight applied to the z-score
    pub severity_omega: f64,
    /// Threshold the weighted z-score must exceed
    pub severity_lambda: f64,
    /// Number of previous targets used as extra regressors
    #[serde(deserialize_with = "whole_number")]
    pub auto_regression: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefix: "ne_data".to_string(),
            granularity: 60,
            training_window: 120,
            training_interval: 60,
            ema_alpha: 1.0,
            severity_omega: 1.0,
            severity_lambda: 3.719,
            auto_regression: 0,
        }
    }
}

impl Settings {
    /// Load and validate settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = read_json(path)?;
        settings.validate()?;
        log::info!("loaded settings from: {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("prefix must not be empty".into()));
        }
        if self.granularity == 0 {
            return Err(ConfigError::Invalid("granularity must be positive".into()));
        }
        if self.training_window == 0 {
            return Err(ConfigError::Invalid(
                "training_window must be positive".into(),
            ));
        }
        if self.training_interval == 0 {
            return Err(ConfigError::Invalid(
                "training_interval must be positive".into(),
            ));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            )));
        }
        for (name, value) in [
            ("severity_omega", self.severity_omega),
            ("severity_lambda", self.severity_lambda),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Connection parameters and table layout of the power database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub credentials: Credentials,
    pub table: TableConfig,
    /// Number of most recent rows averaged into one power value
    #[serde(
        default = "default_rows_to_average",
        deserialize_with = "whole_number"
    )]
    pub rows_to_average: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: Port,
    pub database_name: String,
}

/// Database port, accepted either as a number or as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(u16),
    Text(String),
}

impl Port {
    pub fn value(&self) -> Result<u16, ConfigError> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid database port: {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    pub data_columns: Vec<String>,
    pub time_column: String,
}

fn default_rows_to_average() -> u32 {
    4
}

/// The database config file nests everything under a `database` key.
#[derive(Deserialize)]
struct DatabaseConfigFile {
    database: DatabaseConfig,
}

impl DatabaseConfig {
    /// Load and validate the database section of a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file: DatabaseConfigFile = read_json(path)?;
        file.database.validate()?;
        Ok(file.database)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials.port.value()?;
        if self.credentials.host.trim().is_empty() {
            return Err(ConfigError::Invalid("database host must not be empty".into()));
        }
        if self.table.data_columns.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one data column is required".into(),
            ));
        }
        if self.rows_to_average == 0 {
            return Err(ConfigError::Invalid(
                "rows_to_average must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Accept a count written either as an integer or as a float with no
/// fractional part (`60` or `60.0`).
fn whole_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Integer(u64),
        Float(f64),
    }

    let value = match Count::deserialize(deserializer)? {
        Count::Integer(value) => value,
        Count::Float(value) if value >= 0.0 && value.fract() == 0.0 && value < u64::MAX as f64 => {
            value as u64
        }
        Count::Float(value) => {
            return Err(D::Error::custom(format!(
                "expected a non-negative whole number, got {value}"
            )));
        }
    };
    T::try_from(value).map_err(|_| D::Error::custom(format!("{value} is out of range")))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
