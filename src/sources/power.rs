use anyhow::{Context, Result, bail};
use tiberius::{AuthMethod, Client, Config, Row, numeric::Numeric};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;

use super::{
    Reading,
    retry::{RetryPolicy, retry},
};
use crate::settings::DatabaseConfig;

/// Aggregate household power read from the metering database.
pub struct PowerSource {
    config: DatabaseConfig,
    policy: RetryPolicy,
}

impl PowerSource {
    pub fn new(config: DatabaseConfig, policy: RetryPolicy) -> Self {
        Self { config, policy }
    }

    /// Average power over the most recent `rows_to_average` rows.
    pub async fn read(&self) -> Reading {
        match retry(&self.policy, "power database query", || self.query()).await {
            Ok(power) => Reading::Value(power),
            Err(_) => Reading::Unavailable,
        }
    }

    async fn query(&self) -> Result<f64> {
        let credentials = &self.config.credentials;

        let mut config = Config::new();
        config.host(&credentials.host);
        config.port(credentials.port.value()?);
        config.database(&credentials.database_name);
        config.authentication(AuthMethod::sql_server(
            &credentials.username,
            &credentials.password,
        ));
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .context("couldn't connect to power database")?;
        tcp.set_nodelay(true)?;

        let mut client = Client::connect(config, tcp.compat_write()).await?;
        let rows = client
            .simple_query(build_query(&self.config))
            .await?
            .into_first_result()
            .await?;

        let columns = self.config.table.data_columns.len();
        let values = rows
            .iter()
            .map(|row| (0..columns).map(|i| column_value(row, i)).collect())
            .collect::<Result<Vec<Vec<f64>>>>()?;

        if let Err(e) = client.close().await {
            log::debug!("couldn't close power database connection: {e}");
        }

        average_power(&values).context("power query returned no rows")
    }
}

/// `SELECT TOP n [c1],[c2] FROM [db].[dbo].[table] ORDER BY [time] DESC`
fn build_query(config: &DatabaseConfig) -> String {
    let columns = config
        .table
        .data_columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "SELECT TOP {} {columns} FROM {}.[dbo].{} ORDER BY {} DESC",
        config.rows_to_average,
        quote(&config.credentials.database_name),
        quote(&config.table.name),
        quote(&config.table.time_column),
    )
}

fn quote(identifier: &str) -> String {
    format!("[{}]", identifier.replace(']', "]]"))
}

/// Sum each row's data columns (negative readings count as zero) and average
/// over the rows.
fn average_power(rows: &[Vec<f64>]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let total: f64 = rows
        .iter()
        .map(|row| row.iter().map(|v| v.max(0.0)).sum::<f64>())
        .sum();
    Some(total / rows.len() as f64)
}

/// Read a numeric column of any SQL numeric type. NULL counts as zero.
fn column_value(row: &Row, index: usize) -> Result<f64> {
    if let Ok(value) = row.try_get::<f64, _>(index) {
        return Ok(value.unwrap_or(0.0));
    }
    if let Ok(value) = row.try_get::<f32, _>(index) {
        return Ok(value.map_or(0.0, f64::from));
    }
    if let Ok(value) = row.try_get::<Numeric, _>(index) {
        return Ok(value.map_or(0.0, f64::from));
    }
    if let Ok(value) = row.try_get::<i64, _>(index) {
        return Ok(value.map_or(0.0, |v| v as f64));
    }
    if let Ok(value) = row.try_get::<i32, _>(index) {
        return Ok(value.map_or(0.0, f64::from));
    }
    bail!("column {index} is not numeric")
}
