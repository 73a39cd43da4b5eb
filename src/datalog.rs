use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

/// Append-only destination for one record per tick.
pub trait RecordSink {
    fn log(&mut self, values: &[f64], timestamp: i64) -> Result<()>;
}

/// CSV logger writing one file per UTC day:
/// `<folder>/<prefix>_<YYYY-MM-DD>.csv`, with a `timestamp` column followed by
/// the header given at construction.
#[derive(Debug, Clone)]
pub struct Datalog {
    folder: PathBuf,
    prefix: String,
    header: Vec<String>,
}

impl Datalog {
    pub fn new(folder: impl Into<PathBuf>, prefix: &str, header: Vec<String>) -> Result<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder)
            .with_context(|| format!("couldn't create log folder {}", folder.display()))?;

        Ok(Self {
            folder,
            prefix: prefix.to_string(),
            header,
        })
    }

    /// Path of the file a record with this timestamp goes to.
    pub fn path_for(&self, timestamp: i64) -> Result<PathBuf> {
        let Some(time) = DateTime::<Utc>::from_timestamp(timestamp, 0) else {
            bail!("timestamp {timestamp} out of range");
        };
        Ok(self.folder.join(format!(
            "{}_{}.csv",
            self.prefix,
            time.format("%Y-%m-%d")
        )))
    }
}

impl RecordSink for Datalog {
    fn log(&mut self, values: &[f64], timestamp: i64) -> Result<()> {
        if values.len() != self.header.len() {
            bail!(
                "record has {} values but the log has {} columns",
                values.len(),
                self.header.len()
            );
        }

        let path = self.path_for(timestamp)?;
        let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("couldn't open {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if is_new {
            let columns = std::iter::once("timestamp").chain(self.header.iter().map(String::as_str));
            writer.write_record(columns)?;
        }
        writer.write_record(
            std::iter::once(timestamp.to_string()).chain(values.iter().map(|v| v.to_string())),
        )?;
        writer.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Record {
        timestamp: i64,
        values: Vec<f64>,
    }

    fn read_records(path: &Path) -> Result<Vec<Record>> {
        let mut reader = csv::Reader::from_path(path)?;

        reader
            .records()
            .map(|record| -> Result<Record> {
                let record = record?;
                let mut fields = record.iter();
                let timestamp = fields
                    .next()
                    .context("empty record")?
                    .parse()
                    .context("bad timestamp")?;
                let values = fields
                    .map(|f| f.parse::<f64>().context("bad value"))
                    .collect::<Result<_>>()?;
                Ok(Record { timestamp, values })
            })
            .collect()
    }

    fn header() -> Vec<String> {
        vec!["Temperature".into(), "Sound".into(), "Total_power".into()]
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Datalog::new(dir.path(), "ne_data", header()).unwrap();

        let timestamp = 1_700_000_040;
        let values = vec![21.25, 0.123444, 1234.5678901234];
        log.log(&values, timestamp).unwrap();
        log.log(&[22.0, 0.0, -3.5], timestamp + 60).unwrap();

        let path = log.path_for(timestamp).unwrap();
        let records = read_records(&path).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0], Record { timestamp, values });
        assert_eq!(records[1].timestamp, timestamp + 60);
        assert_eq!(records[1].values, vec![22.0, 0.0, -3.5]);
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Datalog::new(dir.path(), "ne_data", header()).unwrap();

        log.log(&[1.0, 2.0, 3.0], 0).unwrap();
        log.log(&[4.0, 5.0, 6.0], 60).unwrap();

        let content = fs::read_to_string(log.path_for(0).unwrap()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "timestamp,Temperature,Sound,Total_power");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_one_file_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let log = Datalog::new(dir.path(), "house_results", header()).unwrap();

        // 2023-11-14 22:13:20 UTC and a day later
        let first = log.path_for(1_700_000_000).unwrap();
        let second = log.path_for(1_700_000_000 + 86_400).unwrap();

        assert!(first.ends_with("house_results_2023-11-14.csv"));
        assert!(second.ends_with("house_results_2023-11-15.csv"));
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Datalog::new(dir.path(), "ne_data", header()).unwrap();
        assert!(log.log(&[1.0], 0).is_err());
    }
}
