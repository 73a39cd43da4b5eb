use std::path::PathBuf;

use clap::Parser;

/// Sample home telemetry on a fixed schedule and flag anomalous power draw.
#[derive(Debug, Parser)]
#[command(name = "sequential-blr", version)]
pub struct Args {
    /// Z-Way server, optionally with a port (default 8083)
    pub hostname: String,

    /// Z-Way username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Z-Way password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Record microphone loudness as an extra feature
    #[arg(short, long)]
    pub sound: bool,

    /// JSON analysis settings; defaults are used when omitted
    #[arg(short = 'f', long)]
    pub settings_file: Option<PathBuf>,

    /// Start on the next multiple of the granularity
    #[arg(short, long)]
    pub time_align: bool,

    /// Log samples without running detection
    #[arg(short = 'o', long)]
    pub collect_only: bool,

    /// JSON file with the power database connection
    #[arg(long, default_value = "config.json")]
    pub database_config: PathBuf,

    /// Folder for the data and results logs
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl Args {
    /// Z-Way credentials, only when both parts were given.
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["sequential-blr", "zway.local"]).unwrap();

        assert_eq!(args.hostname, "zway.local");
        assert!(!args.sound && !args.time_align && !args.collect_only);
        assert_eq!(args.settings_file, None);
        assert_eq!(args.database_config, PathBuf::from("config.json"));
        assert_eq!(args.credentials(), None);
    }

    #[test]
    fn test_short_flags() {
        let args = Args::try_parse_from([
            "sequential-blr",
            "10.0.0.2:8083",
            "-u",
            "admin",
            "-p",
            "hunter2",
            "-s",
            "-t",
            "-o",
            "-f",
            "settings.json",
        ])
        .unwrap();

        assert!(args.sound && args.time_align && args.collect_only);
        assert_eq!(args.settings_file, Some(PathBuf::from("settings.json")));
        assert_eq!(
            args.credentials(),
            Some(("admin".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    fn test_credentials_need_both_parts() {
        let args = Args::try_parse_from(["sequential-blr", "host", "-u", "admin"]).unwrap();
        assert_eq!(args.credentials(), None);
    }

    #[test]
    fn test_hostname_is_required() {
        assert!(Args::try_parse_from(["sequential-blr"]).is_err());
    }
}
