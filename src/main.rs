mod cli;
mod datalog;
mod detector;
mod scheduler;
mod settings;
mod sources;

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::Args,
    datalog::Datalog,
    detector::Detector,
    scheduler::{Scheduler, SchedulerOptions, SystemClock},
    settings::{DatabaseConfig, Settings},
    sources::{
        FeatureAssembler, FeatureSource, power::PowerSource, retry::RetryPolicy,
        sound::SoundSampler, zway::ZwayClient,
    },
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    let settings = match &args.settings_file {
        Some(path) => Settings::load(path),
        None => Ok(Settings::default()),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("couldn't load settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    let database = match DatabaseConfig::load(&args.database_config) {
        Ok(database) => database,
        Err(e) => {
            log::error!("couldn't load database config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(args, settings, database).await {
        log::error!("{e:#}");
    }
    ExitCode::FAILURE
}

/// Set up the collaborators and run the scheduler. Only returns on a start-up
/// error.
async fn run(args: Args, settings: Settings, database: DatabaseConfig) -> Result<()> {
    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sequential-blr"),
    };

    let telemetry =
        ZwayClient::connect(&args.hostname, args.credentials(), RetryPolicy::default())
            .await
            .with_context(|| format!("couldn't reach z-way server at {}", args.hostname))?;
    log::info!(
        "z-way reads give up after {:?} of backoff per channel",
        telemetry.read_policy().max_total_wait()
    );
    let sound = args.sound.then(SoundSampler::default);
    let power = PowerSource::new(database, RetryPolicy::per_tick());
    // leave the second half of each period for sound, power and detection
    let budget = Duration::from_secs(settings.granularity.max(2) / 2);
    let source = FeatureAssembler::new(telemetry, sound, power).with_telemetry_budget(budget);

    let detector = Detector::from_settings(source.num_features(), &settings)?;

    let header = source.header();
    let severity = detector.severity();
    println!("The following features will be used: {header:?}");
    println!(
        "w = {:.3}, L = {:.3}, alpha = {:.3}",
        severity.omega,
        severity.lambda,
        detector.ema_alpha()
    );

    let data_log = Datalog::new(&data_dir, &settings.prefix, header)?;
    let results_log = Datalog::new(
        &data_dir,
        &format!("{}_results", settings.prefix),
        vec![
            "target".to_string(),
            "prediction".to_string(),
            "anomaly".to_string(),
        ],
    )?;
    log::info!("logging to {}", data_dir.display());

    let options = SchedulerOptions {
        granularity: settings.granularity,
        time_align: args.time_align,
        collect_only: args.collect_only,
    };
    Scheduler::new(SystemClock, source, detector, data_log, results_log, options)
        .run()
        .await;

    Ok(())
}
