//! ChurnForge: churn prediction and purchase-trend CLI
//!
//! Loads configuration, wires the CSV source and the snapshot worker into the
//! analysis service, runs the requested command and prints its result as JSON.

use anyhow::{Context, Result};
use churnforge::cli::Command;
use churnforge::config::LoggingConfig;
use churnforge::{AppConfig, Args, CustomerAnalysis, NoopSink, ResultSink, SnapshotWorker};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply_overrides(&mut config);
    init_tracing(&config.logging)?;

    info!(
        data_dir = %config.data.dir.display(),
        command = ?args.command,
        "Starting ChurnForge"
    );

    let worker = match config.snapshot_settings() {
        Some(settings) => Some(Arc::new(
            SnapshotWorker::spawn(settings).context("starting snapshot worker")?,
        )),
        None => None,
    };
    let sink: Arc<dyn ResultSink> = match &worker {
        Some(worker) => Arc::clone(worker) as Arc<dyn ResultSink>,
        None => Arc::new(NoopSink),
    };

    let mut service = CustomerAnalysis::new(config.data_source())
        .with_settings(config.analysis_settings())
        .with_sink(sink);
    if let Some(as_of) = config.as_of()? {
        service = service.with_as_of(as_of);
    }

    let start_time = Instant::now();
    let output = match &args.command {
        Command::Churn => {
            let evaluation = service.predict_churn().context("baseline churn prediction")?;
            serde_json::to_string_pretty(&evaluation)?
        }
        Command::ChurnReduced { .. } => {
            let evaluation = service
                .predict_churn_reduced(config.model.components)
                .context("reduced churn prediction")?;
            serde_json::to_string_pretty(&evaluation)?
        }
        Command::Trends { .. } => {
            let report = service.analyze_trends().context("trend analysis")?;
            serde_json::to_string_pretty(&report)?
        }
    };
    println!("{output}");

    info!(
        elapsed_secs = start_time.elapsed().as_secs_f64(),
        "Pipeline complete"
    );

    // Let queued snapshots finish before the process exits
    if let Some(worker) = worker {
        worker.shutdown();
    }
    Ok(())
}

/// Logs go to stderr so stdout carries only the JSON result.
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("churnforge={}", logging.level))
            .with_context(|| format!("invalid log level {:?}", logging.level))?,
    };

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}
