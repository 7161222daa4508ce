#![warn(missing_docs)]

//! The `replogd` daemon.

use anyhow::{Context, Result};
use clap::Parser;
use replogd::cli::Cli;
use replogd::{EngineReport, LdifExportConnector, QueueDumper, Supervisor};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = cli.load_config()?;
    let export_dir = config
        .export_dir
        .clone()
        .unwrap_or_else(|| config.work_dir.join("export"));
    tracing::info!(
        "replogd starting: {} replicas, exporting to {}",
        config.replicas.len(),
        export_dir.display()
    );
    let connector = Arc::new(LdifExportConnector::new(export_dir));

    let one_shot = config.one_shot;
    let supervisor = Supervisor::new(config, connector)?;
    let engine = supervisor.start()?;
    let handle = engine.shutdown_handle();
    let dumper = engine.dumper();

    if let Some(report) = engine.one_shot_report() {
        println!("total: {}", report.total);
        println!("to process: {}", report.pending);
    }
    let join = tokio::task::spawn_blocking(move || engine.join());

    let report = if one_shot {
        join.await?
    } else {
        let signal = wait_for_signal(&dumper).await;
        handle.trigger();
        let report = join.await?;
        signal?;
        report
    };
    log_report(&report);
    Ok(())
}

/// Wait for a signal that stops the daemon. SIGUSR2 dumps the queue and
/// keeps waiting.
#[cfg(unix)]
async fn wait_for_signal(dumper: &QueueDumper) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return Ok(res?),
            _ = term.recv() => return Ok(()),
            _ = hup.recv() => return Ok(()),
            _ = usr2.recv() => {
                let dumper = dumper.clone();
                tokio::task::spawn_blocking(move || dumper.dump_or_warn()).await?;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(dumper: &QueueDumper) -> Result<()> {
    tracing::debug!("queue dumps to {} are unavailable", dumper.path().display());
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn log_report(report: &EngineReport) {
    for (replica, stats) in &report.replicas {
        tracing::info!(
            "replica {}: {} applied, {} skipped, {} rejected, {} retries",
            replica,
            stats.applied,
            stats.skipped_other + stats.skipped_old,
            stats.rejected,
            stats.retries
        );
    }
    tracing::debug!(
        "ingestor: {} bytes copied, {} records, {} malformed, {} trims",
        report.ingest.bytes_copied,
        report.ingest.records,
        report.ingest.malformed,
        report.ingest.trims
    );
}
