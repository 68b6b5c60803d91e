//! karasync daemon entry point.
//!
//! Loads configuration, opens the database, and runs the update scheduler
//! until a shutdown signal arrives.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use karasync_core::config::AppConfig;
use karasync_core::db::Database;
use karasync_core::lock::RepoLocks;
use karasync_core::remote::HttpRemote;
use karasync_core::sync_engine::SyncEngine;

/// karasync update daemon.
#[derive(Parser, Debug)]
#[command(
    name = "karasync-daemon",
    version,
    about = "Keeps karaoke content repositories in sync with their origin"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single update pass and exit.
    #[arg(long)]
    once: bool,
}

/// Console logging, plus a daily-rotated file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(level: &str, log_dir: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "karasync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = init_tracing(&log_level, config.daemon.log_dir.as_ref())?;

    info!("karasync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config = %args.config.display(),
        repositories = config.repositories.len(),
        poll_interval_secs = config.daemon.poll_interval_secs,
        data_dir = %config.daemon.data_dir.display(),
        log_level = %log_level,
        "starting"
    );
    for repo in &config.repositories {
        info!(
            repository = %repo.name,
            mode = %repo.transport_mode(),
            enabled = repo.enabled,
            update = repo.update,
            base_dir = %repo.base_dir.display(),
            "repository configured"
        );
    }

    let db = Database::open_in(&config.daemon.data_dir).with_context(|| {
        format!("failed to open database in {}", config.daemon.data_dir.display())
    })?;

    let remote = HttpRemote::new(&config.http).context("failed to build HTTP client")?;
    let poll_interval = std::time::Duration::from_secs(config.daemon.poll_interval_secs);
    let engine = Arc::new(SyncEngine::new(
        config,
        Arc::new(db),
        Arc::new(remote),
        RepoLocks::new(),
    ));

    let scheduler = scheduler::Scheduler::new(engine, poll_interval);
    if args.once {
        let failed = scheduler.run_pass("once").await;
        info!(failed, "single update pass finished");
        return Ok(());
    }

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("shutdown signal received, stopping");
    shutdown.notify_one();

    match tokio::time::timeout(std::time::Duration::from_secs(30), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped"),
        Ok(Err(e)) => warn!(error = %e, "scheduler task error"),
        Err(_) => warn!("scheduler did not stop within 30s, exiting anyway"),
    }

    info!("karasync daemon stopped");
    Ok(())
}
