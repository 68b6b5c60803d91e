//! Periodic update scheduler.
//!
//! Runs one update pass over every updatable repository at start-up and
//! then on every tick of the poll interval. Passes never overlap: the loop
//! awaits each pass before waiting for the next tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use karasync_core::sync_engine::SyncEngine;

/// Aggregate counters across passes.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub passes: AtomicU64,
    pub repositories_updated: AtomicU64,
    pub failures: AtomicU64,
    pub consecutive_failed_passes: AtomicU64,
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    poll_interval: Duration,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Loop until `shutdown` is notified. An in-flight pass is finished
    /// before the loop exits.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass("scheduled").await;
                }
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Update every repository once. Returns the number of failed
    /// repositories.
    pub async fn run_pass(&self, trigger: &str) -> usize {
        let pass = self.stats.passes.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pass, trigger, "starting update pass");

        let results = self.engine.update_all().await;
        let mut failed = 0usize;
        for result in &results {
            match result {
                Ok(report) => {
                    self.stats
                        .repositories_updated
                        .fetch_add(1, Ordering::SeqCst);
                    info!(
                        repository = %report.repository,
                        from = report.from_revision.as_deref().unwrap_or("none"),
                        to = report.to_revision.as_deref().unwrap_or("none"),
                        changes = report.changes,
                        "repository up to date"
                    );
                }
                Err(e) if e.code() == "already_running" => {
                    warn!(repository = %e.repository, "update skipped: already running");
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        repository = %e.repository,
                        code = e.code(),
                        error = %e,
                        "update failed"
                    );
                }
            }
        }

        self.stats
            .failures
            .fetch_add(failed as u64, Ordering::SeqCst);
        if failed > 0 {
            let consecutive = self
                .stats
                .consecutive_failed_passes
                .fetch_add(1, Ordering::SeqCst)
                + 1;
            warn!(pass, failed, consecutive, "update pass finished with failures");
        } else {
            self.stats
                .consecutive_failed_passes
                .store(0, Ordering::SeqCst);
            info!(pass, repositories = results.len(), "update pass finished");
        }
        failed
    }
}
