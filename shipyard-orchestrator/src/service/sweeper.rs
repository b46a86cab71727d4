//! Stale workflow sweeper
//!
//! Force-fails active workflows with no activity past the staleness threshold,
//! deletes terminal workflows past the retention window and purges expired
//! webhook delivery ids.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{self, Duration};
use tracing::{error, info};

use super::orchestrator::{Orchestrator, OrchestratorError, Result};
use crate::gateway::DeliveryDedup;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Workflows force-failed by this sweep
    pub expired: usize,
    pub deleted: u64,
    /// Delivery ids dropped from the dedup cache
    pub purged: usize,
}

pub struct Sweeper {
    orchestrator: Arc<Orchestrator>,
    dedup: Arc<DeliveryDedup>,
    stale_after: Duration,
    retention: Duration,
}

impl Sweeper {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        dedup: Arc<DeliveryDedup>,
        stale_after: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            orchestrator,
            dedup,
            stale_after,
            retention,
        }
    }

    pub async fn run(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Starting sweeper (interval: {:?}, stale after: {}, retention: {})",
            interval,
            format_duration(self.stale_after),
            format_duration(self.retention)
        );

        let mut interval = time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => info!(
                            "Sweep expired {} workflow(s), deleted {}, purged {} delivery id(s)",
                            report.expired, report.deleted, report.purged
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Error during sweep: {}", e),
                    }
                }
            }
        }
    }

    /// One sweep pass.
    ///
    /// Safe to run concurrently with itself: each stale workflow is claimed
    /// before it is failed, so only one sweep counts and reports it.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let stale_cutoff = now - to_chrono(self.stale_after)?;
        let retention_cutoff = now - to_chrono(self.retention)?;
        let reason = format!(
            "timed out after {} of inactivity",
            format_duration(self.stale_after)
        );

        let workflows = &self.orchestrator.repositories().workflows;
        let mut report = SweepReport::default();

        for workflow in workflows.find_stale(stale_cutoff).await? {
            match self
                .orchestrator
                .expire(workflow.id, stale_cutoff, &reason)
                .await
            {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to expire workflow {}: {}", workflow.id, e),
            }
        }

        report.deleted = workflows.delete_terminal_before(retention_cutoff).await?;
        report.purged = self.dedup.purge_expired().await;
        Ok(report)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| OrchestratorError::Validation(format!("duration {:?} is out of range", duration)))
}

/// Render whole hours, minutes or seconds: `24h`, `90m`, `45s`
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
