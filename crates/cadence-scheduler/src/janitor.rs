use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::{error::Result, runs::RunLifecycleManager};

/// Janitor cadence and thresholds.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
    /// Running runs silent for longer than this are failed as lost.
    pub stale_after: Duration,
    /// Pending runs older than this are failed as expired. Matches the
    /// dispatcher's message TTL.
    pub pending_ttl: Duration,
    /// Terminal runs older than this are deleted. `None` keeps history forever.
    pub retention: Option<Duration>,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(2 * 3600),
            pending_ttl: Duration::from_secs(3600),
            retention: Some(Duration::from_secs(30 * 24 * 3600)),
        }
    }
}

/// Counts from one janitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_failed: Vec<String>,
    pub expired_failed: Vec<String>,
    pub purged: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale_failed.is_empty() && self.expired_failed.is_empty() && self.purged == 0
    }
}

/// Crash recovery and housekeeping for the run store, on its own cadence
/// independent of the trigger.
pub struct Janitor {
    runs: Arc<RunLifecycleManager>,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(runs: Arc<RunLifecycleManager>, config: JanitorConfig) -> Self {
        Self { runs, config }
    }

    /// One pass: fail lost running runs, fail expired pending runs, then
    /// purge old history.
    pub fn sweep(&self) -> Result<SweepReport> {
        let stale_failed = self.runs.detect_and_fail_stale(to_chrono(self.config.stale_after))?;
        let expired_failed = self.runs.fail_expired_pending(to_chrono(self.config.pending_ttl))?;
        let purged = match self.config.retention {
            Some(age) => self.runs.cleanup_older_than(to_chrono(age))?,
            None => 0,
        };
        Ok(SweepReport {
            stale_failed,
            expired_failed,
            purged,
        })
    }

    /// Sweep every `config.interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "janitor started");
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep() {
                        Ok(report) if !report.is_empty() => info!(
                            stale = report.stale_failed.len(),
                            expired = report.expired_failed.len(),
                            purged = report.purged,
                            "janitor sweep"
                        ),
                        Ok(_) => {}
                        Err(e) => error!("janitor sweep error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("janitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
