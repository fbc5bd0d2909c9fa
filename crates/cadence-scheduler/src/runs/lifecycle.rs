use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::query::{row_to_run, SqlFilter, RUN_COLUMNS};
use super::types::{JobRun, NewRun, RunFilter, RunStatus};
use crate::{
    clock::Clock,
    db::{fmt_ts, lock},
    error::{Result, SchedulerError},
};

/// Sole writer of the job run store.
///
/// Every transition is a single conditional `UPDATE … WHERE status IN (…)`,
/// so the state check and the write are one atomic step. A transition that
/// does not apply (missing run, wrong source state, duplicate delivery)
/// changes nothing and returns `Ok(None)`.
pub struct RunLifecycleManager {
    pub(super) db: Mutex<Connection>,
    pub(super) clock: Arc<dyn Clock>,
}

impl RunLifecycleManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        Self {
            db: Mutex::new(conn),
            clock,
        }
    }

    /// Insert a new `pending` run.
    ///
    /// Must be called before the run is handed to the execution layer so a
    /// crash in between leaves a visible orphan instead of untracked work.
    #[instrument(skip(self, new), fields(template_ref = %new.template_ref, triggered_by = %new.triggered_by))]
    pub fn create(&self, new: NewRun) -> Result<JobRun> {
        let now = self.clock.now();
        let db = lock(&self.db)?;
        insert_pending(&db, new, now)
    }

    /// `pending → running`. Records the execution layer's correlation id.
    #[instrument(skip(self))]
    pub fn mark_started(&self, run_id: &str, dispatch_id: &str) -> Result<Option<JobRun>> {
        let now = fmt_ts(self.clock.now());
        self.transition(
            run_id,
            "mark_started",
            "UPDATE job_runs SET status = 'running', started_at = ?2, dispatch_id = ?3
             WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![run_id, now, dispatch_id],
        )
    }

    /// `running → completed`.
    ///
    /// A run that never reported `mark_started` cannot be completed; the call
    /// is ignored and the run stays where it is.
    #[instrument(skip(self, result))]
    pub fn mark_completed(
        &self,
        run_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<JobRun>> {
        let now = fmt_ts(self.clock.now());
        let result = result.map(|v| serde_json::to_string(&v)).transpose()?;
        self.transition(
            run_id,
            "mark_completed",
            "UPDATE job_runs SET status = 'completed', completed_at = ?2, result = ?3
             WHERE id = ?1 AND status = 'running'",
            rusqlite::params![run_id, now, result],
        )
    }

    /// `running → failed`, or `pending → failed` for dispatch-time failures.
    #[instrument(skip(self))]
    pub fn mark_failed(&self, run_id: &str, error_message: &str) -> Result<Option<JobRun>> {
        let now = fmt_ts(self.clock.now());
        self.transition(
            run_id,
            "mark_failed",
            "UPDATE job_runs SET status = 'failed', completed_at = ?2, error_message = ?3
             WHERE id = ?1 AND status IN ('pending', 'running')",
            rusqlite::params![run_id, now, error_message],
        )
    }

    /// `pending|running → cancelled`. Bookkeeping only: the worker is not
    /// guaranteed to stop.
    #[instrument(skip(self))]
    pub fn mark_cancelled(&self, run_id: &str) -> Result<Option<JobRun>> {
        let now = fmt_ts(self.clock.now());
        self.transition(
            run_id,
            "mark_cancelled",
            "UPDATE job_runs SET status = 'cancelled', completed_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'running')",
            rusqlite::params![run_id, now],
        )
    }

    /// Record worker progress on a running run. Returns `false` when the run
    /// is not running (anymore).
    pub fn heartbeat(&self, run_id: &str) -> Result<bool> {
        let now = fmt_ts(self.clock.now());
        let db = lock(&self.db)?;
        let n = db.execute(
            "UPDATE job_runs SET last_heartbeat_at = ?2 WHERE id = ?1 AND status = 'running'",
            rusqlite::params![run_id, now],
        )?;
        Ok(n == 1)
    }

    /// Fail every running run whose latest progress signal (heartbeat, or
    /// start when none was ever sent) is older than `threshold`.
    ///
    /// Returns the ids of the runs that were failed.
    #[instrument(skip(self), fields(threshold_secs = threshold.num_seconds()))]
    pub fn detect_and_fail_stale(&self, threshold: Duration) -> Result<Vec<String>> {
        let now = self.clock.now();
        let message = format!(
            "worker lost: no progress reported for more than {}s",
            threshold.num_seconds()
        );
        let ids = self.fail_where(
            "status = 'running' AND COALESCE(last_heartbeat_at, started_at) < ?3",
            now,
            now - threshold,
            &message,
        )?;
        for id in &ids {
            warn!(run_id = %id, "stale run failed");
        }
        Ok(ids)
    }

    /// Fail pending runs queued longer than `ttl` ago. The broker has dropped
    /// their message by then, so no worker will ever pick them up.
    #[instrument(skip(self), fields(ttl_secs = ttl.num_seconds()))]
    pub fn fail_expired_pending(&self, ttl: Duration) -> Result<Vec<String>> {
        let now = self.clock.now();
        let message = format!(
            "dispatch expired: not picked up within {}s",
            ttl.num_seconds()
        );
        let ids = self.fail_where(
            "status = 'pending' AND queued_at < ?3",
            now,
            now - ttl,
            &message,
        )?;
        for id in &ids {
            warn!(run_id = %id, "expired pending run failed");
        }
        Ok(ids)
    }

    /// Delete terminal runs that finished more than `age` ago.
    #[instrument(skip(self), fields(age_days = age.num_days()))]
    pub fn cleanup_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = fmt_ts(self.clock.now() - age);
        let db = lock(&self.db)?;
        let n = db.execute(
            "DELETE FROM job_runs
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND COALESCE(completed_at, queued_at) < ?1",
            [cutoff],
        )?;
        if n > 0 {
            info!(count = n, "old runs purged");
        }
        Ok(n)
    }

    /// Delete every terminal run. Pending and running runs are kept.
    pub fn clear_all(&self) -> Result<usize> {
        let db = lock(&self.db)?;
        let n = db.execute(
            "DELETE FROM job_runs WHERE status IN ('completed', 'failed', 'cancelled')",
            [],
        )?;
        info!(count = n, "run history cleared");
        Ok(n)
    }

    /// Delete terminal runs matching `filter`.
    ///
    /// A filter that names `pending` or `running` is rejected outright;
    /// with no status filter only terminal rows are considered.
    pub fn clear_filtered(&self, filter: &RunFilter) -> Result<usize> {
        let in_flight: Vec<&str> = filter
            .statuses
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.as_str())
            .collect();
        if !in_flight.is_empty() {
            return Err(SchedulerError::InFlightDeletion {
                statuses: in_flight.join(", "),
            });
        }

        let mut sql_filter = SqlFilter::from_run_filter(filter, "");
        sql_filter.push_in("status", RunStatus::TERMINAL.iter().map(|s| s.to_string()));

        let db = lock(&self.db)?;
        let n = db.execute(
            &format!("DELETE FROM job_runs {}", sql_filter.where_sql()),
            rusqlite::params_from_iter(sql_filter.params),
        )?;
        info!(count = n, "filtered runs cleared");
        Ok(n)
    }

    // --- private helpers ---------------------------------------------------

    fn transition(
        &self,
        run_id: &str,
        op: &'static str,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<JobRun>> {
        let db = lock(&self.db)?;
        let n = db.execute(sql, params)?;
        let run = load_run(&db, run_id)?;
        match (&run, n) {
            (Some(run), 1) => {
                info!(run_id = %run_id, status = %run.status, "{op}");
                Ok(Some(run.clone()))
            }
            (Some(run), _) => {
                debug!(run_id = %run_id, status = %run.status, "{op} ignored: not valid from current state");
                Ok(None)
            }
            (None, _) => {
                debug!(run_id = %run_id, "{op} ignored: run not found");
                Ok(None)
            }
        }
    }

    /// `?1` = now, `?2` = message, `?3` = cutoff.
    fn fail_where(
        &self,
        condition: &str,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<String>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(&format!(
            "UPDATE job_runs SET status = 'failed', completed_at = ?1, error_message = ?2
             WHERE {condition}
             RETURNING id"
        ))?;
        let ids = stmt
            .query_map(
                rusqlite::params![fmt_ts(now), message, fmt_ts(cutoff)],
                |row| row.get::<_, String>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

/// Insert a pending run on `conn`. Used directly by the trigger so the run
/// is created inside its claim transaction.
pub(crate) fn insert_pending(conn: &Connection, new: NewRun, now: DateTime<Utc>) -> Result<JobRun> {
    let run = JobRun {
        id: Uuid::now_v7().to_string(),
        schedule_id: new.schedule_id,
        template_ref: new.template_ref,
        job_name: new.job_name,
        job_type: new.job_type,
        queue: new.queue,
        status: RunStatus::Pending,
        triggered_by: new.triggered_by,
        dispatch_id: None,
        queued_at: now,
        started_at: None,
        completed_at: None,
        last_heartbeat_at: None,
        result: None,
        error_message: None,
        target_scope: new.target_scope,
    };
    let target_scope = serde_json::to_string(&run.target_scope)?;

    conn.execute(
        "INSERT INTO job_runs
         (id, schedule_id, template_ref, job_name, job_type, queue, status,
          triggered_by, queued_at, target_scope)
         VALUES (?1,?2,?3,?4,?5,?6,'pending',?7,?8,?9)",
        rusqlite::params![
            run.id,
            run.schedule_id,
            run.template_ref,
            run.job_name,
            run.job_type.as_str(),
            run.queue.map(|q| q.as_str()),
            run.triggered_by.as_str(),
            fmt_ts(run.queued_at),
            target_scope,
        ],
    )?;
    info!(run_id = %run.id, job_type = %run.job_type, "run created");
    Ok(run)
}

pub(crate) fn load_run(conn: &Connection, run_id: &str) -> Result<Option<JobRun>> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM job_runs r WHERE r.id = ?1"),
            [run_id],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}
