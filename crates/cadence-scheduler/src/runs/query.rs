use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use tracing::warn;

use super::lifecycle::{load_run, RunLifecycleManager};
use super::types::{JobRun, PageRequest, RunFilter, RunPage, RunStatus, RunSummary};
use crate::{
    db::{enum_column, fmt_ts, json_column, lock, opt_ts_column, ts_column},
    error::Result,
    routing::{JobType, Queue},
};

pub(crate) const RUN_COLUMNS: &str = "r.id, r.schedule_id, r.template_ref, r.job_name, r.job_type,
     r.queue, r.status, r.triggered_by, r.dispatch_id, r.queued_at, r.started_at,
     r.completed_at, r.last_heartbeat_at, r.result, r.error_message, r.target_scope";

/// Index of the joined `schedules.identifier` column in summary queries.
const IDENTIFIER_COLUMN: usize = 16;

const SUMMARY_FROM: &str = "job_runs r LEFT JOIN schedules s ON s.id = r.schedule_id";

impl RunLifecycleManager {
    /// Retrieve a run by id.
    pub fn get(&self, run_id: &str) -> Result<Option<JobRun>> {
        let db = lock(&self.db)?;
        load_run(&db, run_id)
    }

    /// One page of runs matching `filter`, newest first, with the schedule
    /// identifier resolved where the schedule still exists.
    pub fn list(&self, filter: &RunFilter, page: PageRequest) -> Result<RunPage> {
        let sql_filter = SqlFilter::from_run_filter(filter, "r.");
        let where_sql = sql_filter.where_sql();
        let db = lock(&self.db)?;

        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM job_runs r {where_sql}"),
            rusqlite::params_from_iter(sql_filter.params.iter()),
            |row| row.get(0),
        )?;

        let mut params = sql_filter.params;
        params.push(Value::Integer(i64::from(page.per_page)));
        params.push(Value::Integer(page.offset()));
        let items = query_summaries(
            &db,
            &format!(
                "SELECT {RUN_COLUMNS}, s.identifier FROM {SUMMARY_FROM} {where_sql}
                 ORDER BY r.queued_at DESC, r.id DESC LIMIT ? OFFSET ?"
            ),
            params,
        )?;

        Ok(RunPage {
            items,
            total: u64::try_from(total).unwrap_or_default(),
            page: page.page,
            per_page: page.per_page,
        })
    }

    /// The `limit` most recent runs, optionally narrowed to one status and/or
    /// one job type. Unlike [`list`](Self::list) the limit is not capped;
    /// `0` yields nothing.
    pub fn recent(
        &self,
        limit: u32,
        status: Option<RunStatus>,
        job_type: Option<JobType>,
    ) -> Result<Vec<RunSummary>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = RunFilter::default()
            .with_statuses(status)
            .with_job_types(job_type);
        let mut sql_filter = SqlFilter::from_run_filter(&filter, "r.");
        let where_sql = sql_filter.where_sql();
        sql_filter.params.push(Value::Integer(i64::from(limit)));
        let db = lock(&self.db)?;
        query_summaries(
            &db,
            &format!(
                "SELECT {RUN_COLUMNS}, s.identifier FROM {SUMMARY_FROM} {where_sql}
                 ORDER BY r.queued_at DESC, r.id DESC LIMIT ?"
            ),
            sql_filter.params,
        )
    }

    /// Runs queued at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>, filter: &RunFilter) -> Result<Vec<RunSummary>> {
        let mut sql_filter = SqlFilter::from_run_filter(filter, "r.");
        sql_filter.push_clause("r.queued_at >= ?", Value::Text(fmt_ts(since)));
        let db = lock(&self.db)?;
        query_summaries(
            &db,
            &format!(
                "SELECT {RUN_COLUMNS}, s.identifier FROM {SUMMARY_FROM} {}
                 ORDER BY r.queued_at, r.id",
                sql_filter.where_sql()
            ),
            sql_filter.params,
        )
    }

    /// Latest `limit` runs created for one schedule, newest first.
    pub fn by_schedule(&self, schedule_id: &str, limit: u32) -> Result<Vec<JobRun>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs r
             WHERE r.schedule_id = ?1
             ORDER BY r.queued_at DESC, r.id DESC LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(rusqlite::params![schedule_id, limit], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn running_count(&self) -> Result<u64> {
        self.count_status(RunStatus::Running)
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.count_status(RunStatus::Pending)
    }

    /// Number of runs per status. Every status is present, zero included.
    pub fn status_counts(&self) -> Result<BTreeMap<RunStatus, u64>> {
        let mut counts: BTreeMap<RunStatus, u64> =
            RunStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let db = lock(&self.db)?;
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM job_runs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (raw, n) = row?;
            match raw.parse::<RunStatus>() {
                Ok(status) => {
                    counts.insert(status, u64::try_from(n).unwrap_or_default());
                }
                Err(e) => warn!("ignoring runs with {e}"),
            }
        }
        Ok(counts)
    }

    fn count_status(&self, status: RunStatus) -> Result<u64> {
        let db = lock(&self.db)?;
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM job_runs WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or_default())
    }
}

fn query_summaries(
    conn: &rusqlite::Connection,
    sql: &str,
    params: Vec<Value>,
) -> Result<Vec<RunSummary>> {
    let mut stmt = conn.prepare(sql)?;
    let items = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            Ok(RunSummary {
                run: row_to_run(row)?,
                schedule_identifier: row.get(IDENTIFIER_COLUMN)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

/// WHERE-clause builder over `job_runs`.
///
/// `prefix` is the table alias including the dot (`"r."`), or empty for
/// statements that cannot alias the table (`DELETE`).
pub(crate) struct SqlFilter {
    prefix: &'static str,
    clauses: Vec<String>,
    pub(crate) params: Vec<Value>,
}

impl SqlFilter {
    pub(crate) fn from_run_filter(filter: &RunFilter, prefix: &'static str) -> Self {
        let mut f = Self {
            prefix,
            clauses: Vec::new(),
            params: Vec::new(),
        };
        f.push_in("status", filter.statuses.iter().map(|s| s.to_string()));
        f.push_in("job_type", filter.job_types.iter().map(|t| t.to_string()));
        f.push_in("triggered_by", filter.triggered_by.iter().map(|t| t.to_string()));
        f.push_in("schedule_id", filter.schedule_ids.iter().cloned());
        f.push_in("template_ref", filter.template_refs.iter().cloned());
        f
    }

    /// `column IN (…)`; an empty value set adds nothing.
    pub(crate) fn push_in(&mut self, column: &str, values: impl IntoIterator<Item = String>) {
        let values: Vec<Value> = values.into_iter().map(Value::Text).collect();
        if values.is_empty() {
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.clauses
            .push(format!("{}{column} IN ({placeholders})", self.prefix));
        self.params.extend(values);
    }

    pub(crate) fn push_clause(&mut self, clause: &str, value: Value) {
        self.clauses.push(clause.to_string());
        self.params.push(value);
    }

    pub(crate) fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Map a SQLite row (selected with [`RUN_COLUMNS`]) to a `JobRun`.
///
/// A job type this build does not know decodes as [`JobType::Unknown`] so
/// history written by other versions stays readable.
pub(crate) fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRun> {
    let job_type = row
        .get::<_, String>(4)?
        .parse::<JobType>()
        .unwrap_or(JobType::Unknown);
    let queue = row
        .get::<_, Option<String>>(5)?
        .map(|raw| {
            raw.parse::<Queue>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))
        })
        .transpose()?;
    let result = row
        .get::<_, Option<String>>(13)?
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, Box::new(e)))
        })
        .transpose()?;

    Ok(JobRun {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        template_ref: row.get(2)?,
        job_name: row.get(3)?,
        job_type,
        queue,
        status: enum_column(row, 6)?,
        triggered_by: enum_column(row, 7)?,
        dispatch_id: row.get(8)?,
        queued_at: ts_column(row, 9)?,
        started_at: opt_ts_column(row, 10)?,
        completed_at: opt_ts_column(row, 11)?,
        last_heartbeat_at: opt_ts_column(row, 12)?,
        result,
        error_message: row.get(14)?,
        target_scope: json_column(row, 15)?,
    })
}
