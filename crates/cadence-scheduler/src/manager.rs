use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    db::{enum_column, fmt_ts, json_column, lock, opt_ts_column, ts_column},
    error::{Result, SchedulerError},
    schedule::compute_next_run,
    types::{NewSchedule, Schedule, ScheduleFilter, ScheduleType, ScheduleUpdate},
    validation::{normalize, validate},
};

const SCHEDULE_COLUMNS: &str = "id, identifier, template_ref, schedule_type, cron_expression,
     interval_minutes, start_time, start_date, is_active, is_global, owner_id,
     last_run, next_run, parameters, created_at, updated_at";

/// CRUD over the schedule store.
///
/// Every mutation that can move a schedule's timing recomputes `next_run`
/// and writes it in the same statement/transaction as the row itself.
pub struct ScheduleManager {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl ScheduleManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        Self {
            db: Mutex::new(conn),
            clock,
        }
    }

    /// Validate and persist a new schedule. Active schedules get their first
    /// `next_run` computed from now.
    #[instrument(skip(self, new), fields(identifier = %new.identifier, schedule_type = %new.schedule_type))]
    pub fn create(&self, new: NewSchedule) -> Result<Schedule> {
        let now = self.clock.now();
        let mut schedule = Schedule {
            id: Uuid::now_v7().to_string(),
            identifier: new.identifier,
            template_ref: new.template_ref,
            schedule_type: new.schedule_type,
            cron_expression: new.cron_expression,
            interval_minutes: new.interval_minutes,
            start_time: new.start_time,
            start_date: new.start_date,
            is_active: new.is_active,
            is_global: new.is_global,
            owner_id: new.owner_id,
            last_run: None,
            next_run: None,
            parameters: new.parameters,
            created_at: now,
            updated_at: now,
        };
        normalize(&mut schedule);
        anchor_start_date(&mut schedule, now);
        validate(&schedule)?;
        schedule.next_run = next_run_from(&schedule, now);

        let db = lock(&self.db)?;
        insert_schedule(&db, &schedule)?;
        info!(schedule_id = %schedule.id, next_run = ?schedule.next_run, "schedule created");
        Ok(schedule)
    }

    /// Retrieve a schedule by id, returning `None` if it does not exist.
    pub fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let db = lock(&self.db)?;
        load_schedule(&db, id)
    }

    /// Retrieve a schedule by its user-facing identifier.
    pub fn get_by_identifier(&self, identifier: &str) -> Result<Option<Schedule>> {
        let db = lock(&self.db)?;
        let schedule = db
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE identifier = ?1"),
                [identifier],
                row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    /// Return schedules matching every set field of `filter`, oldest first.
    pub fn list(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(owner) = &filter.owner_id {
            clauses.push("owner_id = ?");
            params.push(owner.clone().into());
        }
        if let Some(global) = filter.is_global {
            clauses.push("is_global = ?");
            params.push(i64::from(global).into());
        }
        if let Some(active) = filter.is_active {
            clauses.push("is_active = ?");
            params.push(i64::from(active).into());
        }
        if let Some(user) = &filter.visible_to {
            clauses.push("(is_global = 1 OR owner_id = ?)");
            params.push(user.clone().into());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules {where_sql} ORDER BY created_at, id"
        ))?;
        let schedules = stmt
            .query_map(rusqlite::params_from_iter(params), row_to_schedule)?
            .filter_map(|r| match r {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("skipping undecodable schedule row: {e}");
                    None
                }
            })
            .collect();
        Ok(schedules)
    }

    /// Apply a partial update atomically.
    ///
    /// `next_run` is recomputed from now (not from the previous `next_run`)
    /// only when a timing field or `is_active` changed, so an occurrence that
    /// was imminent before the edit may be skipped. Any other edit leaves
    /// `next_run` untouched.
    #[instrument(skip(self, changes))]
    pub fn update(&self, id: &str, changes: ScheduleUpdate) -> Result<Schedule> {
        let now = self.clock.now();
        let mut db = lock(&self.db)?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = load_schedule(&tx, id)?.ok_or_else(|| SchedulerError::ScheduleNotFound {
            id: id.to_string(),
        })?;
        let mut updated = current.clone();
        apply_changes(&mut updated, changes);
        normalize(&mut updated);
        anchor_start_date(&mut updated, now);
        validate(&updated)?;

        let retime = timing_changed(&current, &updated) || current.is_active != updated.is_active;
        if retime {
            updated.next_run = next_run_from(&updated, now);
            debug!(previous = ?current.next_run, next_run = ?updated.next_run, "timing changed, next_run recomputed");
        }
        updated.updated_at = now;

        write_schedule(&tx, &updated)?;
        tx.commit()?;
        info!(schedule_id = %id, retimed = retime, "schedule updated");
        Ok(updated)
    }

    /// Hard delete. Runs that reference this schedule keep the dangling id.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let db = lock(&self.db)?;
        let n = db.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    /// Record a trigger at `ran_at` and advance `next_run` from it.
    ///
    /// Returns `None` when the schedule no longer exists.
    pub fn update_run_times(&self, id: &str, ran_at: DateTime<Utc>) -> Result<Option<Schedule>> {
        let mut db = lock(&self.db)?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut schedule) = load_schedule(&tx, id)? else {
            return Ok(None);
        };
        schedule.last_run = Some(ran_at);
        schedule.next_run = next_run_from(&schedule, ran_at);
        schedule.updated_at = self.clock.now();
        write_run_times(&tx, id, ran_at, schedule.next_run, schedule.updated_at)?;
        tx.commit()?;
        Ok(Some(schedule))
    }

    /// Startup repair: give every active schedule without a `next_run` one.
    ///
    /// Covers a crash between inserting a schedule and committing its first
    /// `next_run`. Idempotent; `now` schedules are left alone since they
    /// never carry a `next_run`.
    #[instrument(skip(self))]
    pub fn initialize_missing_next_runs(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut db = lock(&self.db)?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let missing: Vec<Schedule> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules
                 WHERE is_active = 1 AND next_run IS NULL AND schedule_type != 'now'"
            ))?;
            let rows = stmt
                .query_map([], row_to_schedule)?
                .filter_map(|r| match r {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!("startup repair skipping undecodable schedule row: {e}");
                        None
                    }
                })
                .collect();
            rows
        };

        let mut repaired = 0;
        for schedule in missing {
            match compute_next_run(&schedule, now) {
                Some(next) => {
                    tx.execute(
                        "UPDATE schedules SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![fmt_ts(next), fmt_ts(now), schedule.id],
                    )?;
                    repaired += 1;
                }
                None => warn!(
                    schedule_id = %schedule.id,
                    "active schedule has no computable next_run"
                ),
            }
        }
        tx.commit()?;

        if repaired > 0 {
            warn!(count = repaired, "backfilled missing next_run values");
        }
        Ok(repaired)
    }
}

// --- store helpers, shared with the trigger engine ---------------------------

/// `next_run` for a schedule as it should be persisted at `reference`.
pub(crate) fn next_run_from(schedule: &Schedule, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if schedule.is_active {
        compute_next_run(schedule, reference)
    } else {
        None
    }
}

pub(crate) fn load_schedule(conn: &Connection, id: &str) -> Result<Option<Schedule>> {
    let schedule = conn
        .query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
            [id],
            row_to_schedule,
        )
        .optional()?;
    Ok(schedule)
}

/// Ids of active schedules due at `now`, global ones first, oldest due first.
pub(crate) fn due_schedule_ids(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM schedules
         WHERE is_active = 1 AND next_run IS NOT NULL AND next_run <= ?1
         ORDER BY is_global DESC, next_run",
    )?;
    let ids = stmt
        .query_map([fmt_ts(now)], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Active `now` schedules that have never fired.
pub(crate) fn unfired_one_shot_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM schedules
         WHERE is_active = 1 AND schedule_type = 'now' AND last_run IS NULL
         ORDER BY created_at, id",
    )?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

pub(crate) fn write_run_times(
    conn: &Connection,
    id: &str,
    last_run: DateTime<Utc>,
    next_run: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE schedules SET last_run = ?1, next_run = ?2, updated_at = ?3 WHERE id = ?4",
        rusqlite::params![fmt_ts(last_run), next_run.map(fmt_ts), fmt_ts(updated_at), id],
    )?;
    Ok(())
}

fn insert_schedule(conn: &Connection, s: &Schedule) -> Result<()> {
    let parameters = serde_json::to_string(&s.parameters)?;
    conn.execute(
        &format!(
            "INSERT INTO schedules ({SCHEDULE_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)"
        ),
        rusqlite::params![
            s.id,
            s.identifier,
            s.template_ref,
            s.schedule_type.to_string(),
            s.cron_expression,
            s.interval_minutes,
            s.start_time,
            s.start_date.map(fmt_date),
            s.is_active,
            s.is_global,
            s.owner_id,
            s.last_run.map(fmt_ts),
            s.next_run.map(fmt_ts),
            parameters,
            fmt_ts(s.created_at),
            fmt_ts(s.updated_at),
        ],
    )
    .map_err(|e| unique_violation(e, &s.identifier))?;
    Ok(())
}

fn write_schedule(conn: &Connection, s: &Schedule) -> Result<()> {
    let parameters = serde_json::to_string(&s.parameters)?;
    conn.execute(
        "UPDATE schedules SET
            identifier = ?2, template_ref = ?3, schedule_type = ?4, cron_expression = ?5,
            interval_minutes = ?6, start_time = ?7, start_date = ?8, is_active = ?9,
            is_global = ?10, owner_id = ?11, next_run = ?12, parameters = ?13, updated_at = ?14
         WHERE id = ?1",
        rusqlite::params![
            s.id,
            s.identifier,
            s.template_ref,
            s.schedule_type.to_string(),
            s.cron_expression,
            s.interval_minutes,
            s.start_time,
            s.start_date.map(fmt_date),
            s.is_active,
            s.is_global,
            s.owner_id,
            s.next_run.map(fmt_ts),
            parameters,
            fmt_ts(s.updated_at),
        ],
    )
    .map_err(|e| unique_violation(e, &s.identifier))?;
    Ok(())
}

fn unique_violation(err: rusqlite::Error, identifier: &str) -> SchedulerError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            SchedulerError::DuplicateIdentifier {
                identifier: identifier.to_string(),
            }
        }
        _ => SchedulerError::Database(err),
    }
}

fn apply_changes(s: &mut Schedule, changes: ScheduleUpdate) {
    if let Some(v) = changes.identifier {
        s.identifier = v;
    }
    if let Some(v) = changes.template_ref {
        s.template_ref = v;
    }
    if let Some(v) = changes.schedule_type {
        s.schedule_type = v;
    }
    if let Some(v) = changes.cron_expression {
        s.cron_expression = Some(v);
    }
    if let Some(v) = changes.interval_minutes {
        s.interval_minutes = Some(v);
    }
    if let Some(v) = changes.start_time {
        s.start_time = Some(v);
    }
    if let Some(v) = changes.start_date {
        s.start_date = v;
    }
    if let Some(v) = changes.is_active {
        s.is_active = v;
    }
    if let Some(v) = changes.is_global {
        s.is_global = v;
    }
    if let Some(v) = changes.owner_id {
        s.owner_id = v;
    }
    if let Some(v) = changes.parameters {
        s.parameters = v;
    }
}

fn timing_changed(before: &Schedule, after: &Schedule) -> bool {
    before.schedule_type != after.schedule_type
        || before.cron_expression != after.cron_expression
        || before.interval_minutes != after.interval_minutes
        || before.start_time != after.start_time
        || before.start_date != after.start_date
}

/// Weekly and monthly schedules need a stable weekday / day-of-month anchor;
/// default it to the day the schedule was defined.
fn anchor_start_date(s: &mut Schedule, now: DateTime<Utc>) {
    if matches!(s.schedule_type, ScheduleType::Weekly | ScheduleType::Monthly) && s.start_date.is_none() {
        s.start_date = Some(now.date_naive());
    }
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Map a SQLite row to a `Schedule`.
pub(crate) fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let start_date = row
        .get::<_, Option<String>>(7)?
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))
        })
        .transpose()?;

    Ok(Schedule {
        id: row.get(0)?,
        identifier: row.get(1)?,
        template_ref: row.get(2)?,
        schedule_type: enum_column(row, 3)?,
        cron_expression: row.get(4)?,
        interval_minutes: row.get(5)?,
        start_time: row.get(6)?,
        start_date,
        is_active: row.get(8)?,
        is_global: row.get(9)?,
        owner_id: row.get(10)?,
        last_run: opt_ts_column(row, 11)?,
        next_run: opt_ts_column(row, 12)?,
        parameters: json_column(row, 13)?,
        created_at: ts_column(row, 14)?,
        updated_at: ts_column(row, 15)?,
    })
}
