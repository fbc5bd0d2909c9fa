use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// How long a writer waits for a competing IMMEDIATE transaction before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the engine database at `path` and make sure the schema exists.
///
/// Every component owns its own connection; call this once per component
/// after the process has started rather than sharing a handle.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise the engine schema in `conn`.
///
/// Creates the `schedules` and `job_runs` tables (idempotent). `job_runs`
/// deliberately has no foreign key on `schedule_id`: deleting a schedule
/// leaves its history in place with a dangling reference.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id               TEXT    NOT NULL PRIMARY KEY,
            identifier       TEXT    NOT NULL UNIQUE,
            template_ref     TEXT    NOT NULL,
            schedule_type    TEXT    NOT NULL,
            cron_expression  TEXT,
            interval_minutes INTEGER,
            start_time       TEXT,               -- HH:MM
            start_date       TEXT,               -- YYYY-MM-DD
            is_active        INTEGER NOT NULL DEFAULT 1,
            is_global        INTEGER NOT NULL DEFAULT 0,
            owner_id         TEXT,
            last_run         TEXT,
            next_run         TEXT,
            parameters       TEXT    NOT NULL DEFAULT '{}',
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        -- Trigger polling: WHERE is_active = 1 AND next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (is_active, next_run);

        CREATE TABLE IF NOT EXISTS job_runs (
            id                TEXT NOT NULL PRIMARY KEY,
            schedule_id       TEXT,
            template_ref      TEXT NOT NULL,
            job_name          TEXT NOT NULL,
            job_type          TEXT NOT NULL,
            queue             TEXT,
            status            TEXT NOT NULL DEFAULT 'pending',
            triggered_by      TEXT NOT NULL,
            dispatch_id       TEXT,
            queued_at         TEXT NOT NULL,
            started_at        TEXT,
            completed_at      TEXT,
            last_heartbeat_at TEXT,
            result            TEXT,
            error_message     TEXT,
            target_scope      TEXT NOT NULL DEFAULT '[]'
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs (status, queued_at);
        CREATE INDEX IF NOT EXISTS idx_job_runs_schedule ON job_runs (schedule_id, queued_at);
        ",
    )?;
    Ok(())
}

/// Lock a component's connection, turning a poisoned mutex into an error.
pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| SchedulerError::Internal("database connection lock poisoned".into()))
}

/// Fixed-width RFC 3339 (microseconds, `Z` suffix) so that string comparison
/// in SQL orders instants chronologically.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn opt_ts_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

/// Decode a JSON text column.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode a `FromStr` enum stored as text (status, schedule type, …).
pub(crate) fn enum_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(500);
        let c = a + chrono::Duration::seconds(1);
        let (fa, fb, fc) = (fmt_ts(a), fmt_ts(b), fmt_ts(c));
        assert_eq!(fa, "2024-01-01T09:00:00.000000Z");
        assert!(fa < fb && fb < fc);
        assert_eq!(parse_ts(0, &fb).unwrap(), b);
    }

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('schedules', 'job_runs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
