use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use crate::error::Result;
use crate::types::{Execution, Task};

/// Initialise the scheduler schema in `conn`.
///
/// Timestamps are stored as fixed-width RFC 3339 strings (UTC, microsecond
/// precision) so that lexical comparison in SQL equals time ordering.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                    TEXT    NOT NULL PRIMARY KEY,
            name                  TEXT    NOT NULL,
            description           TEXT    NOT NULL DEFAULT '',
            script_file           TEXT,
            script_content        TEXT    NOT NULL DEFAULT '',
            schedule_kind         TEXT    NOT NULL,   -- once | interval | cron
            schedule_value        TEXT    NOT NULL DEFAULT '',
            status                TEXT    NOT NULL DEFAULT 'draft',
            environment_variables TEXT    NOT NULL DEFAULT '',
            timeout_seconds       INTEGER NOT NULL DEFAULT 3600,
            max_retries           INTEGER NOT NULL DEFAULT 3,
            total_runs            INTEGER NOT NULL DEFAULT 0,
            successful_runs       INTEGER NOT NULL DEFAULT 0,
            failed_runs           INTEGER NOT NULL DEFAULT 0,
            last_run_at           TEXT,
            next_run_at           TEXT,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL
        ) STRICT;

        -- Due scan: WHERE status = 'active' AND next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, next_run_at);

        CREATE TABLE IF NOT EXISTS executions (
            id                     TEXT    NOT NULL PRIMARY KEY,
            task_id                TEXT    NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
            status                 TEXT    NOT NULL DEFAULT 'pending',
            trigger_kind           TEXT    NOT NULL DEFAULT 'schedule',
            attempt                INTEGER NOT NULL DEFAULT 0,
            started_at             TEXT,
            completed_at           TEXT,
            created_at             TEXT    NOT NULL,
            output                 TEXT    NOT NULL DEFAULT '',
            error_output           TEXT    NOT NULL DEFAULT '',
            exit_code              INTEGER,
            execution_time_seconds REAL,
            worker_node            TEXT    NOT NULL DEFAULT ''
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_task ON executions (task_id, status);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions (status, created_at);
        ",
    )?;
    Ok(())
}

/// Render a timestamp in the canonical stored form.
pub fn to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) const TASK_COLUMNS: &str = "id, name, description, script_file, script_content,
     schedule_kind, schedule_value, status, environment_variables,
     timeout_seconds, max_retries, total_runs, successful_runs, failed_runs,
     last_run_at, next_run_at, created_at, updated_at";

pub(crate) const EXECUTION_COLUMNS: &str = "id, task_id, status, trigger_kind, attempt,
     started_at, completed_at, created_at, output, error_output, exit_code,
     execution_time_seconds, worker_node";

/// Map a row selected with [`TASK_COLUMNS`].
pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get::<_, String>(0)?.into(),
        name: row.get(1)?,
        description: row.get(2)?,
        script_file: row.get(3)?,
        script_content: row.get(4)?,
        schedule_kind: parse_col(row, 5)?,
        schedule_value: row.get(6)?,
        status: parse_col(row, 7)?,
        environment_variables: row.get(8)?,
        timeout_seconds: row.get(9)?,
        max_retries: row.get(10)?,
        total_runs: row.get(11)?,
        successful_runs: row.get(12)?,
        failed_runs: row.get(13)?,
        last_run_at: opt_ts_col(row, 14)?,
        next_run_at: opt_ts_col(row, 15)?,
        created_at: ts_col(row, 16)?,
        updated_at: ts_col(row, 17)?,
    })
}

/// Map a row selected with [`EXECUTION_COLUMNS`].
pub(crate) fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: row.get::<_, String>(0)?.into(),
        task_id: row.get::<_, String>(1)?.into(),
        status: parse_col(row, 2)?,
        trigger: parse_col(row, 3)?,
        attempt: row.get(4)?,
        started_at: opt_ts_col(row, 5)?,
        completed_at: opt_ts_col(row, 6)?,
        created_at: ts_col(row, 7)?,
        output: row.get(8)?,
        error_output: row.get(9)?,
        exit_code: row.get(10)?,
        execution_time_seconds: row.get(11)?,
        worker_node: row.get(12)?,
    })
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => ts_col(row, idx).map(Some),
    }
}
