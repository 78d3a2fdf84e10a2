//! `taskschedule executions|cancel|purge`

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use taskschedule_core::ExecutionId;
use taskschedule_scheduler::{ExecutionStore, SqliteStore};

use super::task::parse_task_id;
use super::{fmt_time, Output};

pub fn list(store: &SqliteStore, task_id: &str, limit: usize, out: &Output) -> Result<()> {
    let executions = store.list_executions_for_task(&parse_task_id(task_id)?, Some(limit))?;
    if out.print_json(&executions)? {
        return Ok(());
    }
    if executions.is_empty() {
        println!("No executions.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<9}  {:<8}  {:>3}  {:<19}  {:>9}  {:>4}",
        "ID", "STATUS", "TRIGGER", "TRY", "STARTED", "SECONDS", "EXIT"
    );
    for e in &executions {
        println!(
            "{:<36}  {:<9}  {:<8}  {:>3}  {:<19}  {:>9}  {:>4}",
            e.id,
            e.status,
            e.trigger,
            e.attempt,
            fmt_time(e.started_at),
            e.execution_time_seconds
                .map(|s| format!("{s:.2}"))
                .unwrap_or_else(|| "-".into()),
            e.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
        );
    }
    Ok(())
}

/// Only pending executions can be cancelled from outside the serving
/// process; running ones belong to the worker that owns the child.
pub fn cancel(store: &SqliteStore, id: &str) -> Result<()> {
    let id: ExecutionId = id
        .parse()
        .with_context(|| format!("invalid execution id '{id}'"))?;
    if store.cancel_pending(&id, Utc::now())? {
        println!("Cancelled execution {id}");
        return Ok(());
    }
    let current = store.get_execution(&id)?;
    bail!("execution {id} is {} and cannot be cancelled here", current.status)
}

pub fn purge(store: &SqliteStore, days: i64) -> Result<()> {
    if days < 0 {
        bail!("--days must not be negative");
    }
    let age = Duration::try_days(days).context("--days is out of range")?;
    let deleted = store.purge_executions_older_than(age, Utc::now())?;
    println!("Purged {deleted} execution(s) older than {days} day(s)");
    Ok(())
}
