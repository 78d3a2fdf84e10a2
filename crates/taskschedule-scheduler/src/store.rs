use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use taskschedule_core::{ExecutionId, TaskId};
use tracing::{debug, info, warn};

use crate::db::{
    execution_from_row, init_db, task_from_row, to_sql, EXECUTION_COLUMNS, TASK_COLUMNS,
};
use crate::error::{Result, SchedulerError};
use crate::schedule::first_run_at;
use crate::types::{Execution, ExecutionStatus, NewTask, Task, TaskStatus, TaskUpdate, Trigger};
use crate::validate::validate_new_task;

/// Diagnostic written to executions orphaned by a previous process.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: scheduler restarted";

/// Task reads and the bookkeeping the dispatcher needs.
pub trait TaskStore: Send + Sync {
    fn get_task(&self, id: &TaskId) -> Result<Task>;

    /// Active tasks whose `next_run_at` is at or before `now`, oldest first.
    fn get_due_active_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    fn update_next_run_at(&self, id: &TaskId, next: Option<DateTime<Utc>>) -> Result<()>;

    /// Count one finished occurrence. A single `x = x + 1` statement so
    /// concurrent completions never lose an update.
    fn increment_stats(
        &self,
        id: &TaskId,
        success: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Durable execution log.
pub trait ExecutionStore: Send + Sync {
    fn create_execution(
        &self,
        task_id: &TaskId,
        trigger: Trigger,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<Execution>;

    fn get_execution(&self, id: &ExecutionId) -> Result<Execution>;

    /// `pending -> running`. Returns `false` when the execution was no
    /// longer pending (already cancelled or picked up).
    fn mark_started(
        &self,
        id: &ExecutionId,
        worker_node: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move a pending or running execution to its terminal state.
    ///
    /// Statistics, once-task deactivation and retry creation happen in the
    /// same transaction as the status change.
    fn mark_completed(&self, id: &ExecutionId, completion: &Completion) -> Result<CompletionRecord>;

    /// `pending -> cancelled`, counted as a failed occurrence. Returns
    /// `false` when the execution was not pending.
    fn cancel_pending(&self, id: &ExecutionId, now: DateTime<Utc>) -> Result<bool>;

    /// Newest first; `limit` of `None` returns everything.
    fn list_executions_for_task(
        &self,
        task_id: &TaskId,
        limit: Option<usize>,
    ) -> Result<Vec<Execution>>;

    fn list_executions_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>>;

    /// Delete terminal executions created more than `age` before `now`.
    fn purge_executions_older_than(&self, age: Duration, now: DateTime<Utc>) -> Result<usize>;

    /// Close executions left pending/running by a previous process as
    /// counted failures. Returns how many were closed.
    fn reconcile_interrupted(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Everything the scheduler needs from persistence.
pub trait SchedulerStore: TaskStore + ExecutionStore {}

impl<T: TaskStore + ExecutionStore> SchedulerStore for T {}

/// Terminal transition request for [`ExecutionStore::mark_completed`].
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
    pub completed_at: DateTime<Utc>,
    /// Last attempt of its occurrence: count it in the task statistics and
    /// retire a finished once-task.
    pub final_outcome: bool,
    /// Create a pending retry with this attempt number in the same transaction.
    pub retry_attempt: Option<u32>,
}

impl Completion {
    pub fn new(status: ExecutionStatus, completed_at: DateTime<Utc>) -> Self {
        Self {
            status,
            output: String::new(),
            error_output: String::new(),
            exit_code: None,
            completed_at,
            final_outcome: true,
            retry_attempt: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_output = message.into();
        self
    }
}

/// Result of a terminal transition.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub execution: Execution,
    pub retry: Option<Execution>,
}

/// SQLite-backed store shared by the dispatcher, workers and the CLI.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SchedulerError::Internal(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        info!(path = %path.display(), "database opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Internal("database mutex poisoned".into()))
    }

    // ---- task registry ----------------------------------------------------

    /// Validate and store a new task in `draft` status.
    pub fn create_task(&self, new: NewTask, now: DateTime<Utc>) -> Result<Task> {
        validate_new_task(&new)?;
        let id = TaskId::new();
        let now_s = to_sql(now);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks
             (id, name, description, script_file, script_content, schedule_kind,
              schedule_value, status, environment_variables, timeout_seconds,
              max_retries, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'draft',?8,?9,?10,?11,?11)",
            params![
                id.as_str(),
                new.name.trim(),
                new.description,
                new.script_file,
                new.script_content,
                new.schedule_kind.as_str(),
                new.schedule_value.trim(),
                new.environment_variables,
                new.timeout_seconds,
                new.max_retries,
                now_s,
            ],
        )?;
        info!(task_id = %id, name = %new.name, kind = %new.schedule_kind, "task created");
        fetch_task(&conn, &id)
    }

    /// Apply a partial edit. An active task whose schedule changed gets a
    /// fresh `next_run_at`.
    pub fn update_task(
        &self,
        id: &TaskId,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let conn = self.conn()?;
        let current = fetch_task(&conn, id)?;
        let merged = update.apply_to(&current);
        validate_new_task(&merged)?;

        let next_run = if current.status == TaskStatus::Active && update.touches_schedule() {
            first_run_at(merged.schedule_kind, &merged.schedule_value, now)
        } else {
            current.next_run_at
        };

        conn.execute(
            "UPDATE tasks SET name = ?2, description = ?3, script_file = ?4,
                    script_content = ?5, schedule_kind = ?6, schedule_value = ?7,
                    environment_variables = ?8, timeout_seconds = ?9, max_retries = ?10,
                    next_run_at = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                id.as_str(),
                merged.name.trim(),
                merged.description,
                merged.script_file,
                merged.script_content,
                merged.schedule_kind.as_str(),
                merged.schedule_value.trim(),
                merged.environment_variables,
                merged.timeout_seconds,
                merged.max_retries,
                next_run.map(to_sql),
                to_sql(now),
            ],
        )?;
        info!(task_id = %id, "task updated");
        fetch_task(&conn, id)
    }

    /// Change lifecycle status. Activating a task without a due time seeds it.
    pub fn set_task_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let conn = self.conn()?;
        let current = fetch_task(&conn, id)?;

        let next_run = match (status, current.next_run_at) {
            (TaskStatus::Active, None) => {
                first_run_at(current.schedule_kind, &current.schedule_value, now)
            }
            (_, existing) => existing,
        };

        conn.execute(
            "UPDATE tasks SET status = ?2, next_run_at = ?3, updated_at = ?4 WHERE id = ?1",
            params![id.as_str(), status.as_str(), next_run.map(to_sql), to_sql(now)],
        )?;
        info!(task_id = %id, from = %current.status, to = %status, "task status changed");
        fetch_task(&conn, id)
    }

    /// Delete a task and, by cascade, all of its executions.
    pub fn delete_task(&self, id: &TaskId) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM tasks WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// All tasks ordered by creation time.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, id"
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }
}

impl TaskStore for SqliteStore {
    fn get_task(&self, id: &TaskId) -> Result<Task> {
        let conn = self.conn()?;
        fetch_task(&conn, id)
    }

    fn get_due_active_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at"
        ))?;
        let tasks = stmt
            .query_map([to_sql(now)], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn update_next_run_at(&self, id: &TaskId, next: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET next_run_at = ?2 WHERE id = ?1",
            params![id.as_str(), next.map(to_sql)],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    fn increment_stats(
        &self,
        id: &TaskId,
        success: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        bump_stats(&conn, id, success, completed_at)
    }
}

impl ExecutionStore for SqliteStore {
    fn create_execution(
        &self,
        task_id: &TaskId,
        trigger: Trigger,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<Execution> {
        let conn = self.conn()?;
        insert_execution(&conn, task_id, trigger, attempt, now)
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        let conn = self.conn()?;
        fetch_execution(&conn, id)
    }

    fn mark_started(
        &self,
        id: &ExecutionId,
        worker_node: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE executions SET status = 'running', started_at = ?2, worker_node = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id.as_str(), to_sql(now), worker_node],
        )?;
        Ok(n == 1)
    }

    fn mark_completed(
        &self,
        id: &ExecutionId,
        completion: &Completion,
    ) -> Result<CompletionRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let record = complete_in_tx(&tx, id, completion, &["pending", "running"])?;
        tx.commit()?;
        Ok(record)
    }

    fn cancel_pending(&self, id: &ExecutionId, now: DateTime<Utc>) -> Result<bool> {
        let completion = Completion::new(ExecutionStatus::Cancelled, now)
            .with_error("Cancelled before start");
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match complete_in_tx(&tx, id, &completion, &["pending"]) {
            Ok(_) => {
                tx.commit()?;
                Ok(true)
            }
            Err(SchedulerError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list_executions_for_task(
        &self,
        task_id: &TaskId,
        limit: Option<usize>,
    ) -> Result<Vec<Execution>> {
        let conn = self.conn()?;
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE task_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![task_id.as_str(), limit], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_executions_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE status = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([status.as_str()], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn purge_executions_older_than(&self, age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.checked_sub_signed(age).ok_or_else(|| {
            SchedulerError::Internal(format!("retention window of {age} is out of range"))
        })?;
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM executions
             WHERE created_at < ?1 AND status NOT IN ('pending', 'running')",
            [to_sql(cutoff)],
        )?;
        if n > 0 {
            info!(deleted = n, cutoff = %cutoff, "old executions purged");
        }
        Ok(n)
    }

    fn reconcile_interrupted(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let orphaned: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM executions WHERE status IN ('pending', 'running')",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        if orphaned.is_empty() {
            return Ok(0);
        }

        let completion =
            Completion::new(ExecutionStatus::Failure, now).with_error(INTERRUPTED_MESSAGE);
        let tx = conn.transaction()?;
        for id in &orphaned {
            let id = ExecutionId::from(id.as_str());
            complete_in_tx(&tx, &id, &completion, &["pending", "running"])?;
        }
        tx.commit()?;
        warn!(count = orphaned.len(), "closed executions interrupted by a restart");
        Ok(orphaned.len())
    }
}

fn fetch_task(conn: &Connection, id: &TaskId) -> Result<Task> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        [id.as_str()],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
}

fn fetch_execution(conn: &Connection, id: &ExecutionId) -> Result<Execution> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
        [id.as_str()],
        execution_from_row,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::ExecutionNotFound { id: id.to_string() })
}

fn insert_execution(
    conn: &Connection,
    task_id: &TaskId,
    trigger: Trigger,
    attempt: u32,
    now: DateTime<Utc>,
) -> Result<Execution> {
    let id = ExecutionId::new();
    let inserted = conn.execute(
        "INSERT INTO executions (id, task_id, status, trigger_kind, attempt, created_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
        params![id.as_str(), task_id.as_str(), trigger.as_str(), attempt, to_sql(now)],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(SchedulerError::TaskNotFound { id: task_id.to_string() });
        }
        Err(e) => return Err(e.into()),
    }
    debug!(
        execution_id = %id,
        task_id = %task_id,
        trigger = %trigger,
        attempt,
        "execution created"
    );
    fetch_execution(conn, &id)
}

fn bump_stats(
    conn: &Connection,
    id: &TaskId,
    success: bool,
    completed_at: DateTime<Utc>,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE tasks SET
            total_runs      = total_runs + 1,
            successful_runs = successful_runs + ?2,
            failed_runs     = failed_runs + ?3,
            last_run_at     = ?4
         WHERE id = ?1",
        params![
            id.as_str(),
            success as i64,
            (!success) as i64,
            to_sql(completed_at)
        ],
    )?;
    if n == 0 {
        return Err(SchedulerError::TaskNotFound { id: id.to_string() });
    }
    Ok(())
}

fn complete_in_tx(
    tx: &Transaction<'_>,
    id: &ExecutionId,
    completion: &Completion,
    allowed_from: &[&str],
) -> Result<CompletionRecord> {
    let current = fetch_execution(tx, id)?;
    if !allowed_from.contains(&current.status.as_str()) {
        return Err(SchedulerError::InvalidTransition {
            id: id.to_string(),
            from: current.status.to_string(),
            to: completion.status.to_string(),
        });
    }

    let elapsed = current.started_at.map(|start| {
        let micros = (completion.completed_at - start).num_microseconds().unwrap_or(0);
        micros as f64 / 1e6
    });

    tx.execute(
        "UPDATE executions SET status = ?2, completed_at = ?3, output = ?4,
                error_output = ?5, exit_code = ?6, execution_time_seconds = ?7
         WHERE id = ?1",
        params![
            id.as_str(),
            completion.status.as_str(),
            to_sql(completion.completed_at),
            completion.output,
            completion.error_output,
            completion.exit_code,
            elapsed,
        ],
    )?;

    if completion.final_outcome {
        let success = completion.status == ExecutionStatus::Success;
        bump_stats(tx, &current.task_id, success, completion.completed_at)?;
        // a once-task whose single occurrence has been dispatched is done
        tx.execute(
            "UPDATE tasks SET status = 'inactive', updated_at = ?2
             WHERE id = ?1 AND schedule_kind = 'once' AND status = 'active'
               AND next_run_at IS NULL",
            params![current.task_id.as_str(), to_sql(completion.completed_at)],
        )?;
    }

    let retry = match completion.retry_attempt {
        Some(attempt) => Some(insert_execution(
            tx,
            &current.task_id,
            Trigger::Retry,
            attempt,
            completion.completed_at,
        )?),
        None => None,
    };

    Ok(CompletionRecord {
        execution: fetch_execution(tx, id)?,
        retry,
    })
}
