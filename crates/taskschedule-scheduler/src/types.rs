use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskschedule_core::{ExecutionId, TaskId};
use tracing::debug;

/// How a task recurs. The matching `schedule_value` is interpreted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Single fire. `schedule_value` is empty or an RFC 3339 instant.
    Once,
    /// Repeat every N seconds; `schedule_value` holds N.
    Interval,
    /// Five-field cron expression (UTC).
    Cron,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Once => "once",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Cron => "cron",
        }
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(ScheduleKind::Once),
            "interval" => Ok(ScheduleKind::Interval),
            "cron" => Ok(ScheduleKind::Cron),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Lifecycle state of a task definition. Only `Active` tasks are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Active,
    Paused,
    Inactive,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TaskStatus::Draft),
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "inactive" => Ok(TaskStatus::Inactive),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// State of one execution attempt.
///
/// `Pending -> Running -> {Success | Failure | Timeout | Cancelled}`, plus
/// `Pending -> Cancelled` for executions cancelled before a worker started them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failure" => Ok(ExecutionStatus::Failure),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// What caused an execution to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The dispatcher found the task due.
    Schedule,
    /// Someone asked for an immediate run.
    Manual,
    /// Automatic retry of a failed or timed-out attempt.
    Retry,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
            Trigger::Retry => "retry",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Trigger::Schedule),
            "manual" => Ok(Trigger::Manual),
            "retry" => Ok(Trigger::Retry),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// A persisted task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    /// Path to uploaded script content; read first when resolving the script.
    pub script_file: Option<String>,
    /// Inline script text; fallback when the file is absent or unreadable.
    pub script_content: String,
    pub schedule_kind: ScheduleKind,
    pub schedule_value: String,
    pub status: TaskStatus,
    /// `KEY=VALUE` lines, see [`parse_environment`].
    pub environment_variables: String,
    pub timeout_seconds: u32,
    pub max_retries: u32,
    pub total_runs: u32,
    pub successful_runs: u32,
    pub failed_runs: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Script text to execute: file content, else inline text, else empty.
    ///
    /// Read errors are swallowed and fall through to the inline text.
    pub fn resolve_script_text(&self) -> String {
        if let Some(ref path) = self.script_file {
            match std::fs::read_to_string(PathBuf::from(path)) {
                Ok(content) => return content,
                Err(e) => {
                    debug!(
                        task_id = %self.id,
                        path = %path,
                        "script file unreadable, using inline text: {e}"
                    )
                }
            }
        }
        self.script_content.clone()
    }

    pub fn environment(&self) -> HashMap<String, String> {
        parse_environment(&self.environment_variables)
    }

    /// Percentage of successful runs, rounded to one decimal; 0 with no runs.
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            return 0.0;
        }
        let pct = self.successful_runs as f64 / self.total_runs as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }
}

/// Parse `KEY=VALUE` lines into a map.
///
/// Keys and values are trimmed, lines without `=` or with an empty key are
/// skipped, and a later duplicate overwrites an earlier one.
pub fn parse_environment(text: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in text.trim().lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        env.insert(key.to_string(), value.trim().to_string());
    }
    env
}

/// A persisted execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    pub trigger: Trigger,
    /// 0 for the first attempt of an occurrence, n for the n-th retry.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
    pub execution_time_seconds: Option<f64>,
    pub worker_node: String,
}

/// Input for creating a task; starts life as `Draft`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub script_file: Option<String>,
    #[serde(default)]
    pub script_content: String,
    pub schedule_kind: ScheduleKind,
    #[serde(default)]
    pub schedule_value: String,
    #[serde(default)]
    pub environment_variables: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            script_file: None,
            script_content: String::new(),
            schedule_kind: ScheduleKind::Once,
            schedule_value: String::new(),
            environment_variables: String::new(),
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
        }
    }
}

/// Partial edit of a task; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    /// `Some(None)` clears the script file.
    pub script_file: Option<Option<String>>,
    pub script_content: Option<String>,
    pub schedule_kind: Option<ScheduleKind>,
    pub schedule_value: Option<String>,
    pub environment_variables: Option<String>,
    pub timeout_seconds: Option<u32>,
    pub max_retries: Option<u32>,
}

impl TaskUpdate {
    pub fn touches_schedule(&self) -> bool {
        self.schedule_kind.is_some() || self.schedule_value.is_some()
    }

    /// Apply the edit to a copy of `task`'s definition fields.
    pub fn apply_to(&self, task: &Task) -> NewTask {
        NewTask {
            name: self.name.clone().unwrap_or_else(|| task.name.clone()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| task.description.clone()),
            script_file: self
                .script_file
                .clone()
                .unwrap_or_else(|| task.script_file.clone()),
            script_content: self
                .script_content
                .clone()
                .unwrap_or_else(|| task.script_content.clone()),
            schedule_kind: self.schedule_kind.unwrap_or(task.schedule_kind),
            schedule_value: self
                .schedule_value
                .clone()
                .unwrap_or_else(|| task.schedule_value.clone()),
            environment_variables: self
                .environment_variables
                .clone()
                .unwrap_or_else(|| task.environment_variables.clone()),
            timeout_seconds: self.timeout_seconds.unwrap_or(task.timeout_seconds),
            max_retries: self.max_retries.unwrap_or(task.max_retries),
        }
    }
}

fn default_timeout_seconds() -> u32 {
    3600
}
fn default_max_retries() -> u32 {
    3
}
