use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CADENCE_SECS: u64 = 60;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 1_000_000; // ~1 MB of text per stream
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Top-level config (taskschedule.toml + TASKSCHEDULE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskScheduleConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// How often the due-task scan runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cadence_secs: DEFAULT_CADENCE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Number of executions that may run in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Submissions beyond this many queued executions are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Recorded on every execution as `worker_node`. Defaults to `$HOSTNAME`.
    #[serde(default = "default_node_name")]
    pub node_name: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            node_name: default_node_name(),
        }
    }
}

/// Child-process settings for the script runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Interpreter binary; the temporary script path is appended to its args.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// Suffix of the temporary script file (some interpreters care).
    #[serde(default = "default_script_suffix")]
    pub script_suffix: String,
    /// Per-stream cap on captured output; middle-omission truncation beyond it.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// RLIMIT_AS for the child, in MiB. Unix only.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    /// RLIMIT_CPU for the child, in seconds. Unix only.
    #[serde(default)]
    pub max_cpu_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            script_suffix: default_script_suffix(),
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            max_memory_mb: None,
            max_cpu_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay between automatic retries of a failed occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Terminal executions older than this many days are purged.
    #[serde(default = "default_retention_days")]
    pub days: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: DEFAULT_RETENTION_DAYS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskschedule/taskschedule.db", home)
}
fn default_cadence_secs() -> u64 {
    DEFAULT_CADENCE_SECS
}
fn default_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
fn default_interpreter() -> String {
    DEFAULT_INTERPRETER.to_string()
}
fn default_script_suffix() -> String {
    ".py".to_string()
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_backoff() -> BackoffKind {
    BackoffKind::Exponential
}
fn default_base_delay_secs() -> u64 {
    5
}
fn default_max_delay_secs() -> u64 {
    300
}
fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl TaskScheduleConfig {
    /// Load config from a TOML file with TASKSCHEDULE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TASKSCHEDULE_WORKERS__CONCURRENCY=8`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading config");

        let config: TaskScheduleConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKSCHEDULE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.dispatcher.cadence_secs == 0 {
            return Err(crate::error::CoreError::Config(
                "dispatcher.cadence_secs must be positive".to_string(),
            ));
        }
        if self.workers.concurrency == 0 || self.workers.queue_capacity == 0 {
            return Err(crate::error::CoreError::Config(
                "workers.concurrency and workers.queue_capacity must be positive".to_string(),
            ));
        }
        if self.retention.days < 0 {
            return Err(crate::error::CoreError::Config(
                "retention.days must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskschedule/taskschedule.toml", home)
}
