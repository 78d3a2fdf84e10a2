//! `taskschedule` — run the scheduler and manage tasks from the command line.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use taskschedule_core::TaskScheduleConfig;
use taskschedule_scheduler::{ScheduleKind, SqliteStore, TaskStatus};
use tracing::warn;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TASKSCHEDULE_GIT_SHA"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "taskschedule", version = VERSION, about = "Scheduled script execution")]
struct Cli {
    /// Config file (default: $TASKSCHEDULE_CONFIG, then ~/.taskschedule/taskschedule.toml).
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher, workers and retention sweep until Ctrl-C.
    Serve,

    /// Manage task definitions.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Show recent executions of a task.
    Executions {
        task_id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Cancel a pending execution.
    Cancel { execution_id: String },

    /// Delete finished executions older than the retention window.
    Purge {
        /// Override `retention.days`.
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum TaskAction {
    /// Create a task (in draft unless --activate).
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Seconds for interval, cron expression for cron, RFC 3339 time for once.
        #[arg(long, default_value = "")]
        schedule: String,
        /// Inline script text.
        #[arg(long, conflicts_with = "script_file")]
        script: Option<String>,
        /// Path to a script read at execution time.
        #[arg(long)]
        script_file: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// KEY=VALUE, may be repeated.
        #[arg(long = "env")]
        env: Vec<String>,
        #[arg(long, default_value_t = 3600)]
        timeout: u32,
        #[arg(long, default_value_t = 3)]
        retries: u32,
        /// Activate immediately.
        #[arg(long)]
        activate: bool,
    },
    /// List all tasks.
    List,
    /// Show one task with its statistics.
    Show { id: String },
    /// Make a task schedulable.
    Activate { id: String },
    /// Stop dispatching a task, keeping its next due time.
    Pause { id: String },
    /// Retire a task.
    Deactivate { id: String },
    /// Delete a task and its execution history.
    Delete { id: String },
    /// Run a task once in this process and print the result.
    Run { id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Once,
    Interval,
    Cron,
}

impl From<KindArg> for ScheduleKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Once => ScheduleKind::Once,
            KindArg::Interval => ScheduleKind::Interval,
            KindArg::Cron => ScheduleKind::Cron,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskschedule=info,taskschedule_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit path > TASKSCHEDULE_CONFIG env > ~/.taskschedule/taskschedule.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("TASKSCHEDULE_CONFIG").ok());
    let config = TaskScheduleConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({e}), using defaults");
        TaskScheduleConfig::default()
    });

    let store = SqliteStore::open(&config.database.path)?;
    let out = commands::Output { json: cli.json };

    match cli.command {
        Commands::Serve => commands::serve::run(store, &config, VERSION).await?,

        Commands::Task { action } => match action {
            TaskAction::Add {
                name,
                kind,
                schedule,
                script,
                script_file,
                description,
                env,
                timeout,
                retries,
                activate,
            } => {
                let new = taskschedule_scheduler::NewTask {
                    name,
                    description,
                    script_file,
                    script_content: script.unwrap_or_default(),
                    schedule_kind: kind.into(),
                    schedule_value: schedule,
                    environment_variables: env.join("\n"),
                    timeout_seconds: timeout,
                    max_retries: retries,
                };
                commands::task::add(&store, new, activate, &out)?;
            }
            TaskAction::List => commands::task::list(&store, &out)?,
            TaskAction::Show { id } => commands::task::show(&store, &id, &out)?,
            TaskAction::Activate { id } => {
                commands::task::set_status(&store, &id, TaskStatus::Active, &out)?
            }
            TaskAction::Pause { id } => {
                commands::task::set_status(&store, &id, TaskStatus::Paused, &out)?
            }
            TaskAction::Deactivate { id } => {
                commands::task::set_status(&store, &id, TaskStatus::Inactive, &out)?
            }
            TaskAction::Delete { id } => commands::task::delete(&store, &id)?,
            TaskAction::Run { id } => commands::task::run(store, &config, &id, &out).await?,
        },

        Commands::Executions { task_id, limit } => {
            commands::execution::list(&store, &task_id, limit, &out)?
        }
        Commands::Cancel { execution_id } => commands::execution::cancel(&store, &execution_id)?,
        Commands::Purge { days } => {
            commands::execution::purge(&store, days.unwrap_or(config.retention.days))?
        }
    }

    Ok(())
}
