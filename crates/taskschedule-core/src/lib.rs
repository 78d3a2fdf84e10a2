//! `taskschedule-core` — configuration, errors and identifier types shared by
//! the runner, the scheduler and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::TaskScheduleConfig;
pub use error::{CoreError, Result};
pub use types::{ExecutionId, TaskId};
