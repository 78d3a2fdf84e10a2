//! `taskschedule-scheduler` — due-task dispatch, execution bookkeeping and
//! retries on top of SQLite.
//!
//! # Overview
//!
//! Tasks and their executions live in two SQLite tables behind
//! [`store::SqliteStore`]. The [`engine::SchedulerEngine`] runs a
//! [`dispatcher::Dispatcher`] on a fixed cadence: each cycle finds active
//! tasks whose `next_run_at` has arrived, creates a pending execution, hands
//! it to the bounded worker queue and moves `next_run_at` forward. Workers
//! run the script through [`taskschedule_runner::ScriptRunner`], record the
//! outcome, and schedule a retry when the [`policy::RetryPolicy`] allows.
//!
//! # Schedule kinds
//!
//! | Kind       | `schedule_value`                         |
//! |------------|------------------------------------------|
//! | `once`     | empty (now) or an RFC 3339 instant       |
//! | `interval` | positive number of seconds               |
//! | `cron`     | five-field cron expression, UTC          |

pub mod cancel;
pub mod clock;
pub mod cron;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod locks;
pub mod policy;
pub mod schedule;
pub mod store;
pub mod types;
pub mod validate;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{CancelOutcome, DispatchSummary, Dispatcher};
pub use engine::SchedulerEngine;
pub use error::{FieldError, Result, SchedulerError, ValidationErrors};
pub use store::{ExecutionStore, SchedulerStore, SqliteStore, TaskStore};
pub use types::{
    Execution, ExecutionStatus, NewTask, ScheduleKind, Task, TaskStatus, TaskUpdate, Trigger,
};
pub use worker::{Submitter, SubmitHandle, WorkerPool};
