//! taskschedule-runner — isolated, time-bounded script execution.
//!
//! One call to [`ScriptRunner::run`] writes a script to a private temporary
//! file, runs it under the configured interpreter in its own process group,
//! and returns the captured output. The runner never returns an error: launch
//! failures, timeouts and cancellations all come back as a [`RunOutcome`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use taskschedule_core::config::RunnerConfig;
//! use taskschedule_runner::ScriptRunner;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = ScriptRunner::new(RunnerConfig::default());
//!     let outcome = runner
//!         .run("print('hello')", &HashMap::new(), 30, &CancellationToken::new())
//!         .await;
//!     println!("{:?} {}", outcome.exit_code, outcome.stdout);
//! }
//! ```

pub mod error;
pub mod runner;
pub mod truncate;
pub mod types;

pub use error::{Result, RunnerError};
pub use runner::ScriptRunner;
pub use types::RunOutcome;
