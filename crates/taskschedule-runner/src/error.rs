//! Error types for the taskschedule-runner crate.

use thiserror::Error;

/// Failures that prevent a script from being run at all.
///
/// These never escape [`crate::runner::ScriptRunner::run`]; they are folded
/// into a failed [`crate::types::RunOutcome`] so callers always get a result.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The interpreter could not be spawned (missing binary, permission denied).
    #[error("failed to launch {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing the temporary script file or waiting on the child failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RunnerError>;
