//! Shared data types for taskschedule-runner.

use serde::{Deserialize, Serialize};

/// Result of running one script.
///
/// `exit_code` is `None` whenever the child did not exit on its own: it timed
/// out, was cancelled, was killed by a signal, or never started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,

    /// Captured standard output (ANSI escapes stripped, capped).
    pub stdout: String,

    /// Captured standard error, plus the runner's own diagnostics.
    pub stderr: String,

    /// The wall-clock limit expired and the process group was killed.
    pub timed_out: bool,

    /// A cancellation request arrived and the process group was killed.
    pub cancelled: bool,

    /// Wall-clock time from spawn to exit or kill, in milliseconds.
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Outcome for a script that could not be launched.
    pub fn launch_failed(message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            ..Self::default()
        }
    }

    /// Exited on its own with status 0.
    pub fn is_success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}
