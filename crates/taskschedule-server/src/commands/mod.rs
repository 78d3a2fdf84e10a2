//! Subcommand implementations.

pub mod execution;
pub mod serve;
pub mod task;

use chrono::{DateTime, Utc};

/// Output settings shared by every command.
pub struct Output {
    pub json: bool,
}

impl Output {
    /// Print `value` as pretty JSON. Returns `false` when tables were asked for.
    pub fn print_json<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<bool> {
        if !self.json {
            return Ok(false);
        }
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(true)
    }
}

pub(crate) fn fmt_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
