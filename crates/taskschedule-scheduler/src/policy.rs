use std::time::Duration;

use taskschedule_core::config::{BackoffKind, RetryConfig};

use crate::types::ExecutionStatus;

/// What to do after an attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run attempt number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// This attempt is the final outcome of its occurrence.
    GiveUp,
}

/// Bounded retry with fixed or exponential backoff.
///
/// Only `failure` and `timeout` are retried; success and cancellation are
/// always final. Retries never move a task's `next_run_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            backoff: config.backoff,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// Retry immediately; handy for tests and one-shot tools.
    pub fn immediate() -> Self {
        Self {
            backoff: BackoffKind::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn decide(&self, status: ExecutionStatus, attempt: u32, max_retries: u32) -> RetryDecision {
        let retryable = matches!(status, ExecutionStatus::Failure | ExecutionStatus::Timeout);
        if !retryable || attempt >= max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            attempt: attempt + 1,
            delay: self.delay_for(attempt),
        }
    }

    /// Delay before the retry that follows `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn fixed_is_constant() {
        let policy = RetryPolicy {
            backoff: BackoffKind::Fixed,
            base_delay: Duration::from_secs(7),
            max_delay: Duration::from_secs(300),
        };
        assert_eq!(policy.delay_for(0), policy.delay_for(5));
    }

    #[test]
    fn only_failures_and_timeouts_retry() {
        let policy = RetryPolicy::immediate();
        assert!(matches!(
            policy.decide(ExecutionStatus::Failure, 0, 3),
            RetryDecision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            policy.decide(ExecutionStatus::Timeout, 2, 3),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert_eq!(
            policy.decide(ExecutionStatus::Failure, 3, 3),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(ExecutionStatus::Success, 0, 3),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(ExecutionStatus::Cancelled, 0, 3),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(ExecutionStatus::Failure, 0, 0),
            RetryDecision::GiveUp
        );
    }
}
