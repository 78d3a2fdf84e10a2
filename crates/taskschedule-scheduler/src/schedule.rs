use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::cron::CronExpr;
use crate::types::ScheduleKind;

/// Longest accepted interval: 100 years of seconds.
pub const MAX_INTERVAL_SECS: i64 = 100 * 366 * 24 * 60 * 60;

/// Compute the next UTC due time for a schedule, strictly after `now`.
///
/// Returns `None` for `Once` (it never recurs) and for values that cannot
/// be evaluated; those are rejected at validation time, so reaching the
/// warning here means the stored row was edited behind the scheduler's back.
pub fn next_run_at(kind: ScheduleKind, value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match kind {
        ScheduleKind::Once => None,

        ScheduleKind::Interval => {
            let secs = parse_interval(value)?;
            Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d))
        }

        ScheduleKind::Cron => match CronExpr::parse(value) {
            Ok(expr) => expr.next_after(now),
            Err(e) => {
                warn!(expression = %value, "invalid cron expression; next run not set: {e}");
                None
            }
        },
    }
}

/// First due time when a task is activated.
///
/// `Once` fires at the RFC 3339 instant in its value, or immediately when
/// the value is empty; recurring kinds use [`next_run_at`].
pub fn first_run_at(kind: ScheduleKind, value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match kind {
        ScheduleKind::Once => {
            let value = value.trim();
            if value.is_empty() {
                return Some(now);
            }
            DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }
        _ => next_run_at(kind, value, now),
    }
}

/// Check that `value` is meaningful for `kind`, returning a human-readable
/// reason when it is not.
pub fn validate_schedule(kind: ScheduleKind, value: &str) -> Result<(), String> {
    let value = value.trim();
    match kind {
        ScheduleKind::Once => {
            if value.is_empty() {
                return Ok(());
            }
            DateTime::parse_from_rfc3339(value)
                .map(|_| ())
                .map_err(|e| format!("'{value}' is not an RFC 3339 timestamp: {e}"))
        }
        ScheduleKind::Interval => {
            if value.is_empty() {
                return Err("interval schedules need a number of seconds".into());
            }
            let secs = parse_interval(value)
                .ok_or_else(|| format!("'{value}' is not a positive number of seconds"))?;
            if secs > MAX_INTERVAL_SECS {
                return Err(format!(
                    "interval of {secs} seconds exceeds the maximum of {MAX_INTERVAL_SECS}"
                ));
            }
            Ok(())
        }
        ScheduleKind::Cron => {
            if value.is_empty() {
                return Err("cron schedules need an expression".into());
            }
            CronExpr::parse(value).map(|_| ()).map_err(|e| e.to_string())
        }
    }
}

fn parse_interval(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
    }

    #[test]
    fn once_never_recurs() {
        assert_eq!(next_run_at(ScheduleKind::Once, "", now()), None);
        assert_eq!(
            next_run_at(ScheduleKind::Once, "2030-01-01T00:00:00Z", now()),
            None
        );
    }

    #[test]
    fn interval_advances_by_n_seconds() {
        let next = next_run_at(ScheduleKind::Interval, "60", now()).unwrap();
        assert_eq!(next - now(), Duration::seconds(60));
        assert!(next > now());
    }

    #[test]
    fn interval_rejects_non_positive() {
        assert_eq!(next_run_at(ScheduleKind::Interval, "0", now()), None);
        assert_eq!(next_run_at(ScheduleKind::Interval, "-5", now()), None);
        assert_eq!(next_run_at(ScheduleKind::Interval, "soon", now()), None);
    }

    #[test]
    fn huge_interval_is_rejected_and_never_panics() {
        let huge = "9223372036854776";
        assert!(validate_schedule(ScheduleKind::Interval, huge).is_err());
        assert_eq!(next_run_at(ScheduleKind::Interval, huge, now()), None);
        assert_eq!(
            next_run_at(ScheduleKind::Interval, &i64::MAX.to_string(), now()),
            None
        );

        let max = MAX_INTERVAL_SECS.to_string();
        assert!(validate_schedule(ScheduleKind::Interval, &max).is_ok());
        let next = next_run_at(ScheduleKind::Interval, &max, now()).unwrap();
        assert_eq!(next - now(), Duration::seconds(MAX_INTERVAL_SECS));
        let over = (MAX_INTERVAL_SECS + 1).to_string();
        assert!(validate_schedule(ScheduleKind::Interval, &over).is_err());
    }

    #[test]
    fn repeated_interval_steps_are_strictly_increasing() {
        let mut at = now();
        for n in 1..=50 {
            let next = next_run_at(ScheduleKind::Interval, "90", at).unwrap();
            assert!(next > at);
            assert_eq!(next, now() + Duration::seconds(90 * n));
            at = next;
        }
    }

    #[test]
    fn repeated_cron_steps_are_strictly_increasing() {
        let mut at = now();
        for _ in 0..20 {
            let next = next_run_at(ScheduleKind::Cron, "*/15 * * * *", at).unwrap();
            assert_eq!(next - at, Duration::minutes(15));
            at = next;
        }
    }

    #[test]
    fn bad_cron_yields_none() {
        assert_eq!(next_run_at(ScheduleKind::Cron, "nope", now()), None);
    }

    #[test]
    fn first_run_for_once() {
        assert_eq!(first_run_at(ScheduleKind::Once, "", now()), Some(now()));
        let at = first_run_at(ScheduleKind::Once, "2030-01-01T08:00:00+02:00", now()).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2030, 1, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn validation_messages() {
        assert!(validate_schedule(ScheduleKind::Interval, "30").is_ok());
        assert!(validate_schedule(ScheduleKind::Interval, "").is_err());
        assert!(validate_schedule(ScheduleKind::Cron, "0 9 * * 1-5").is_ok());
        assert!(validate_schedule(ScheduleKind::Cron, "0 9 * *").is_err());
        assert!(validate_schedule(ScheduleKind::Once, "").is_ok());
        assert!(validate_schedule(ScheduleKind::Once, "tomorrow").is_err());
    }
}
