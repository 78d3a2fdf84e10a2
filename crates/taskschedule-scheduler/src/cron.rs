//! Five-field cron expressions: `MIN HOUR DOM MON DOW`, evaluated in UTC.
//!
//! Each field accepts `*`, `n`, `a-b`, `*/n`, `a-b/n`, `a/n` and comma lists
//! of those. Day-of-week runs 0-6 with 0 = Sunday.
//!
//! Day-of-month and day-of-week follow the classic Vixie rule: when both
//! fields are restricted (neither starts with `*`) a day matches if EITHER
//! matches; otherwise both must match.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Upper bound on the forward scan. 28 years covers every weekday/leap-day
/// combination of the Gregorian calendar outside century years.
const MAX_SCAN_DAYS: i64 = 366 * 28;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (MIN HOUR DOM MON DOW), got {0}")]
    WrongFieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("expression can never match (no valid day-of-month in the selected months)")]
    NeverMatches,
}

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 6,
};

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::WrongFieldCount(parts.len()));
        }

        let expr = Self {
            minutes: parse_field(parts[0], &MINUTE)?,
            hours: parse_field(parts[1], &HOUR)?,
            days_of_month: parse_field(parts[2], &DAY_OF_MONTH)?,
            months: parse_field(parts[3], &MONTH)?,
            days_of_week: parse_field(parts[4], &DAY_OF_WEEK)?,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        };

        if !expr.or_mode() && !expr.has_valid_month_day() {
            return Err(CronError::NeverMatches);
        }
        Ok(expr)
    }

    /// Smallest whole minute strictly after `now` that matches every field.
    ///
    /// `None` only when nothing matches within the scan horizon.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = now.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let first_day = start.date_naive();

        for offset in 0..MAX_SCAN_DAYS {
            let day = first_day + Duration::days(offset);
            if !self.day_matches(day) {
                continue;
            }
            let (from_hour, from_minute) = if offset == 0 {
                (start.hour(), start.minute())
            } else {
                (0, 0)
            };
            if let Some((h, m)) = self.first_time_from(from_hour, from_minute) {
                let naive = day.and_hms_opt(h, m, 0)?;
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
        None
    }

    /// Whether `at` (truncated to the minute) matches the expression.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.day_matches(at.date_naive())
            && bit(self.hours, at.hour())
            && bit(self.minutes, at.minute())
    }

    fn or_mode(&self) -> bool {
        self.dom_restricted && self.dow_restricted
    }

    fn day_matches(&self, day: NaiveDate) -> bool {
        if !bit(self.months, day.month()) {
            return false;
        }
        let dom = bit(self.days_of_month, day.day());
        let dow = bit(self.days_of_week, day.weekday().num_days_from_sunday());
        if self.or_mode() {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn first_time_from(&self, hour: u32, minute: u32) -> Option<(u32, u32)> {
        for h in hour..24 {
            if !bit(self.hours, h) {
                continue;
            }
            let start = if h == hour { minute } else { 0 };
            if let Some(m) = (start..60).find(|m| bit(self.minutes, *m)) {
                return Some((h, m));
            }
        }
        None
    }

    fn has_valid_month_day(&self) -> bool {
        (1..=12u32)
            .filter(|m| bit(self.months, *m))
            .any(|m| (1..=max_days_in_month(m)).any(|d| bit(self.days_of_month, d)))
    }
}

impl std::str::FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn max_days_in_month(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: spec.name,
        value: field.to_string(),
        reason,
    };

    let mut mask = 0u64;
    for item in field.split(',') {
        if item.is_empty() {
            return Err(invalid("empty list item".into()));
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{step}'")))?;
                if step == 0 {
                    return Err(invalid("step must be positive".into()));
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if base == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = base.split_once('-') {
            let lo = parse_value(a, spec).map_err(&invalid)?;
            let hi = parse_value(b, spec).map_err(&invalid)?;
            if lo > hi {
                return Err(invalid(format!("range {lo}-{hi} is reversed")));
            }
            (lo, hi)
        } else {
            let v = parse_value(base, spec).map_err(&invalid)?;
            // `a/n` means "from a to the end, every n"
            if step.is_some() {
                (v, spec.max)
            } else {
                (v, v)
            }
        };

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn parse_value(s: &str, spec: &FieldSpec) -> Result<u32, String> {
    let v: u32 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if v < spec.min || v > spec.max {
        return Err(format!("{v} is outside {}-{}", spec.min, spec.max));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(expr: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        CronExpr::parse(expr).unwrap().next_after(now).unwrap()
    }

    #[test]
    fn every_minute_is_strictly_after_now() {
        let now = at(2026, 3, 1, 10, 30, 0);
        assert_eq!(next("* * * * *", now), at(2026, 3, 1, 10, 31, 0));

        let mid_minute = at(2026, 3, 1, 10, 30, 59);
        assert_eq!(next("* * * * *", mid_minute), at(2026, 3, 1, 10, 31, 0));
    }

    #[test]
    fn weekday_morning_from_saturday_lands_on_monday() {
        // 2026-10-17 is a Saturday
        let saturday = at(2026, 10, 17, 12, 0, 0);
        assert_eq!(next("0 9 * * 1-5", saturday), at(2026, 10, 19, 9, 0, 0));
    }

    #[test]
    fn steps_and_lists() {
        let now = at(2026, 1, 1, 10, 2, 0);
        assert_eq!(next("*/15 * * * *", now), at(2026, 1, 1, 10, 15, 0));
        assert_eq!(next("5,50 * * * *", now), at(2026, 1, 1, 10, 5, 0));
        assert_eq!(next("10-40/10 * * * *", now), at(2026, 1, 1, 10, 10, 0));
        assert_eq!(
            next("45/5 * * * *", at(2026, 1, 1, 10, 56, 0)),
            at(2026, 1, 1, 11, 45, 0)
        );
    }

    #[test]
    fn rolls_over_hour_day_and_year() {
        assert_eq!(
            next("0 0 * * *", at(2026, 12, 31, 23, 59, 0)),
            at(2027, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            next("0 0 1 1 *", at(2026, 6, 1, 0, 0, 0)),
            at(2027, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn dom_and_dow_are_ored_when_both_restricted() {
        // 13th of the month OR any Friday. 2026-02-06 is a Friday.
        let now = at(2026, 2, 1, 0, 0, 0);
        assert_eq!(next("0 0 13 * 5", now), at(2026, 2, 6, 0, 0, 0));
    }

    #[test]
    fn starred_dow_does_not_widen_dom() {
        // Only the 13th, even though `*/1` matches every weekday.
        let now = at(2026, 2, 1, 0, 0, 0);
        assert_eq!(next("0 0 13 * */1", now), at(2026, 2, 13, 0, 0, 0));
    }

    #[test]
    fn leap_day_is_found() {
        assert_eq!(
            next("0 12 29 2 *", at(2026, 3, 1, 0, 0, 0)),
            at(2028, 2, 29, 12, 0, 0)
        );
    }

    #[test]
    fn result_always_matches() {
        let exprs = ["*/7 3-5 * * *", "30 23 * 1 0", "0 0 1,15 * 1"];
        let now = at(2026, 5, 5, 5, 5, 5);
        for e in exprs {
            let expr = CronExpr::parse(e).unwrap();
            let n = expr.next_after(now).unwrap();
            assert!(n > now);
            assert!(expr.matches(n), "{e} -> {n}");
        }
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(
            CronExpr::parse("* * * *"),
            Err(CronError::WrongFieldCount(4))
        );
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * 0 *").is_err());
        assert!(CronExpr::parse("* * * * 7").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("1,,2 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn impossible_date_is_rejected() {
        assert_eq!(CronExpr::parse("0 0 30 2 *"), Err(CronError::NeverMatches));
        // with a restricted weekday the Friday branch still fires
        assert!(CronExpr::parse("0 0 30 2 5").is_ok());
    }
}
