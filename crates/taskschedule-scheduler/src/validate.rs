use crate::error::{Result, SchedulerError, ValidationErrors};
use crate::schedule::validate_schedule;
use crate::types::NewTask;

pub const MAX_NAME_CHARS: usize = 200;

/// Check a task definition before it is stored.
///
/// Every problem is collected so callers can report all fields at once.
pub fn validate_new_task(task: &NewTask) -> Result<()> {
    let mut errors = ValidationErrors::default();

    let name = task.name.trim();
    if name.is_empty() {
        errors.push("name", "must not be empty");
    } else if name.chars().count() > MAX_NAME_CHARS {
        errors.push("name", format!("must be at most {MAX_NAME_CHARS} characters"));
    }

    let has_file = task
        .script_file
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    if !has_file && task.script_content.trim().is_empty() {
        errors.push("script", "provide a script file or inline script content");
    }

    if let Err(reason) = validate_schedule(task.schedule_kind, &task.schedule_value) {
        errors.push("schedule_value", reason);
    }

    if task.timeout_seconds == 0 {
        errors.push("timeout_seconds", "must be positive");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SchedulerError::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScheduleKind;

    fn valid() -> NewTask {
        NewTask {
            name: "nightly report".into(),
            script_content: "print('hi')".into(),
            schedule_kind: ScheduleKind::Interval,
            schedule_value: "300".into(),
            ..NewTask::default()
        }
    }

    fn field_errors(task: &NewTask) -> ValidationErrors {
        match validate_new_task(task) {
            Err(SchedulerError::Validation(errs)) => errs,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_valid_task() {
        assert!(validate_new_task(&valid()).is_ok());
    }

    #[test]
    fn script_file_alone_is_enough() {
        let task = NewTask {
            script_content: String::new(),
            script_file: Some("/srv/scripts/job.py".into()),
            ..valid()
        };
        assert!(validate_new_task(&task).is_ok());
    }

    #[test]
    fn reports_every_bad_field() {
        let task = NewTask {
            name: "   ".into(),
            script_content: String::new(),
            schedule_kind: ScheduleKind::Cron,
            schedule_value: "99 * * * *".into(),
            timeout_seconds: 0,
            ..NewTask::default()
        };
        let errs = field_errors(&task);
        assert_eq!(errs.0.len(), 4);
        assert!(errs.get("name").is_some());
        assert!(errs.get("script").is_some());
        assert!(errs.get("schedule_value").unwrap().contains("minute"));
        assert!(errs.get("timeout_seconds").is_some());
    }

    #[test]
    fn long_name_rejected() {
        let task = NewTask {
            name: "x".repeat(MAX_NAME_CHARS + 1),
            ..valid()
        };
        assert!(field_errors(&task).get("name").unwrap().contains("200"));
    }

    #[test]
    fn interval_needs_value() {
        let task = NewTask {
            schedule_value: String::new(),
            ..valid()
        };
        assert!(field_errors(&task).get("schedule_value").is_some());
    }

    #[test]
    fn oversized_interval_is_a_field_error() {
        let task = NewTask {
            schedule_value: "9223372036854776".into(),
            ..valid()
        };
        let errs = field_errors(&task);
        assert!(errs.get("schedule_value").unwrap().contains("maximum"));
    }
}
