use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskschedule_core::{ExecutionId, TaskId};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelRegistry;
use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::locks::TaskLocks;
use crate::schedule::next_run_at;
use crate::store::{Completion, SchedulerStore};
use crate::types::{Execution, ExecutionStatus, Task, Trigger};
use crate::worker::Submitter;

/// Extra time past a task's timeout before a held lock is reported as stale.
const STALE_LOCK_GRACE_SECS: i64 = 60;

/// Counts from one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Tasks found due.
    pub due: usize,
    /// Executions created and accepted by the worker pool.
    pub dispatched: usize,
    /// Tasks skipped because a previous occurrence is still in flight.
    pub skipped: usize,
    /// Tasks left due because the store or the pool refused them.
    pub failed: usize,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A pending execution was closed immediately.
    Cancelled,
    /// A running execution was told to stop; it ends `cancelled` once its
    /// process group is gone.
    Signalled,
}

/// Turns due tasks into queued executions.
pub struct Dispatcher {
    store: Arc<dyn SchedulerStore>,
    submitter: Arc<dyn Submitter>,
    locks: Arc<TaskLocks>,
    cancellations: Arc<CancelRegistry>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        submitter: Arc<dyn Submitter>,
        locks: Arc<TaskLocks>,
        cancellations: Arc<CancelRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            submitter,
            locks,
            cancellations,
            clock,
        }
    }

    /// Dispatch every active task due at `now`.
    ///
    /// Each task is handled on its own: a failure for one is logged and
    /// counted, and the rest of the batch still runs. Only a failed due scan
    /// fails the whole cycle.
    pub fn run_dispatch_cycle(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let due = self.store.get_due_active_tasks(now)?;
        let mut summary = DispatchSummary {
            due: due.len(),
            ..DispatchSummary::default()
        };

        for task in &due {
            match self.dispatch_task(task, now) {
                Ok(true) => summary.dispatched += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        task_id = %task.id,
                        error = %e,
                        "task not dispatched, will retry next cycle"
                    );
                }
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                dispatched = summary.dispatched,
                skipped = summary.skipped,
                failed = summary.failed,
                "dispatch cycle finished"
            );
        } else {
            debug!("dispatch cycle: nothing due");
        }
        Ok(summary)
    }

    /// `Ok(false)` means skipped on lock contention.
    fn dispatch_task(&self, task: &Task, now: DateTime<Utc>) -> Result<bool> {
        if let Err(holder) = self.locks.try_acquire(&task.id, now) {
            let held_for = now - holder.acquired_at;
            let stale_after =
                Duration::seconds(i64::from(task.timeout_seconds) + STALE_LOCK_GRACE_SECS);
            let execution = holder
                .execution
                .as_ref()
                .map(ExecutionId::to_string)
                .unwrap_or_default();
            if held_for > stale_after {
                warn!(
                    task_id = %task.id,
                    execution_id = %execution,
                    held_secs = held_for.num_seconds(),
                    "stale task lock: previous execution exceeded its timeout, skipping"
                );
            } else {
                warn!(
                    task_id = %task.id,
                    execution_id = %execution,
                    "previous execution still in flight, skipping"
                );
            }
            return Ok(false);
        }

        let execution = match self.store.create_execution(&task.id, Trigger::Schedule, 0, now) {
            Ok(e) => e,
            Err(e) => {
                self.locks.release(&task.id);
                return Err(e);
            }
        };
        self.locks.bind(&task.id, &execution.id);

        if let Err(e) = self.submitter.submit(&execution.id) {
            let completion = Completion {
                final_outcome: false,
                ..Completion::new(ExecutionStatus::Cancelled, self.clock.now())
                    .with_error(format!("Execution error: submission failed: {e}"))
            };
            if let Err(close_err) = self.store.mark_completed(&execution.id, &completion) {
                error!(
                    execution_id = %execution.id,
                    error = %close_err,
                    "could not close unsubmitted execution"
                );
            }
            self.locks.release(&task.id);
            return Err(e);
        }

        // re-read the clock: submission may have taken a while
        let next = next_run_at(task.schedule_kind, &task.schedule_value, self.clock.now());
        if let Err(e) = self.store.update_next_run_at(&task.id, next) {
            error!(task_id = %task.id, error = %e, "execution queued but next run not saved");
        }
        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            next_run_at = ?next,
            "task dispatched"
        );
        Ok(true)
    }

    /// Run a task now, whatever its status or due time.
    ///
    /// If the pool refuses the execution it is closed as a counted failure
    /// and the submission error is returned.
    pub fn trigger_now(&self, task_id: &TaskId) -> Result<Execution> {
        let task = self.store.get_task(task_id)?;
        let now = self.clock.now();
        if let Err(holder) = self.locks.try_acquire(&task.id, now) {
            return Err(SchedulerError::TaskBusy {
                id: task.id.to_string(),
                execution: holder
                    .execution
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".into()),
            });
        }

        let execution = match self.store.create_execution(&task.id, Trigger::Manual, 0, now) {
            Ok(e) => e,
            Err(e) => {
                self.locks.release(&task.id);
                return Err(e);
            }
        };
        self.locks.bind(&task.id, &execution.id);

        if let Err(e) = self.submitter.submit(&execution.id) {
            let completion = Completion::new(ExecutionStatus::Failure, self.clock.now())
                .with_error(format!("Execution error: {e}"));
            if let Err(close_err) = self.store.mark_completed(&execution.id, &completion) {
                error!(
                    execution_id = %execution.id,
                    error = %close_err,
                    "could not close unsubmitted execution"
                );
            }
            self.locks.release(&task.id);
            return Err(e);
        }

        info!(task_id = %task.id, execution_id = %execution.id, "manual run queued");
        Ok(execution)
    }

    /// Cancel a pending or running execution.
    pub fn cancel(&self, id: &ExecutionId) -> Result<CancelOutcome> {
        let execution = self.store.get_execution(id)?;

        if execution.status == ExecutionStatus::Pending
            && self.store.cancel_pending(id, self.clock.now())?
        {
            self.locks.release_execution(id);
            info!(execution_id = %id, "pending execution cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        // running, or it started between the read and the conditional update
        if self.cancellations.cancel(id) {
            info!(execution_id = %id, "cancellation signalled to running execution");
            return Ok(CancelOutcome::Signalled);
        }

        let current = self.store.get_execution(id)?;
        Err(SchedulerError::InvalidTransition {
            id: id.to_string(),
            from: current.status.to_string(),
            to: ExecutionStatus::Cancelled.to_string(),
        })
    }
}
