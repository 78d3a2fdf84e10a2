use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use taskschedule_core::{ExecutionId, TaskId};

/// Who currently owns a task's lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHolder {
    /// Execution the lock is bound to; `None` between acquire and bind.
    pub execution: Option<ExecutionId>,
    pub acquired_at: DateTime<Utc>,
}

/// In-process advisory locks: at most one in-flight occurrence per task.
///
/// Taken at dispatch or manual trigger, handed to a retry when one is
/// scheduled, released on the terminal transition.
#[derive(Debug, Default)]
pub struct TaskLocks {
    held: DashMap<TaskId, LockHolder>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `task`, or return the current holder.
    pub fn try_acquire(&self, task: &TaskId, now: DateTime<Utc>) -> Result<(), LockHolder> {
        match self.held.entry(task.clone()) {
            Entry::Occupied(e) => Err(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(LockHolder {
                    execution: None,
                    acquired_at: now,
                });
                Ok(())
            }
        }
    }

    /// Record which execution now owns the lock.
    pub fn bind(&self, task: &TaskId, execution: &ExecutionId) {
        if let Some(mut holder) = self.held.get_mut(task) {
            holder.execution = Some(execution.clone());
        }
    }

    pub fn release(&self, task: &TaskId) {
        self.held.remove(task);
    }

    /// Release whichever lock is bound to `execution`, if any.
    pub fn release_execution(&self, execution: &ExecutionId) {
        self.held
            .retain(|_, holder| holder.execution.as_ref() != Some(execution));
    }

    pub fn holder(&self, task: &TaskId) -> Option<LockHolder> {
        self.held.get(task).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
