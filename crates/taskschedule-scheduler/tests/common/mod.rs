#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeZone, Utc};
use taskschedule_core::config::RunnerConfig;
use taskschedule_core::ExecutionId;
use taskschedule_runner::ScriptRunner;
use taskschedule_scheduler::cancel::CancelRegistry;
use taskschedule_scheduler::locks::TaskLocks;
use taskschedule_scheduler::policy::RetryPolicy;
use taskschedule_scheduler::worker::{WorkQueue, WorkerContext};
use taskschedule_scheduler::{
    Clock, Dispatcher, ManualClock, NewTask, ScheduleKind, SqliteStore, Task, TaskStatus,
    WorkerPool,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub clock: Arc<ManualClock>,
    pub locks: Arc<TaskLocks>,
    pub dispatcher: Dispatcher,
    pub queue: WorkQueue,
    pub ctx: WorkerContext,
}

/// In-memory store, manual clock at [`t0`], `sh` as interpreter and no
/// workers: tests pull executions off the queue themselves.
pub fn harness(queue_capacity: usize) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let locks = Arc::new(TaskLocks::new());
    let cancellations = Arc::new(CancelRegistry::new());
    let (pool, queue) = WorkerPool::channel(queue_capacity);
    let pool = Arc::new(pool);

    let dispatcher = Dispatcher::new(
        store.clone(),
        pool.clone(),
        locks.clone(),
        cancellations.clone(),
        clock.clone(),
    );
    let ctx = WorkerContext {
        store: store.clone(),
        runner: ScriptRunner::new(sh_runner_config()),
        locks: locks.clone(),
        policy: RetryPolicy::immediate(),
        cancellations,
        clock: clock.clone(),
        submitter: pool,
    };

    Harness {
        store,
        clock,
        locks,
        dispatcher,
        queue,
        ctx,
    }
}

pub fn sh_runner_config() -> RunnerConfig {
    RunnerConfig {
        interpreter: "sh".into(),
        interpreter_args: Vec::new(),
        script_suffix: ".sh".into(),
        ..RunnerConfig::default()
    }
}

pub fn new_task(kind: ScheduleKind, value: &str, script: &str) -> NewTask {
    NewTask {
        name: format!("{kind} task"),
        script_content: script.into(),
        schedule_kind: kind,
        schedule_value: value.into(),
        max_retries: 0,
        ..NewTask::default()
    }
}

impl Harness {
    /// Create and activate a task at the current clock reading.
    pub fn active_task(&self, new: NewTask) -> Task {
        let now = self.clock.now();
        let task = self.store.create_task(new, now).unwrap();
        self.store
            .set_task_status(&task.id, TaskStatus::Active, now)
            .unwrap()
    }

    /// Wait for a retry submitted from a background task.
    pub async fn next_queued(&self) -> Option<ExecutionId> {
        for _ in 0..200 {
            if let Some(id) = self.queue.try_next() {
                return Some(id);
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        None
    }
}
