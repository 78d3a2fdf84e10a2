use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskschedule_core::ExecutionId;
use taskschedule_runner::{RunOutcome, ScriptRunner};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelRegistry;
use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::locks::TaskLocks;
use crate::policy::{RetryDecision, RetryPolicy};
use crate::store::{Completion, SchedulerStore};
use crate::types::{ExecutionStatus, TaskStatus};

/// Receipt for an execution accepted by a [`Submitter`].
#[derive(Debug, Clone)]
pub struct SubmitHandle {
    pub execution_id: ExecutionId,
    pub queued_at: DateTime<Utc>,
}

/// Hands executions to whatever runs them. Must not block.
pub trait Submitter: Send + Sync {
    fn submit(&self, execution_id: &ExecutionId) -> Result<SubmitHandle>;
}

/// Sending half of the bounded worker queue.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<ExecutionId>,
}

/// Receiving half, shared by every worker task.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    rx: Arc<Mutex<mpsc::Receiver<ExecutionId>>>,
}

impl WorkerPool {
    /// Create a queue holding at most `capacity` waiting executions.
    pub fn channel(capacity: usize) -> (WorkerPool, WorkQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            WorkerPool { tx },
            WorkQueue {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

impl Submitter for WorkerPool {
    fn submit(&self, execution_id: &ExecutionId) -> Result<SubmitHandle> {
        self.tx
            .try_send(execution_id.clone())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SchedulerError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SchedulerError::QueueClosed,
            })?;
        Ok(SubmitHandle {
            execution_id: execution_id.clone(),
            queued_at: Utc::now(),
        })
    }
}

impl WorkQueue {
    pub async fn next(&self) -> Option<ExecutionId> {
        self.rx.lock().await.recv().await
    }

    /// Take a waiting execution without blocking.
    pub fn try_next(&self) -> Option<ExecutionId> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// Shared services every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn SchedulerStore>,
    pub runner: ScriptRunner,
    pub locks: Arc<TaskLocks>,
    pub policy: RetryPolicy,
    pub cancellations: Arc<CancelRegistry>,
    pub clock: Arc<dyn Clock>,
    pub submitter: Arc<dyn Submitter>,
}

/// What a worker did with one execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    /// Terminal status written by this worker; `None` when it was skipped.
    pub status: Option<ExecutionStatus>,
    pub retry: Option<ExecutionId>,
}

impl ExecutionReport {
    fn skipped(id: &ExecutionId) -> Self {
        Self {
            execution_id: id.clone(),
            status: None,
            retry: None,
        }
    }

    fn failed(id: &ExecutionId) -> Self {
        Self {
            execution_id: id.clone(),
            status: Some(ExecutionStatus::Failure),
            retry: None,
        }
    }
}

/// Spawn `concurrency` workers pulling from `queue` until `shutdown` fires
/// or every [`WorkerPool`] handle is dropped.
pub fn spawn_workers(
    queue: WorkQueue,
    ctx: WorkerContext,
    concurrency: usize,
    node_name: &str,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|i| {
            let queue = queue.clone();
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            let node = format!("{node_name}#{i}");
            tokio::spawn(async move {
                debug!(worker = %node, "worker started");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        next = queue.next() => next,
                    };
                    let Some(id) = next else { break };
                    execute(&ctx, &id, &node).await;
                }
                debug!(worker = %node, "worker stopped");
            })
        })
        .collect()
}

/// Run one execution to its terminal state.
pub async fn execute(ctx: &WorkerContext, id: &ExecutionId, node: &str) -> ExecutionReport {
    let execution = match ctx.store.get_execution(id) {
        Ok(e) => e,
        Err(e) => {
            warn!(execution_id = %id, error = %e, "execution vanished before pickup");
            ctx.locks.release_execution(id);
            return ExecutionReport::failed(id);
        }
    };
    let task = match ctx.store.get_task(&execution.task_id) {
        Ok(t) => t,
        Err(e) => {
            warn!(
                execution_id = %id,
                task_id = %execution.task_id,
                error = %e,
                "task vanished before pickup"
            );
            ctx.locks.release_execution(id);
            return ExecutionReport::failed(id);
        }
    };

    // registered before the status flips so a cancel never sees a running
    // execution without a token
    let token = ctx.cancellations.token(id);
    match ctx.store.mark_started(id, node, ctx.clock.now()) {
        Ok(true) => {}
        Ok(false) => {
            ctx.cancellations.remove(id);
            debug!(execution_id = %id, "execution no longer pending, skipping");
            // already terminal, e.g. cancelled by another process
            ctx.locks.release_execution(id);
            return ExecutionReport::skipped(id);
        }
        Err(e) => {
            ctx.cancellations.remove(id);
            error!(execution_id = %id, error = %e, "could not mark execution running");
            ctx.locks.release_execution(id);
            return ExecutionReport::failed(id);
        }
    }
    info!(
        execution_id = %id,
        task_id = %task.id,
        attempt = execution.attempt,
        worker = %node,
        "execution started"
    );

    let script = task.resolve_script_text();
    let outcome = if script.trim().is_empty() {
        RunOutcome::launch_failed("Execution error: No script content found")
    } else {
        ctx.runner
            .run(&script, &task.environment(), u64::from(task.timeout_seconds), &token)
            .await
    };
    ctx.cancellations.remove(id);

    let status = classify(&outcome);

    // a task paused or retired mid-run gets no further attempts
    let still_runnable = ctx
        .store
        .get_task(&task.id)
        .map(|t| t.status)
        .unwrap_or(task.status);
    let decision = match still_runnable {
        TaskStatus::Paused | TaskStatus::Inactive => RetryDecision::GiveUp,
        _ => ctx.policy.decide(status, execution.attempt, task.max_retries),
    };

    let completion = Completion {
        status,
        output: outcome.stdout,
        error_output: outcome.stderr,
        exit_code: outcome.exit_code,
        completed_at: ctx.clock.now(),
        final_outcome: decision == RetryDecision::GiveUp,
        retry_attempt: match decision {
            RetryDecision::Retry { attempt, .. } => Some(attempt),
            RetryDecision::GiveUp => None,
        },
    };

    let record = match ctx.store.mark_completed(id, &completion) {
        Ok(r) => r,
        Err(e) => {
            error!(execution_id = %id, error = %e, "could not record execution outcome");
            ctx.locks.release_execution(id);
            return ExecutionReport {
                execution_id: id.clone(),
                status: Some(status),
                retry: None,
            };
        }
    };
    info!(
        execution_id = %id,
        task_id = %task.id,
        status = %status,
        exit_code = ?completion.exit_code,
        duration_ms = outcome.duration_ms,
        "execution finished"
    );

    let retry_id = match (record.retry, decision) {
        (Some(retry), RetryDecision::Retry { delay, .. }) => {
            ctx.locks.bind(&task.id, &retry.id);
            info!(
                task_id = %task.id,
                execution_id = %retry.id,
                attempt = retry.attempt,
                delay_secs = delay.as_secs_f64(),
                "retry scheduled"
            );
            let retry_id = retry.id.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                submit_retry(&ctx, &retry.id);
            });
            Some(retry_id)
        }
        _ => {
            ctx.locks.release_execution(id);
            None
        }
    };

    ExecutionReport {
        execution_id: id.clone(),
        status: Some(status),
        retry: retry_id,
    }
}

fn submit_retry(ctx: &WorkerContext, retry_id: &ExecutionId) {
    let Err(e) = ctx.submitter.submit(retry_id) else {
        return;
    };
    warn!(execution_id = %retry_id, error = %e, "retry could not be submitted");
    let completion = Completion::new(ExecutionStatus::Failure, ctx.clock.now())
        .with_error(format!("Execution error: retry submission failed: {e}"));
    if let Err(e) = ctx.store.mark_completed(retry_id, &completion) {
        // already cancelled while waiting for its delay
        debug!(execution_id = %retry_id, error = %e, "retry not closed");
    }
    ctx.locks.release_execution(retry_id);
}

/// Map a runner outcome onto an execution status.
pub fn classify(outcome: &RunOutcome) -> ExecutionStatus {
    if outcome.cancelled {
        ExecutionStatus::Cancelled
    } else if outcome.timed_out {
        ExecutionStatus::Timeout
    } else if outcome.exit_code == Some(0) {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Failure
    }
}
