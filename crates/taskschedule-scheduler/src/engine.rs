use std::sync::Arc;
use std::time::Duration;

use taskschedule_core::TaskScheduleConfig;
use taskschedule_runner::ScriptRunner;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cancel::CancelRegistry;
use crate::clock::{Clock, SystemClock};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::locks::TaskLocks;
use crate::policy::RetryPolicy;
use crate::store::SchedulerStore;
use crate::worker::{spawn_workers, WorkQueue, WorkerContext, WorkerPool};

/// How long running scripts get to finish after shutdown is requested.
/// Anything still running is killed and reconciled on the next start.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Ties the dispatcher loop, the worker pool and the retention sweep together.
pub struct SchedulerEngine {
    store: Arc<dyn SchedulerStore>,
    dispatcher: Arc<Dispatcher>,
    queue: WorkQueue,
    ctx: WorkerContext,
    cadence: Duration,
    concurrency: usize,
    node_name: String,
    /// `None` when `retention.days` is too large to represent; the sweep is off.
    retention: Option<chrono::Duration>,
    sweep_interval: Duration,
}

impl SchedulerEngine {
    pub fn new(store: Arc<dyn SchedulerStore>, config: &TaskScheduleConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SchedulerStore>,
        config: &TaskScheduleConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (pool, queue) = WorkerPool::channel(config.workers.queue_capacity);
        let pool = Arc::new(pool);
        let locks = Arc::new(TaskLocks::new());
        let cancellations = Arc::new(CancelRegistry::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            pool.clone(),
            Arc::clone(&locks),
            Arc::clone(&cancellations),
            Arc::clone(&clock),
        ));
        let retention = chrono::Duration::try_days(config.retention.days);
        if retention.is_none() {
            warn!(days = config.retention.days, "retention window out of range, sweep disabled");
        }
        let ctx = WorkerContext {
            store: Arc::clone(&store),
            runner: ScriptRunner::new(config.runner.clone()),
            locks,
            policy: RetryPolicy::from_config(&config.retry),
            cancellations,
            clock,
            submitter: pool,
        };

        Self {
            store,
            dispatcher,
            queue,
            ctx,
            cadence: Duration::from_secs(config.dispatcher.cadence_secs),
            concurrency: config.workers.concurrency,
            node_name: config.workers.node_name.clone(),
            retention,
            sweep_interval: Duration::from_secs(config.retention.sweep_interval_secs.max(1)),
        }
    }

    /// Handle for manual triggers and cancellation while the engine runs.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Executions orphaned by a previous process are closed first, then the
    /// workers start and the dispatch and retention timers begin ticking
    /// (both fire once immediately).
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let now = self.ctx.clock.now();
        let reconciled = self.store.reconcile_interrupted(now)?;
        if reconciled > 0 {
            warn!(count = reconciled, "reconciled interrupted executions");
        }

        let workers = spawn_workers(
            self.queue.clone(),
            self.ctx.clone(),
            self.concurrency,
            &self.node_name,
            shutdown.clone(),
        );
        info!(
            workers = self.concurrency,
            cadence_secs = self.cadence.as_secs(),
            node = %self.node_name,
            "scheduler engine started"
        );

        let mut dispatch_tick = tokio::time::interval(self.cadence);
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval(self.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = dispatch_tick.tick() => {
                    let now = self.ctx.clock.now();
                    if let Err(e) = self.dispatcher.run_dispatch_cycle(now) {
                        error!(error = %e, "dispatch cycle failed");
                    }
                }
                _ = sweep_tick.tick(), if self.retention.is_some() => {
                    if let Some(age) = self.retention {
                        let now = self.ctx.clock.now();
                        if let Err(e) = self.store.purge_executions_older_than(age, now) {
                            error!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
        }

        info!("scheduler engine stopping");
        for handle in workers {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("worker still busy after shutdown grace, aborting");
                abort.abort();
            }
        }
        info!("scheduler engine stopped");
        Ok(())
    }
}
