mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::Duration;
use common::{harness, new_task, sh_runner_config};
use taskschedule_core::{ExecutionId, TaskScheduleConfig};
use taskschedule_scheduler::worker::execute;
use taskschedule_scheduler::{
    CancelOutcome, Clock, ExecutionStatus, ExecutionStore, NewTask, ScheduleKind,
    SchedulerEngine, SqliteStore, SystemClock, TaskStatus, TaskStore, Trigger,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sleeping_script_times_out() {
    let h = harness(8);
    let task = h.active_task(NewTask {
        timeout_seconds: 1,
        ..new_task(ScheduleKind::Interval, "60", "sleep 5")
    });
    let exec = h.dispatcher.trigger_now(&task.id).unwrap();
    let id = h.queue.try_next().unwrap();

    let started = Instant::now();
    let report = execute(&h.ctx, &id, "w").await;
    assert!(started.elapsed() < StdDuration::from_secs(4));
    assert_eq!(report.status, Some(ExecutionStatus::Timeout));

    let exec = h.store.get_execution(&exec.id).unwrap();
    assert_eq!(exec.status, ExecutionStatus::Timeout);
    assert_eq!(exec.exit_code, None);
    assert!(exec.error_output.contains("timed out after 1 seconds"));
    assert!(exec.completed_at.is_some());

    let task = h.store.get_task(&task.id).unwrap();
    assert_eq!((task.total_runs, task.failed_runs), (1, 1));
}

#[tokio::test]
async fn failures_retry_until_exhausted_and_count_once() {
    let h = harness(8);
    let task = h.active_task(NewTask {
        max_retries: 2,
        ..new_task(ScheduleKind::Interval, "60", "echo boom >&2; exit 3")
    });
    h.clock.advance(Duration::seconds(60));
    h.dispatcher.run_dispatch_cycle(h.clock.now()).unwrap();
    let next_run = h.store.get_task(&task.id).unwrap().next_run_at;

    let first = h.queue.try_next().unwrap();
    let report = execute(&h.ctx, &first, "w").await;
    assert_eq!(report.status, Some(ExecutionStatus::Failure));
    let second = report.retry.expect("first retry scheduled");
    assert_eq!(h.next_queued().await, Some(second.clone()));

    // the lock follows the retry
    let holder = h.locks.holder(&task.id).unwrap();
    assert_eq!(holder.execution, Some(second.clone()));

    let report = execute(&h.ctx, &second, "w").await;
    let third = report.retry.expect("second retry scheduled");
    assert_eq!(h.next_queued().await, Some(third.clone()));

    let report = execute(&h.ctx, &third, "w").await;
    assert_eq!(report.status, Some(ExecutionStatus::Failure));
    assert!(report.retry.is_none());
    assert!(h.locks.is_empty());

    let mut executions = h.store.list_executions_for_task(&task.id, None).unwrap();
    executions.sort_by_key(|e| e.attempt);
    let attempts: Vec<_> = executions.iter().map(|e| (e.attempt, e.trigger)).collect();
    assert_eq!(
        attempts,
        vec![(0, Trigger::Schedule), (1, Trigger::Retry), (2, Trigger::Retry)]
    );
    for e in &executions {
        assert_eq!(e.exit_code, Some(3));
        assert!(e.error_output.contains("boom"));
    }

    let task = h.store.get_task(&task.id).unwrap();
    assert_eq!(
        (task.total_runs, task.successful_runs, task.failed_runs),
        (1, 0, 1)
    );
    // retries leave the schedule alone
    assert_eq!(task.next_run_at, next_run);
}

#[tokio::test]
async fn paused_task_gets_no_retry() {
    let h = harness(8);
    let task = h.active_task(NewTask {
        max_retries: 3,
        ..new_task(ScheduleKind::Interval, "60", "exit 1")
    });
    h.dispatcher.trigger_now(&task.id).unwrap();
    h.store
        .set_task_status(&task.id, TaskStatus::Paused, h.clock.now())
        .unwrap();

    let id = h.queue.try_next().unwrap();
    let report = execute(&h.ctx, &id, "w").await;
    assert!(report.retry.is_none());
    assert_eq!(h.store.get_task(&task.id).unwrap().failed_runs, 1);
}

#[tokio::test]
async fn running_execution_can_be_cancelled() {
    let h = harness(8);
    let task = h.active_task(new_task(ScheduleKind::Interval, "60", "sleep 30"));
    h.dispatcher.trigger_now(&task.id).unwrap();
    let id = h.queue.try_next().unwrap();

    let ctx = h.ctx.clone();
    let run_id = id.clone();
    let worker = tokio::spawn(async move { execute(&ctx, &run_id, "w").await });

    let mut outcome = None;
    for _ in 0..200 {
        if h.store.get_execution(&id).unwrap().status == ExecutionStatus::Running {
            outcome = Some(h.dispatcher.cancel(&id).unwrap());
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(outcome, Some(CancelOutcome::Signalled));

    let report = tokio::time::timeout(StdDuration::from_secs(5), worker)
        .await
        .expect("worker stops promptly")
        .unwrap();
    assert_eq!(report.status, Some(ExecutionStatus::Cancelled));
    assert!(report.retry.is_none());

    let exec = h.store.get_execution(&id).unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.exit_code, None);
    let task = h.store.get_task(&task.id).unwrap();
    assert_eq!((task.total_runs, task.failed_runs), (1, 1));
    assert!(h.locks.is_empty());
}

#[tokio::test]
async fn vanished_execution_is_reported_as_failure() {
    let h = harness(8);
    let report = execute(&h.ctx, &ExecutionId::new(), "w").await;
    assert_eq!(report.status, Some(ExecutionStatus::Failure));
}

#[tokio::test]
async fn missing_script_is_a_failure() {
    let h = harness(8);
    let task = h.active_task(NewTask {
        script_file: Some("/nonexistent/taskschedule/script.sh".into()),
        script_content: String::new(),
        ..new_task(ScheduleKind::Interval, "60", "")
    });
    h.dispatcher.trigger_now(&task.id).unwrap();
    let id = h.queue.try_next().unwrap();
    execute(&h.ctx, &id, "w").await;

    let exec = h.store.get_execution(&id).unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failure);
    assert_eq!(
        exec.error_output,
        "Execution error: No script content found"
    );
}

#[tokio::test]
async fn script_file_wins_over_inline_text() {
    let h = harness(8);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "echo from-file").unwrap();
    let task = h.active_task(NewTask {
        script_file: Some(file.path().display().to_string()),
        ..new_task(ScheduleKind::Interval, "60", "echo inline")
    });
    h.dispatcher.trigger_now(&task.id).unwrap();
    let id = h.queue.try_next().unwrap();
    execute(&h.ctx, &id, "w").await;
    assert_eq!(
        h.store.get_execution(&id).unwrap().output.trim(),
        "from-file"
    );
}

#[tokio::test]
async fn environment_reaches_the_script() {
    let h = harness(8);
    let task = h.active_task(NewTask {
        environment_variables: "GREETING = hi\nGREETING=hello\nbogus line".into(),
        ..new_task(ScheduleKind::Interval, "60", "echo \"$GREETING world\"")
    });
    h.dispatcher.trigger_now(&task.id).unwrap();
    let id = h.queue.try_next().unwrap();
    execute(&h.ctx, &id, "w").await;
    assert_eq!(
        h.store.get_execution(&id).unwrap().output.trim(),
        "hello world"
    );
}

#[tokio::test]
async fn totals_always_add_up() {
    let h = harness(8);
    let task = h.active_task(new_task(
        ScheduleKind::Interval,
        "60",
        "[ -f \"$MARKER\" ] && exit 0; touch \"$MARKER\"; exit 1",
    ));
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    h.store
        .update_task(
            &task.id,
            &taskschedule_scheduler::TaskUpdate {
                environment_variables: Some(format!("MARKER={}", marker.display())),
                ..Default::default()
            },
            h.clock.now(),
        )
        .unwrap();

    for _ in 0..4 {
        h.dispatcher.trigger_now(&task.id).unwrap();
        let id = h.queue.try_next().unwrap();
        execute(&h.ctx, &id, "w").await;
    }
    let task = h.store.get_task(&task.id).unwrap();
    assert_eq!(task.total_runs, 4);
    assert_eq!(task.failed_runs, 1);
    assert_eq!(task.successful_runs, 3);
    assert_eq!(task.total_runs, task.successful_runs + task.failed_runs);
    assert_eq!(task.success_rate(), 75.0);
}

#[tokio::test]
async fn engine_dispatches_and_shuts_down() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut config = TaskScheduleConfig::default();
    config.runner = sh_runner_config();
    config.dispatcher.cadence_secs = 1;
    config.workers.concurrency = 2;

    let clock = Arc::new(SystemClock);
    let task = store
        .create_task(new_task(ScheduleKind::Once, "", "echo engine"), clock.now())
        .unwrap();
    store
        .set_task_status(&task.id, TaskStatus::Active, clock.now())
        .unwrap();

    let engine = SchedulerEngine::with_clock(store.clone(), &config, clock);
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(engine.run(shutdown.clone()));

    let mut finished = false;
    for _ in 0..100 {
        let task = store.get_task(&task.id).unwrap();
        if task.total_runs == 1 {
            finished = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
    assert!(finished, "once task never completed");

    let task = store.get_task(&task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Inactive);
    let execs = store.list_executions_for_task(&task.id, None).unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecutionStatus::Success);
    assert_eq!(execs[0].output.trim(), "engine");

    shutdown.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), running)
        .await
        .expect("engine stops")
        .unwrap()
        .unwrap();
}
