//! `taskschedule task ...`

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use taskschedule_core::{TaskId, TaskScheduleConfig};
use taskschedule_runner::ScriptRunner;
use taskschedule_scheduler::cancel::CancelRegistry;
use taskschedule_scheduler::locks::TaskLocks;
use taskschedule_scheduler::policy::RetryPolicy;
use taskschedule_scheduler::worker::{execute, WorkerContext};
use taskschedule_scheduler::{
    Dispatcher, ExecutionStore, NewTask, SqliteStore, SystemClock, Task, TaskStatus, TaskStore,
    WorkerPool,
};

use super::{fmt_time, Output};

pub fn add(store: &SqliteStore, new: NewTask, activate: bool, out: &Output) -> Result<()> {
    let now = Utc::now();
    let mut task = store.create_task(new, now)?;
    if activate {
        task = store.set_task_status(&task.id, TaskStatus::Active, now)?;
    }
    if !out.print_json(&task)? {
        println!("Created task {} ({})", task.id, task.status);
        if let Some(next) = task.next_run_at {
            println!("Next run: {}", next.to_rfc3339());
        }
    }
    Ok(())
}

pub fn list(store: &SqliteStore, out: &Output) -> Result<()> {
    let tasks = store.list_tasks()?;
    if out.print_json(&tasks)? {
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<24}  {:<8}  {:<8}  {:<19}  {:>6}",
        "ID", "NAME", "KIND", "STATUS", "NEXT RUN", "RUNS"
    );
    for t in &tasks {
        println!(
            "{:<36}  {:<24}  {:<8}  {:<8}  {:<19}  {:>6}",
            t.id,
            truncate_name(&t.name, 24),
            t.schedule_kind,
            t.status,
            fmt_time(t.next_run_at),
            t.total_runs
        );
    }
    Ok(())
}

pub fn show(store: &SqliteStore, id: &str, out: &Output) -> Result<()> {
    let task = store.get_task(&parse_task_id(id)?)?;
    if out.print_json(&task)? {
        return Ok(());
    }
    print_task(&task);
    Ok(())
}

pub fn set_status(store: &SqliteStore, id: &str, status: TaskStatus, out: &Output) -> Result<()> {
    let task = store.set_task_status(&parse_task_id(id)?, status, Utc::now())?;
    if !out.print_json(&task)? {
        println!(
            "Task {} is now {} (next run: {})",
            task.id,
            task.status,
            fmt_time(task.next_run_at)
        );
    }
    Ok(())
}

pub fn delete(store: &SqliteStore, id: &str) -> Result<()> {
    store.delete_task(&parse_task_id(id)?)?;
    println!("Deleted task {id}");
    Ok(())
}

/// Trigger a manual run and execute it (and any retries) in this process.
pub async fn run(
    store: SqliteStore,
    config: &TaskScheduleConfig,
    id: &str,
    out: &Output,
) -> Result<()> {
    let task_id = parse_task_id(id)?;
    let store = Arc::new(store);
    let clock = Arc::new(SystemClock);
    let locks = Arc::new(TaskLocks::new());
    let cancellations = Arc::new(CancelRegistry::new());
    let (pool, queue) = WorkerPool::channel(1);
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
        runner: ScriptRunner::new(config.runner.clone()),
        locks,
        policy: RetryPolicy::from_config(&config.retry),
        cancellations,
        clock,
        submitter: pool,
    };

    let first = dispatcher.trigger_now(&task_id)?;
    let mut ran = Vec::new();
    while let Some(next) = queue.next().await {
        let report = execute(&ctx, &next, &config.workers.node_name).await;
        ran.push(store.get_execution(&next)?);
        if report.retry.is_none() {
            break;
        }
        eprintln!("attempt failed, waiting for retry...");
    }

    if out.print_json(&ran)? {
        return Ok(());
    }
    for exec in &ran {
        println!(
            "Execution {} (attempt {}): {} exit={}",
            exec.id,
            exec.attempt,
            exec.status,
            exec.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
        );
    }
    if let Some(last) = ran.last() {
        if !last.output.is_empty() {
            println!("--- stdout ---\n{}", last.output.trim_end());
        }
        if !last.error_output.is_empty() {
            println!("--- stderr ---\n{}", last.error_output.trim_end());
        }
    } else {
        println!("Execution {} was not run", first.id);
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("ID:           {}", task.id);
    println!("Name:         {}", task.name);
    if !task.description.is_empty() {
        println!("Description:  {}", task.description);
    }
    println!("Schedule:     {} {}", task.schedule_kind, task.schedule_value);
    println!("Status:       {}", task.status);
    if let Some(ref file) = task.script_file {
        println!("Script file:  {file}");
    }
    println!("Timeout:      {}s", task.timeout_seconds);
    println!("Max retries:  {}", task.max_retries);
    println!(
        "Runs:         {} total, {} ok, {} failed ({:.1}% success)",
        task.total_runs,
        task.successful_runs,
        task.failed_runs,
        task.success_rate()
    );
    println!("Last run:     {}", fmt_time(task.last_run_at));
    println!("Next run:     {}", fmt_time(task.next_run_at));
    println!("Created:      {}", fmt_time(Some(task.created_at)));
}

pub(crate) fn parse_task_id(id: &str) -> Result<TaskId> {
    id.parse().with_context(|| format!("invalid task id '{id}'"))
}

fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let mut s: String = name.chars().take(max - 1).collect();
    s.push('…');
    s
}
