//! The main polling loop.
//!
//! Single-threaded by design: one task at a time, both stores shared with
//! external writers only through their file locks. Every remote call is a
//! natural suspension point; shutdown is observed between tasks and during
//! the sleep, and the current task always reaches its terminal status
//! write before the process exits.

use anyhow::Result;
use arca_protocol::{TaskKind, TaskStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::{config, patch, reconciler, Agent};

/// Seconds between queue polls.
const POLL_INTERVAL_SECS: u64 = 30;

/// The health reconciler runs every this many poll iterations.
const RECONCILE_EVERY_TICKS: u64 = 10;

/// Granularity of shutdown checks while sleeping.
const SLEEP_SLICE_MS: u64 = 250;

/// Run the agent until the shutdown flag is raised.
pub fn run(agent: &Arc<Agent>, shutdown: &AtomicBool) -> Result<()> {
    info!("Provisioning agent started");
    config::log_config(&agent.config);

    // Repair whatever a previous run left in flight before accepting work.
    let recovered = agent.tasks.recover_interrupted(&agent.pool)?;
    for task in &recovered {
        info!("Recovered interrupted task {} -> {}", task.id, task.status);
    }

    let mut tick: u64 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        tick += 1;

        if tick % RECONCILE_EVERY_TICKS == 0 {
            if let Err(err) = reconciler::reconcile(&agent.pool, &agent.client) {
                error!("Health reconciler failed: {err:#}");
            }
        }

        for kind in TaskKind::ALL {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            drain_kind(agent, *kind, shutdown);
        }

        sleep_with_shutdown(Duration::from_secs(POLL_INTERVAL_SECS), shutdown);
    }

    info!("Shutdown requested; agent loop stopped");
    Ok(())
}

fn drain_kind(agent: &Arc<Agent>, kind: TaskKind, shutdown: &AtomicBool) {
    let pending = match agent.tasks.list_pending(kind) {
        Ok(pending) => pending,
        Err(err) => {
            error!("Failed to list pending {kind} tasks: {err:#}");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }
    info!("Found {} pending {kind} task(s)", pending.len());

    for (task_id, task) in pending {
        // A SIGTERM between tasks stops us from claiming more work; the
        // task in flight always finishes.
        if shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested; leaving remaining {kind} tasks pending");
            return;
        }
        process_task(agent, &task_id, &task);
    }
}

fn process_task(agent: &Arc<Agent>, task_id: &str, task: &arca_protocol::Task) {
    info!("Processing task {task_id}");
    if let Err(err) = agent.tasks.update(task_id, TaskStatus::InProgress, None) {
        error!("Could not claim task {task_id}: {err:#}");
        return;
    }

    let result = patch::wrap(agent, task_id, task);

    let status = if result.success {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };
    match agent.tasks.update(task_id, status, Some(result)) {
        Ok(()) => info!("Task {task_id} {status}"),
        Err(err) => error!("Could not record terminal status for {task_id}: {err:#}"),
    }
}

fn sleep_with_shutdown(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(SLEEP_SLICE_MS);
    let mut remaining = total;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining -= nap;
    }
}
