//! Sprite recycling on subscription cancellation.
//!
//! Order matters: the route is removed first so customer traffic stops
//! immediately, then services and customer files go, then the sprite
//! returns to the pool with the base install intact. Missing pieces are
//! no-ops, not errors - a recycle may be retried after a partial run.

use anyhow::{Context, Result};
use arca_protocol::defaults::{
    CUSTOMER_WORKSPACE_GLOB, GATEWAY_SERVICE, PROVISION_SCRIPT_REMOTE, PROXY_SCRIPT_REMOTE,
    PROXY_SERVICE,
};
use arca_protocol::{Assignment, Task, TaskResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::Agent;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn run(agent: &Arc<Agent>, task_id: &str, task: &Task) -> TaskResult {
    let Some(username) = task.metadata.username.as_deref().filter(|u| !u.is_empty()) else {
        return TaskResult::failure("task metadata missing username", "Recycle failed");
    };
    info!("[{task_id}] Recycling sprite for {username}");

    let assignment = match agent.pool.get(username) {
        Ok(Some(assignment)) => assignment,
        Ok(None) => {
            warn!("[{task_id}] No sprite assigned to {username}");
            return TaskResult::failure("no sprite assigned", "Recycle failed");
        }
        Err(err) => return TaskResult::failure(format!("{err:#}"), "Recycle failed"),
    };

    match recycle_sprite(agent, username, &assignment) {
        Ok(result) => result,
        Err(err) => {
            error!("[{task_id}] Recycle for {username} failed: {err:#}");
            TaskResult::failure(format!("{err:#}"), "Recycle failed")
        }
    }
}

fn recycle_sprite(
    agent: &Arc<Agent>,
    username: &str,
    assignment: &Assignment,
) -> Result<TaskResult> {
    let sprite = assignment.sprite_name.as_str();

    // Cut traffic before anything is torn down on the sprite.
    agent
        .router
        .remove_mapping(username)
        .context("router mapping removal failed")?;
    if let Err(err) = agent.admin.remove(username) {
        warn!("Backup mapping removal for {username} failed: {err:#}");
    }

    let cleanup_commands = [
        format!("service delete {PROXY_SERVICE} || true"),
        format!("service delete {GATEWAY_SERVICE} || true"),
        "pkill -f customer_ui.py || true".to_string(),
        "pkill -f 'openclaw gateway' || true".to_string(),
        format!("rm -rf {CUSTOMER_WORKSPACE_GLOB}"),
        format!("rm -f {PROXY_SCRIPT_REMOTE}"),
        format!("rm -f {PROVISION_SCRIPT_REMOTE}"),
    ];
    for command in &cleanup_commands {
        if let Err(err) = agent.client.exec(sprite, command, &[], CLEANUP_TIMEOUT) {
            warn!("Cleanup on {sprite} ('{command}') failed: {err:#}");
        }
    }

    if agent.pool.release(username)? {
        info!("Sprite {sprite} recycled and returned to pool");
    } else {
        warn!("Assignment for {username} vanished during recycle");
    }

    Ok(TaskResult {
        success: true,
        message: Some("Sprite recycled and returned to pool".into()),
        sprite_name: Some(assignment.sprite_name.clone()),
        ..Default::default()
    })
}
