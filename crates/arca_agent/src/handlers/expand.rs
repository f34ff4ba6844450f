//! Pool expansion: create fresh sprites, prepare them, add them to the pool.

use anyhow::{Context, Result};
use arca_protocol::defaults::PREPARE_SCRIPT_REMOTE;
use arca_protocol::naming::next_sprite_name;
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

use crate::Agent;

/// Preparing a pool sprite installs the base software; allow ten minutes.
const PREPARE_TIMEOUT: Duration = Duration::from_secs(600);

/// Grow the pool until `target_available` sprites are available. A failure
/// on one sprite does not abort the batch. Returns how many were added.
pub fn expand_to(agent: &Agent, target_available: usize) -> Result<usize> {
    let status = agent.pool.status()?;
    let needed = target_available.saturating_sub(status.available);
    if needed == 0 {
        return Ok(0);
    }
    info!(
        "Pool low ({} available); expanding by {needed}",
        status.available
    );

    let mut created = 0;
    for name in allocate_names(agent, needed)? {
        match create_and_prepare(agent, &name) {
            Ok(url) => {
                agent.pool.add(&name, &url)?;
                created += 1;
                info!("Created and added {name} to pool");
            }
            Err(err) => warn!("Failed to create {name}: {err:#}"),
        }
    }

    let status = agent.pool.status()?;
    info!(
        "Pool expanded: {} available, {} total",
        status.available, status.total
    );
    Ok(created)
}

/// Emergency path: create exactly one sprite synchronously so the current
/// provisioning task can proceed. Unlike the batch path this propagates
/// failure to the caller.
pub fn create_one(agent: &Agent) -> Result<String> {
    let name = allocate_names(agent, 1)?
        .pop()
        .context("failed to allocate a sprite name")?;
    let url = create_and_prepare(agent, &name)?;
    agent.pool.add(&name, &url)?;
    info!("Emergency sprite {name} created and added to pool");
    Ok(name)
}

/// Next `needed` unused sprite names, counting past everything in the pool.
fn allocate_names(agent: &Agent, needed: usize) -> Result<Vec<String>> {
    let doc = agent.pool.snapshot()?;
    let mut existing: Vec<String> = doc.sprites.keys().cloned().collect();
    let mut names = Vec::with_capacity(needed);
    for _ in 0..needed {
        let name = next_sprite_name(existing.iter().map(String::as_str));
        existing.push(name.clone());
        names.push(name);
    }
    Ok(names)
}

fn create_and_prepare(agent: &Agent, name: &str) -> Result<String> {
    let url = agent.client.create(name)?;

    let script_path = agent.config.prepare_script_local();
    if script_path.exists() {
        let script = fs::read(&script_path)
            .with_context(|| format!("failed to read {}", script_path.display()))?;
        agent
            .client
            .write_file(name, &script, PREPARE_SCRIPT_REMOTE)?;
        agent
            .client
            .exec(
                name,
                &format!("bash {PREPARE_SCRIPT_REMOTE}"),
                &[],
                PREPARE_TIMEOUT,
            )
            .with_context(|| format!("prepare script failed on {name}"))?;
    } else {
        warn!(
            "Prepare script missing at {}; adding {name} unprepared",
            script_path.display()
        );
    }
    Ok(url)
}
