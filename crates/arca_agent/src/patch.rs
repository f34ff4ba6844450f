//! The self-healing task envelope.
//!
//! Every task runs as pre-hook -> handler -> post-hook. The pre-hook
//! diagnoses the substrate (control plane, pool, router repo, task queue,
//! target sprite) and applies short-lived patches so the task can execute;
//! the post-hook verifies the outcome and turns each patch into its
//! permanent root-cause fix. Both halves append to the patch log.

use anyhow::{bail, Result};
use arca_protocol::defaults::{POOL_TARGET_AVAILABLE, PROXY_PORT};
use arca_protocol::{
    HealthReport, PatchEvent, PatchPhase, PrePatch, RootFix, Task, TaskKind, TaskResult,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::handlers::{expand, provision, recycle};
use crate::watchdog;
use crate::Agent;

/// Backoff schedule while waiting for the control plane to come back.
const API_BACKOFF_SECS: [u64; 3] = [5, 10, 15];

/// Tasks sitting `in_progress` longer than this are orphans of a dead run.
const STALE_TASK_LIMIT_MINUTES: i64 = 60;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICE_RESTART_TIMEOUT: Duration = Duration::from_secs(60);

/// Execute one task inside the pre/post envelope and return its terminal
/// result. Never panics and never propagates: a broken substrate becomes a
/// failed task result.
pub fn wrap(agent: &Arc<Agent>, task_id: &str, task: &Task) -> TaskResult {
    let patches = match pre_hook(agent, task_id, task) {
        Ok(patches) => patches,
        Err(err) => {
            error!("[{task_id}] Pre-task checks failed: {err:#}");
            return TaskResult::failure(format!("{err:#}"), "Pre-task checks failed");
        }
    };
    record(agent, task_id, PatchPhase::Pre, patches.clone(), Vec::new());

    let result = match task.task_type {
        TaskKind::Provisioning => provision::run(agent, task_id, task),
        TaskKind::Recycle => recycle::run(agent, task_id, task),
    };

    if result.success {
        let (post_patches, fixes) = post_hook(agent, task_id, task, &result, &patches);
        record(agent, task_id, PatchPhase::Post, post_patches, fixes);
    } else {
        warn!(
            "[{task_id}] Task failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    // Regardless of outcome: keep the pool from running dry.
    match agent.pool.status() {
        Ok(status) if status.needs_expansion => {
            agent.spawn_expansion(POOL_TARGET_AVAILABLE);
        }
        Ok(_) => {}
        Err(err) => warn!("Pool status check after {task_id} failed: {err:#}"),
    }

    result
}

// ============================================================================
// Pre-hook
// ============================================================================

fn pre_hook(agent: &Arc<Agent>, task_id: &str, task: &Task) -> Result<Vec<PrePatch>> {
    let mut patches = Vec::new();

    // Nothing works without the control plane; poll it back with backoff.
    if !agent.client.is_reachable() {
        let mut attempts = 0u32;
        let mut recovered = false;
        for delay in API_BACKOFF_SECS {
            warn!("[{task_id}] Sprites API not reachable; retrying in {delay}s");
            std::thread::sleep(Duration::from_secs(delay));
            attempts += 1;
            if agent.client.is_reachable() {
                recovered = true;
                break;
            }
        }
        if !recovered {
            bail!("sprites API unreachable after {attempts} backoff attempts");
        }
        info!("[{task_id}] Sprites API recovered after {attempts} attempt(s)");
        patches.push(PrePatch::ApiRecovered { attempts });
    }

    // A provisioning task needs at least one sprite to hand out.
    if task.task_type == TaskKind::Provisioning {
        let status = agent.pool.status()?;
        if status.available == 0 {
            warn!("[{task_id}] Pool empty; creating one emergency sprite");
            let sprite_name = expand::create_one(agent)
                .map_err(|err| err.context("emergency sprite creation failed"))?;
            patches.push(PrePatch::PoolEmergency { sprite_name });
        }
    }

    // The router repo must be a clean critical section before any handler
    // touches it.
    match agent.router.is_clean() {
        Ok(true) => {}
        Ok(false) => match agent.router.reset_hard() {
            Ok(()) => patches.push(PrePatch::GitReset),
            Err(err) => warn!("[{task_id}] Router repo dirty and reset failed: {err:#}"),
        },
        Err(err) => warn!("[{task_id}] Could not inspect router repo: {err:#}"),
    }

    // Sweep orphans of a previous crashed run out of `in_progress`.
    let stale = agent
        .tasks
        .fail_stale(task_id, chrono::Duration::minutes(STALE_TASK_LIMIT_MINUTES))?;
    if !stale.is_empty() {
        patches.push(PrePatch::OrphanCleanup { task_ids: stale });
    }

    // A recycle target that is already dead is worth knowing about, but not
    // worth patching: the recycle will scrub it regardless. Log only.
    if task.task_type == TaskKind::Recycle {
        if let Some(username) = task.metadata.username.as_deref() {
            if let Ok(Some(assignment)) = agent.pool.get(username) {
                let report = probe_health(agent, &assignment.sprite_name);
                if !report.all_up() {
                    warn!(
                        "[{task_id}] Recycle target {} unhealthy ({report:?})",
                        assignment.sprite_name
                    );
                }
            }
        }
    }

    Ok(patches)
}

// ============================================================================
// Post-hook
// ============================================================================

/// What the post-hook intends to do about one pre-patch. Split from the
/// execution so the pairing stays a pure, testable table.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FixPlan {
    /// Transient condition that resolved itself; log only.
    Nothing,
    /// Grow the pool back to the target in the background.
    ExpandPool,
    /// Put a watchdog on the sprite whose services needed a restart.
    InstallWatchdog { sprite_name: String },
    /// Record the fix as-is, no side effect needed.
    Note(RootFix),
}

fn plan_fix(patch: &PrePatch) -> FixPlan {
    match patch {
        PrePatch::ApiRecovered { .. } => FixPlan::Nothing,
        PrePatch::PoolEmergency { .. } => FixPlan::ExpandPool,
        PrePatch::GitReset => FixPlan::Note(RootFix::GitResetRecorded),
        PrePatch::OrphanCleanup { task_ids } => FixPlan::Note(RootFix::OrphansNoted {
            count: task_ids.len(),
        }),
        PrePatch::ServiceRestart { sprite_name, .. } => FixPlan::InstallWatchdog {
            sprite_name: sprite_name.clone(),
        },
    }
}

/// Verify a successful task and convert every applied patch into its
/// permanent counterpart. Returns the patches applied during verification
/// and the root fixes taken.
fn post_hook(
    agent: &Arc<Agent>,
    task_id: &str,
    task: &Task,
    result: &TaskResult,
    pre_patches: &[PrePatch],
) -> (Vec<PrePatch>, Vec<RootFix>) {
    let mut post_patches = Vec::new();
    let mut fixes = Vec::new();

    if task.task_type == TaskKind::Provisioning {
        verify_provisioning(agent, task_id, task, result, &mut post_patches, &mut fixes);
    }

    for patch in pre_patches.iter().chain(post_patches.iter()) {
        match plan_fix(patch) {
            FixPlan::Nothing => {
                debug!("[{task_id}] Patch {} needs no permanent fix", patch.name());
            }
            FixPlan::ExpandPool => {
                agent.spawn_expansion(POOL_TARGET_AVAILABLE);
                fixes.push(RootFix::PoolExpanded {
                    target: POOL_TARGET_AVAILABLE,
                });
            }
            FixPlan::InstallWatchdog { sprite_name } => {
                match watchdog::install(&agent.client, &sprite_name) {
                    Ok(()) => fixes.push(RootFix::WatchdogInstalled { sprite_name }),
                    Err(err) => {
                        warn!("[{task_id}] Watchdog install on {sprite_name} failed: {err:#}")
                    }
                }
            }
            FixPlan::Note(fix) => fixes.push(fix),
        }
    }

    (post_patches, fixes)
}

/// Provisioning-specific verification: the customer stack must answer its
/// health endpoint and the route must exist.
fn verify_provisioning(
    agent: &Arc<Agent>,
    task_id: &str,
    task: &Task,
    result: &TaskResult,
    post_patches: &mut Vec<PrePatch>,
    fixes: &mut Vec<RootFix>,
) {
    let Some(sprite) = result.sprite_name.as_deref() else {
        return;
    };

    let report = probe_health(agent, sprite);
    if !report.all_up() {
        let down = report.down_services();
        warn!("[{task_id}] Sprite {sprite} health check failed; restarting {down:?}");
        for service in &down {
            if let Err(err) = agent.client.exec(
                sprite,
                &format!("service start {service}"),
                &[],
                SERVICE_RESTART_TIMEOUT,
            ) {
                warn!("[{task_id}] Restart of {service} on {sprite} failed: {err:#}");
            }
        }
        post_patches.push(PrePatch::ServiceRestart {
            sprite_name: sprite.to_string(),
            services: down,
        });

        let recheck = probe_health(agent, sprite);
        if !recheck.all_up() {
            error!(
                "[{task_id}] Sprite {sprite} still unhealthy after restart; verification failed"
            );
        }
    }

    if let Some(username) = task.metadata.username.as_deref() {
        match agent.router.has_mapping(username) {
            Ok(true) => {}
            Ok(false) => {
                warn!("[{task_id}] Router mapping missing for {username}; re-posting");
                if let Some(url) = result.sprite_url.as_deref() {
                    if let Err(err) = agent.router.add_mapping(username, url) {
                        warn!("[{task_id}] Mapping re-add failed: {err:#}");
                    }
                    if let Err(err) = agent.admin.add(username, url, sprite) {
                        warn!("[{task_id}] Backup mapping re-post failed: {err:#}");
                    }
                    fixes.push(RootFix::MappingReposted {
                        username: username.to_string(),
                    });
                }
            }
            Err(err) => warn!("[{task_id}] Mapping check for {username} failed: {err:#}"),
        }
    }

    if !result.email_sent {
        warn!("[{task_id}] Welcome email was not sent; customer needs a manual follow-up");
    }
}

/// Probe the customer health endpoint through an in-sprite curl. Anything
/// other than well-formed JSON counts as both services down.
pub(crate) fn probe_health(agent: &Agent, sprite: &str) -> HealthReport {
    let command = format!("curl -sf http://localhost:{PROXY_PORT}/health");
    match agent
        .client
        .exec(sprite, &command, &[], HEALTH_PROBE_TIMEOUT)
    {
        Ok(output) => {
            if output.body.get("proxy").is_some() || output.body.get("gateway").is_some() {
                serde_json::from_value(output.body.clone()).unwrap_or_default()
            } else {
                serde_json::from_str(output.output().trim()).unwrap_or_default()
            }
        }
        Err(err) => {
            debug!("Health probe on {sprite} failed: {err:#}");
            HealthReport::default()
        }
    }
}

fn record(
    agent: &Agent,
    task_id: &str,
    phase: PatchPhase,
    patches: Vec<PrePatch>,
    fixes: Vec<RootFix>,
) {
    let event = PatchEvent {
        task_id: task_id.to_string(),
        phase,
        at: Utc::now().to_rfc3339(),
        patches,
        fixes,
    };
    if let Err(err) = agent.patch_log.record(event) {
        warn!("Failed to write patch log entry for {task_id}: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_patch_kind_has_a_fix_decision() {
        assert_eq!(
            plan_fix(&PrePatch::ApiRecovered { attempts: 2 }),
            FixPlan::Nothing
        );
        assert_eq!(
            plan_fix(&PrePatch::PoolEmergency {
                sprite_name: "arca-customer-011".into()
            }),
            FixPlan::ExpandPool
        );
        assert_eq!(
            plan_fix(&PrePatch::GitReset),
            FixPlan::Note(RootFix::GitResetRecorded)
        );
        assert_eq!(
            plan_fix(&PrePatch::OrphanCleanup {
                task_ids: vec!["PROV-001".into(), "PROV-002".into()]
            }),
            FixPlan::Note(RootFix::OrphansNoted { count: 2 })
        );
        assert_eq!(
            plan_fix(&PrePatch::ServiceRestart {
                sprite_name: "arca-customer-003".into(),
                services: vec!["proxy".into()]
            }),
            FixPlan::InstallWatchdog {
                sprite_name: "arca-customer-003".into()
            }
        );
    }
}
