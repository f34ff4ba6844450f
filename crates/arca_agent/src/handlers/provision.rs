//! Customer provisioning.
//!
//! Assign a sprite, push the provisioning assets into it, run the install
//! script, publish the route, send the welcome mail. Failures after the
//! sprite was grabbed tear the sprite back down and release it; failures of
//! the secondary effects (router commit, email) leave the task successful
//! with the corresponding result flag unset.

use anyhow::{Context, Result};
use arca_protocol::defaults::{
    CUSTOM_UI_REMOTE, GATEWAY_SERVICE, POOL_TARGET_AVAILABLE, PROVISION_SCRIPT_REMOTE,
    PROXY_SCRIPT_REMOTE, PROXY_SERVICE,
};
use arca_protocol::{Assignment, Task, TaskResult};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::Agent;

/// The install script gets ten minutes; it downloads customer skills.
const PROVISION_TIMEOUT: Duration = Duration::from_secs(600);

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn run(agent: &Arc<Agent>, task_id: &str, task: &Task) -> TaskResult {
    let meta = &task.metadata;
    let Some(username) = meta.username.as_deref().filter(|u| !u.is_empty()) else {
        return TaskResult::failure("task metadata missing username", "Provisioning failed");
    };
    let customer_email = meta.customer_email.clone().unwrap_or_default();
    let customer_name = meta.customer_name.clone().unwrap_or_default();
    info!("[{task_id}] Starting provisioning for {customer_email} (username: {username})");

    let assignment = match agent.pool.assign(username, &customer_email, &customer_name) {
        Ok(Some(assignment)) => assignment,
        Ok(None) => {
            return TaskResult::failure(
                "no sprites available in pool - expansion needed",
                "Provisioning failed",
            )
        }
        Err(err) => return TaskResult::failure(format!("{err:#}"), "Provisioning failed"),
    };
    info!("[{task_id}] Assigned sprite from pool: {}", assignment.sprite_name);

    let mut progress = Progress::default();
    match provision_on_sprite(agent, task, username, &assignment, &mut progress) {
        Ok(result) => result,
        Err(err) => {
            error!("[{task_id}] Provisioning for {username} failed: {err:#}");
            teardown(agent, username, &assignment, &progress);
            TaskResult::failure(format!("{err:#}"), "Provisioning failed")
        }
    }
}

/// What has already happened, for compensating teardown.
#[derive(Default)]
struct Progress {
    mapping_committed: bool,
}

fn provision_on_sprite(
    agent: &Arc<Agent>,
    task: &Task,
    username: &str,
    assignment: &Assignment,
    progress: &mut Progress,
) -> Result<TaskResult> {
    let sprite = assignment.sprite_name.as_str();
    let meta = &task.metadata;

    let script_path = agent.config.provision_script_local();
    let script = fs::read(&script_path)
        .with_context(|| format!("provisioning script missing at {}", script_path.display()))?;
    agent
        .client
        .write_file(sprite, &script, PROVISION_SCRIPT_REMOTE)?;
    info!("Provisioning script uploaded to {sprite}");

    upload_if_present(agent, sprite, &agent.config.custom_ui_local(), CUSTOM_UI_REMOTE);
    upload_if_present(
        agent,
        sprite,
        &agent.config.proxy_script_local(),
        PROXY_SCRIPT_REMOTE,
    );

    let env = provision_env(task, assignment);
    agent
        .client
        .exec(
            sprite,
            &format!("bash {PROVISION_SCRIPT_REMOTE}"),
            &env,
            PROVISION_TIMEOUT,
        )
        .context("provisioning script execution failed")?;
    info!("Provisioning script completed on {sprite}");

    let middleware_updated = match agent.router.add_mapping(username, &assignment.sprite_url) {
        Ok(committed) => {
            progress.mapping_committed = committed;
            true
        }
        Err(err) => {
            warn!("Router mapping for {username} failed: {err:#}");
            false
        }
    };

    if let Err(err) = agent.admin.add(username, &assignment.sprite_url, sprite) {
        warn!("Backup mapping post for {username} failed: {err:#}");
    }

    let customer_url = format!("https://{username}.arcamatrix.com");
    let email_sent = !customer_email_missing(meta.customer_email.as_deref())
        && agent.mailer.send_welcome(
            meta.customer_email.as_deref().unwrap_or_default(),
            meta.customer_name.as_deref().unwrap_or_default(),
            username,
            &customer_url,
        );

    let status = agent.pool.status()?;
    info!(
        "Pool status: {} available, {} assigned",
        status.available, status.assigned
    );
    if status.needs_expansion {
        agent.spawn_expansion(POOL_TARGET_AVAILABLE);
    }

    info!("Customer URL: {customer_url}");
    Ok(TaskResult {
        success: true,
        error: None,
        message: Some("Provisioning completed successfully".into()),
        sprite_name: Some(assignment.sprite_name.clone()),
        sprite_url: Some(assignment.sprite_url.clone()),
        middleware_updated,
        email_sent,
        extra: serde_json::Map::new(),
    })
}

fn customer_email_missing(email: Option<&str>) -> bool {
    email.map(str::is_empty).unwrap_or(true)
}

fn upload_if_present(agent: &Agent, sprite: &str, local: &Path, remote: &str) {
    if !local.exists() {
        warn!("{} not found, skipping upload", local.display());
        return;
    }
    match fs::read(local) {
        Ok(bytes) => {
            if let Err(err) = agent.client.write_file(sprite, &bytes, remote) {
                warn!("Upload of {} to {sprite} failed: {err:#}", local.display());
            }
        }
        Err(err) => warn!("Could not read {}: {err}", local.display()),
    }
}

/// Environment handed to the provisioning script.
fn provision_env(task: &Task, assignment: &Assignment) -> Vec<(String, String)> {
    let meta = &task.metadata;
    [
        ("CUSTOMER_NAME", meta.customer_name.clone().unwrap_or_default()),
        (
            "CUSTOMER_EMAIL",
            meta.customer_email.clone().unwrap_or_default(),
        ),
        ("USERNAME", meta.username.clone().unwrap_or_default()),
        (
            "GATEWAY_TOKEN",
            meta.gateway_token().unwrap_or_default().to_string(),
        ),
        ("SKILLS", meta.skills_joined()),
        ("SPRITE_URL", assignment.sprite_url.clone()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

/// Best-effort compensation after a failed provisioning run: delete the two
/// customer services, roll back a committed route, return the sprite.
fn teardown(agent: &Agent, username: &str, assignment: &Assignment, progress: &Progress) {
    warn!("Tearing down partial provisioning for {username}");

    let cmd =
        format!("service delete {PROXY_SERVICE} || true; service delete {GATEWAY_SERVICE} || true");
    if let Err(err) = agent
        .client
        .exec(&assignment.sprite_name, &cmd, &[], CLEANUP_TIMEOUT)
    {
        warn!("Service teardown on {} failed: {err:#}", assignment.sprite_name);
    }

    if progress.mapping_committed {
        if let Err(err) = agent.router.remove_mapping(username) {
            warn!("Router mapping rollback for {username} failed: {err:#}");
        }
    }

    match agent.pool.release(username) {
        Ok(true) => info!("Sprite {} released back to pool", assignment.sprite_name),
        Ok(false) => warn!("No assignment found for {username} during teardown"),
        Err(err) => error!("Failed to release sprite for {username}: {err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_protocol::{TaskKind, TaskMetadata, TaskStatus};

    fn task_with(meta: TaskMetadata) -> Task {
        Task {
            id: "PROV-001".into(),
            title: None,
            description: None,
            task_type: TaskKind::Provisioning,
            status: TaskStatus::InProgress,
            priority: None,
            created_at: "2025-01-01T00:00:00Z".into(),
            updated_at: None,
            metadata: meta,
            result: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn env_prefers_gateway_token_over_password() {
        let task = task_with(TaskMetadata {
            customer_name: Some("Alice".into()),
            customer_email: Some("a@x.io".into()),
            username: Some("alice".into()),
            password: Some("fallback".into()),
            gateway_token: Some("tok-123".into()),
            skills: vec!["s1".into(), "s2".into()],
            ..Default::default()
        });
        let assignment = Assignment {
            sprite_name: "arca-customer-001".into(),
            sprite_url: "https://arca-customer-001-bl4yi.sprites.app".into(),
        };

        let env = provision_env(&task, &assignment);
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("GATEWAY_TOKEN"), "tok-123");
        assert_eq!(get("SKILLS"), "s1,s2");
        assert_eq!(
            get("SPRITE_URL"),
            "https://arca-customer-001-bl4yi.sprites.app"
        );
        assert_eq!(get("CUSTOMER_NAME"), "Alice");
    }

    #[test]
    fn env_falls_back_to_password() {
        let task = task_with(TaskMetadata {
            username: Some("bob".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        });
        let assignment = Assignment {
            sprite_name: "arca-customer-002".into(),
            sprite_url: "https://arca-customer-002-bl4yi.sprites.app".into(),
        };
        let env = provision_env(&task, &assignment);
        assert!(env
            .iter()
            .any(|(k, v)| k == "GATEWAY_TOKEN" && v == "hunter2"));
    }
}
