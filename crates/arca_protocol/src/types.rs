//! Task, pool and patch payload types.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Sprite pool
// ============================================================================

/// Lifecycle state of a pool sprite.
/// This is the CANONICAL definition - the on-disk pool file stores these
/// lowercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpriteStatus {
    /// In the pool, ready for assignment
    #[default]
    Available,
    /// Bound to a customer
    Assigned,
    /// Failed a liveness probe; excluded from assignment
    Unreachable,
}

impl SpriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpriteStatus::Available => "available",
            SpriteStatus::Assigned => "assigned",
            SpriteStatus::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for SpriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SpriteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "available" => Ok(SpriteStatus::Available),
            "assigned" => Ok(SpriteStatus::Assigned),
            "unreachable" => Ok(SpriteStatus::Unreachable),
            _ => Err(format!(
                "Invalid sprite status: '{}'. Expected: available, assigned, or unreachable",
                s
            )),
        }
    }
}

/// One sprite in the pool file.
///
/// Customer attributes are present exactly while the sprite is assigned;
/// release removes the keys rather than writing nulls, matching what older
/// tooling expects to read back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpriteRecord {
    pub status: SpriteStatus,
    pub created_at: String,
    pub sprite_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreachable_since: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SpriteRecord {
    pub fn available(created_at: String, sprite_url: String) -> Self {
        Self {
            status: SpriteStatus::Available,
            created_at,
            sprite_url,
            assigned_to: None,
            assigned_at: None,
            customer_email: None,
            customer_name: None,
            unreachable_since: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Strip all customer attributes, leaving an `available` record.
    pub fn clear_assignment(&mut self) {
        self.status = SpriteStatus::Available;
        self.assigned_to = None;
        self.assigned_at = None;
        self.customer_email = None;
        self.customer_name = None;
    }
}

/// The whole pool file: sprite records plus the customer assignment index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolDocument {
    #[serde(default)]
    pub sprites: IndexMap<String, SpriteRecord>,
    #[serde(default)]
    pub assignments: IndexMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Snapshot counters for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub assigned: usize,
    pub needs_expansion: bool,
}

/// A customer's sprite, as returned by assign/get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub sprite_name: String,
    pub sprite_url: String,
}

// ============================================================================
// Tasks
// ============================================================================

/// Task flavor, both as the `type` field and as the task-id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Provisioning,
    Recycle,
}

impl TaskKind {
    pub const ALL: &'static [TaskKind] = &[TaskKind::Provisioning, TaskKind::Recycle];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Provisioning => "provisioning",
            TaskKind::Recycle => "recycle",
        }
    }

    /// Prefix of task ids of this kind (`PROV-001`, `RECYCLE-003`).
    pub fn id_prefix(&self) -> &'static str {
        match self {
            TaskKind::Provisioning => "PROV-",
            TaskKind::Recycle => "RECYCLE-",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provisioning" => Ok(TaskKind::Provisioning),
            "recycle" => Ok(TaskKind::Recycle),
            _ => Err(format!(
                "Invalid task kind: '{}'. Expected: provisioning or recycle",
                s
            )),
        }
    }
}

/// Task lifecycle. Transitions are monotonic except the recovery
/// `in_progress -> pending` taken once at agent startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: '{}'", s)),
        }
    }
}

/// Customer attributes attached by the checkout intake. Wire names are
/// camelCase; anything the intake adds beyond these fields rides along in
/// `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskMetadata {
    /// Gateway token, falling back to the legacy password field.
    pub fn gateway_token(&self) -> Option<&str> {
        self.gateway_token
            .as_deref()
            .or(self.password.as_deref())
    }

    pub fn skills_joined(&self) -> String {
        self.skills.join(",")
    }
}

/// Terminal outcome of a task. `middleware_updated` / `email_sent` record
/// secondary effects separately so a partial success stays `completed` and
/// the post-hook can redo the missing pieces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite_url: Option<String>,
    #[serde(default)]
    pub middleware_updated: bool,
    #[serde(default)]
    pub email_sent: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskResult {
    pub fn failure(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// One task in the shared task file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: TaskKind,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// A task belongs to a kind when both the `type` field and the id prefix
    /// agree; ids written by the intake are authoritative for grouping.
    pub fn is_kind(&self, kind: TaskKind) -> bool {
        self.task_type == kind && self.id.starts_with(kind.id_prefix())
    }
}

/// The whole task file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(default)]
    pub tasks: IndexMap<String, Task>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ============================================================================
// Patch engine records
// ============================================================================

/// Which half of the task envelope produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchPhase {
    Pre,
    Post,
}

/// A short-lived repair applied before (or, for service restarts, while
/// verifying) a task. Closed union: the post-hook matches exhaustively so a
/// new patch kind cannot ship without a root-fix decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrePatch {
    /// Control plane answered only after backoff polling.
    ApiRecovered { attempts: u32 },
    /// Pool was empty; one sprite was created and prepared synchronously.
    PoolEmergency { sprite_name: String },
    /// Router repo working tree was dirty and has been reset.
    GitReset,
    /// Other tasks sat in `in_progress` beyond the stale cutoff and were
    /// forced to `failed`.
    OrphanCleanup { task_ids: Vec<String> },
    /// Customer services on the target sprite had to be restarted.
    ServiceRestart {
        sprite_name: String,
        services: Vec<String>,
    },
}

impl PrePatch {
    pub fn name(&self) -> &'static str {
        match self {
            PrePatch::ApiRecovered { .. } => "api_recovered",
            PrePatch::PoolEmergency { .. } => "pool_emergency",
            PrePatch::GitReset => "git_reset",
            PrePatch::OrphanCleanup { .. } => "orphan_cleanup",
            PrePatch::ServiceRestart { .. } => "service_restart",
        }
    }
}

/// Permanent counterpart to a [`PrePatch`], taken by the post-hook after a
/// successful task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RootFix {
    /// Background expansion queued to restore the available target.
    PoolExpanded { target: usize },
    /// Cron watchdog installed on the affected sprite.
    WatchdogInstalled { sprite_name: String },
    /// Dirty-tree incident recorded for offline investigation.
    GitResetRecorded,
    /// Orphaned tasks already terminally failed; noted for the record.
    OrphansNoted { count: usize },
    /// Router mapping was missing after provisioning and has been re-posted.
    MappingReposted { username: String },
}

impl RootFix {
    pub fn name(&self) -> &'static str {
        match self {
            RootFix::PoolExpanded { .. } => "pool_expanded",
            RootFix::WatchdogInstalled { .. } => "watchdog_installed",
            RootFix::GitResetRecorded => "git_reset_recorded",
            RootFix::OrphansNoted { .. } => "orphans_noted",
            RootFix::MappingReposted { .. } => "mapping_reposted",
        }
    }
}

/// One entry in the ring-buffered patch log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchEvent {
    pub task_id: String,
    pub phase: PatchPhase,
    pub at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PrePatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes: Vec<RootFix>,
}

// ============================================================================
// Sprite health
// ============================================================================

/// Body of `GET /health` on a sprite's local proxy port. A missing or
/// malformed response deserializes to both services down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub proxy: bool,
    #[serde(default)]
    pub gateway: bool,
}

impl HealthReport {
    pub fn all_up(&self) -> bool {
        self.proxy && self.gateway
    }

    pub fn down_services(&self) -> Vec<String> {
        let mut down = Vec::new();
        if !self.proxy {
            down.push(crate::defaults::PROXY_SERVICE.to_string());
        }
        if !self.gateway {
            down.push(crate::defaults::GATEWAY_SERVICE.to_string());
        }
        down
    }
}
