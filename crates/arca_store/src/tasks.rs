//! The shared task file written by the checkout intake and drained by the
//! dispatcher.
//!
//! Updates are read-modify-write cycles under the same exclusive-lock
//! discipline as the pool. Status transitions are monotonic; the only
//! backwards transition is the startup recovery of tasks a previous agent
//! left `in_progress`.

use anyhow::{bail, Context, Result};
use arca_protocol::{Task, TaskDocument, TaskKind, TaskResult, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::lock::LockedFile;
use crate::pool::SpritePool;

/// Outcome of startup crash recovery for one interrupted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTask {
    pub id: String,
    pub status: TaskStatus,
}

/// Handle to the on-disk task document.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    /// Open the task file at `path`, creating an empty document if the
    /// intake has not written one yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create task directory {}", parent.display())
            })?;
        }
        if !path.exists() {
            let payload = serde_json::to_vec_pretty(&TaskDocument::default())?;
            fs::write(&path, payload)
                .with_context(|| format!("Failed to create task file {}", path.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pending tasks of one kind, in document order. Lock-free snapshot.
    pub fn list_pending(&self, kind: TaskKind) -> Result<Vec<(String, Task)>> {
        let doc = self.load_unlocked()?;
        Ok(doc
            .tasks
            .into_iter()
            .filter(|(_, task)| task.status == TaskStatus::Pending && task.is_kind(kind))
            .collect())
    }

    /// Point-in-time view of every task.
    pub fn snapshot(&self) -> Result<IndexMap<String, Task>> {
        Ok(self.load_unlocked()?.tasks)
    }

    /// Atomically move a task to `status`, attaching `result` when given.
    ///
    /// Terminal tasks are frozen: overwriting a completed or failed task is
    /// an error rather than a silent rewind.
    pub fn update(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<()> {
        self.mutate(|doc| {
            let Some(task) = doc.tasks.get_mut(task_id) else {
                bail!("Unknown task id: {task_id}");
            };
            if task.status.is_terminal() {
                bail!(
                    "Task {task_id} is already {}; refusing transition to {status}",
                    task.status
                );
            }
            task.status = status;
            task.updated_at = Some(Utc::now().to_rfc3339());
            if let Some(result) = result {
                task.result = Some(result);
            }
            info!("Task {task_id} -> {status}");
            Ok(())
        })
    }

    /// Startup crash recovery for tasks a previous agent run left
    /// `in_progress`.
    ///
    /// A provisioning task whose username already holds a pool assignment
    /// is failed (re-running it would double-assign); any other interrupted
    /// task is returned to `pending` for a clean retry.
    pub fn recover_interrupted(&self, pool: &SpritePool) -> Result<Vec<RecoveredTask>> {
        self.mutate(|doc| {
            let mut recovered = Vec::new();
            let now = Utc::now().to_rfc3339();

            for (id, task) in doc.tasks.iter_mut() {
                if task.status != TaskStatus::InProgress {
                    continue;
                }

                let already_assigned = match (task.task_type, task.metadata.username.as_deref()) {
                    (TaskKind::Provisioning, Some(username)) => pool.get(username)?.is_some(),
                    _ => false,
                };

                if already_assigned {
                    warn!(
                        "Task {id} was interrupted after its sprite was assigned; marking failed"
                    );
                    task.status = TaskStatus::Failed;
                    task.result = Some(TaskResult::failure(
                        "agent crashed mid-provisioning, sprite already assigned",
                        "Not retried to prevent double-assignment",
                    ));
                } else {
                    info!("Task {id} was interrupted; returning to pending");
                    task.status = TaskStatus::Pending;
                }
                task.updated_at = Some(now.clone());
                recovered.push(RecoveredTask {
                    id: id.clone(),
                    status: task.status,
                });
            }
            Ok(recovered)
        })
    }

    /// Force tasks stuck `in_progress` longer than `max_age` to `failed`.
    /// The task currently being executed is exempt. Returns the ids acted on.
    pub fn fail_stale(&self, current_task: &str, max_age: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - max_age;
        self.mutate(|doc| {
            let mut failed = Vec::new();
            for (id, task) in doc.tasks.iter_mut() {
                if task.status != TaskStatus::InProgress || id == current_task {
                    continue;
                }
                let stamp = task.updated_at.as_deref().unwrap_or(&task.created_at);
                let is_stale = match DateTime::parse_from_rfc3339(stamp) {
                    Ok(at) => at.with_timezone(&Utc) < cutoff,
                    Err(_) => {
                        warn!("Task {id} has an unparseable timestamp '{stamp}'; leaving as-is");
                        false
                    }
                };
                if !is_stale {
                    continue;
                }
                warn!("Task {id} exceeded the in-progress time limit; forcing failed");
                task.status = TaskStatus::Failed;
                task.updated_at = Some(Utc::now().to_rfc3339());
                task.result = Some(TaskResult::failure(
                    "task exceeded the in-progress time limit",
                    "Forced to failed by the pre-task orphan sweep",
                ));
                failed.push(id.clone());
            }
            Ok(failed)
        })
    }

    fn load_unlocked(&self) -> Result<TaskDocument> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read task file {}", self.path.display()))?;
        parse_document(&content)
            .with_context(|| format!("Corrupt task file {}", self.path.display()))
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut TaskDocument) -> Result<T>) -> Result<T> {
        let mut locked = LockedFile::acquire(&self.path)?;
        let content = locked.read_to_string()?;
        let mut doc = parse_document(&content)
            .with_context(|| format!("Corrupt task file {}", self.path.display()))?;

        let out = op(&mut doc)?;

        let payload =
            serde_json::to_vec_pretty(&doc).context("Failed to serialize task document")?;
        locked.replace_contents(&payload)?;
        Ok(out)
    }
}

fn parse_document(content: &str) -> Result<TaskDocument> {
    if content.trim().is_empty() {
        return Ok(TaskDocument::default());
    }
    serde_json::from_str(content).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_protocol::TaskMetadata;
    use tempfile::TempDir;

    fn task(id: &str, kind: TaskKind, status: TaskStatus, username: &str) -> Task {
        Task {
            id: id.to_string(),
            title: None,
            description: None,
            task_type: kind,
            status,
            priority: Some("high".into()),
            created_at: Utc::now().to_rfc3339(),
            updated_at: None,
            metadata: TaskMetadata {
                username: Some(username.to_string()),
                customer_email: Some(format!("{username}@x.io")),
                ..Default::default()
            },
            result: None,
            extra: serde_json::Map::new(),
        }
    }

    fn store_with_tasks(dir: &TempDir, tasks: Vec<Task>) -> TaskStore {
        let path = dir.path().join("tasks.json");
        let mut doc = TaskDocument::default();
        for t in tasks {
            doc.tasks.insert(t.id.clone(), t);
        }
        fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
        TaskStore::open(path).unwrap()
    }

    #[test]
    fn list_pending_filters_kind_and_status() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(
            &dir,
            vec![
                task("PROV-001", TaskKind::Provisioning, TaskStatus::Pending, "a"),
                task("PROV-002", TaskKind::Provisioning, TaskStatus::Completed, "b"),
                task("RECYCLE-001", TaskKind::Recycle, TaskStatus::Pending, "c"),
            ],
        );

        let pending = store.list_pending(TaskKind::Provisioning).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "PROV-001");

        let recycle = store.list_pending(TaskKind::Recycle).unwrap();
        assert_eq!(recycle.len(), 1);
        assert_eq!(recycle[0].0, "RECYCLE-001");
    }

    #[test]
    fn update_moves_through_lifecycle_and_freezes_terminal() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(
            &dir,
            vec![task("PROV-001", TaskKind::Provisioning, TaskStatus::Pending, "a")],
        );

        store
            .update("PROV-001", TaskStatus::InProgress, None)
            .unwrap();
        store
            .update(
                "PROV-001",
                TaskStatus::Completed,
                Some(TaskResult {
                    success: true,
                    ..Default::default()
                }),
            )
            .unwrap();

        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["PROV-001"].status, TaskStatus::Completed);
        assert!(tasks["PROV-001"].updated_at.is_some());
        assert!(tasks["PROV-001"].result.as_ref().unwrap().success);

        // Terminal tasks cannot be rewound.
        assert!(store
            .update("PROV-001", TaskStatus::Pending, None)
            .is_err());
    }

    #[test]
    fn update_unknown_task_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(&dir, vec![]);
        assert!(store
            .update("PROV-404", TaskStatus::InProgress, None)
            .is_err());
    }

    #[test]
    fn recovery_fails_provisioning_with_existing_assignment() {
        let dir = TempDir::new().unwrap();
        let pool = SpritePool::open(dir.path().join("pool.json")).unwrap();
        pool.assign("dave", "d@x.io", "D").unwrap().unwrap();

        let store = store_with_tasks(
            &dir,
            vec![task(
                "PROV-003",
                TaskKind::Provisioning,
                TaskStatus::InProgress,
                "dave",
            )],
        );

        let recovered = store.recover_interrupted(&pool).unwrap();
        assert_eq!(
            recovered,
            vec![RecoveredTask {
                id: "PROV-003".into(),
                status: TaskStatus::Failed,
            }]
        );

        let tasks = store.snapshot().unwrap();
        let result = tasks["PROV-003"].result.as_ref().unwrap();
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("already assigned"));
        // Pool untouched by recovery.
        assert_eq!(pool.status().unwrap().assigned, 1);
    }

    #[test]
    fn recovery_resets_unassigned_and_recycle_tasks() {
        let dir = TempDir::new().unwrap();
        let pool = SpritePool::open(dir.path().join("pool.json")).unwrap();
        let store = store_with_tasks(
            &dir,
            vec![
                task(
                    "PROV-004",
                    TaskKind::Provisioning,
                    TaskStatus::InProgress,
                    "erin",
                ),
                task(
                    "RECYCLE-002",
                    TaskKind::Recycle,
                    TaskStatus::InProgress,
                    "frank",
                ),
            ],
        );

        let recovered = store.recover_interrupted(&pool).unwrap();
        assert_eq!(recovered.len(), 2);
        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["PROV-004"].status, TaskStatus::Pending);
        assert_eq!(tasks["RECYCLE-002"].status, TaskStatus::Pending);
    }

    #[test]
    fn fail_stale_spares_current_and_recent_tasks() {
        let dir = TempDir::new().unwrap();
        let mut old = task(
            "PROV-010",
            TaskKind::Provisioning,
            TaskStatus::InProgress,
            "gus",
        );
        old.updated_at = Some((Utc::now() - Duration::minutes(90)).to_rfc3339());
        let mut current = task(
            "PROV-011",
            TaskKind::Provisioning,
            TaskStatus::InProgress,
            "hana",
        );
        current.updated_at = Some((Utc::now() - Duration::minutes(90)).to_rfc3339());
        let fresh = task(
            "PROV-012",
            TaskKind::Provisioning,
            TaskStatus::InProgress,
            "ivy",
        );
        let store = store_with_tasks(&dir, vec![old, current, fresh]);

        let failed = store
            .fail_stale("PROV-011", Duration::minutes(60))
            .unwrap();
        assert_eq!(failed, vec!["PROV-010".to_string()]);

        let tasks = store.snapshot().unwrap();
        assert_eq!(tasks["PROV-010"].status, TaskStatus::Failed);
        assert_eq!(tasks["PROV-011"].status, TaskStatus::InProgress);
        assert_eq!(tasks["PROV-012"].status, TaskStatus::InProgress);
    }
}
