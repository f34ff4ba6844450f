//! Ring-buffered log of pre/post patch events.

use anyhow::{Context, Result};
use arca_protocol::defaults::PATCH_LOG_CAPACITY;
use arca_protocol::PatchEvent;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::lock::LockedFile;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PatchLogDocument {
    #[serde(default)]
    events: Vec<PatchEvent>,
}

/// Append-only record of what the self-healing wrapper did, capped to the
/// most recent [`PATCH_LOG_CAPACITY`] events.
#[derive(Debug, Clone)]
pub struct PatchLog {
    path: PathBuf,
}

impl PatchLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create patch log directory {}", parent.display())
            })?;
        }
        Ok(Self { path })
    }

    pub fn record(&self, event: PatchEvent) -> Result<()> {
        let mut locked = LockedFile::acquire(&self.path)?;
        let content = locked.read_to_string()?;
        let mut doc: PatchLogDocument = if content.trim().is_empty() {
            PatchLogDocument::default()
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Corrupt patch log {}", self.path.display()))?
        };

        doc.events.push(event);
        if doc.events.len() > PATCH_LOG_CAPACITY {
            let overflow = doc.events.len() - PATCH_LOG_CAPACITY;
            doc.events.drain(..overflow);
        }

        let payload = serde_json::to_vec_pretty(&doc).context("Failed to serialize patch log")?;
        locked.replace_contents(&payload)?;
        Ok(())
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<PatchEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read patch log {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: PatchLogDocument = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt patch log {}", self.path.display()))?;
        let skip = doc.events.len().saturating_sub(limit);
        Ok(doc.events.into_iter().skip(skip).collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_protocol::{PatchPhase, PrePatch};
    use chrono::Utc;
    use tempfile::TempDir;

    fn event(task_id: &str) -> PatchEvent {
        PatchEvent {
            task_id: task_id.to_string(),
            phase: PatchPhase::Pre,
            at: Utc::now().to_rfc3339(),
            patches: vec![PrePatch::GitReset],
            fixes: vec![],
        }
    }

    #[test]
    fn records_and_reads_back_in_order() {
        let dir = TempDir::new().unwrap();
        let log = PatchLog::open(dir.path().join("patch_log.json")).unwrap();

        log.record(event("PROV-001")).unwrap();
        log.record(event("PROV-002")).unwrap();

        let events = log.recent(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].task_id, "PROV-001");
        assert_eq!(events[1].task_id, "PROV-002");
    }

    #[test]
    fn ring_buffer_drops_oldest_beyond_capacity() {
        let dir = TempDir::new().unwrap();
        let log = PatchLog::open(dir.path().join("patch_log.json")).unwrap();

        for i in 0..(PATCH_LOG_CAPACITY + 5) {
            log.record(event(&format!("PROV-{i:03}"))).unwrap();
        }

        let events = log.recent(usize::MAX).unwrap();
        assert_eq!(events.len(), PATCH_LOG_CAPACITY);
        assert_eq!(events[0].task_id, "PROV-005");
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = PatchLog::open(dir.path().join("patch_log.json")).unwrap();
        assert!(log.recent(10).unwrap().is_empty());
    }
}
