//! The sprite pool: a single JSON document holding every managed sprite and
//! the customer assignment index.
//!
//! Both maps live in one file so a crash can never split them across two
//! documents, and the sprite records are authoritative: before any mutation
//! the index is reconciled against them ("healing"). All mutations run under
//! an exclusive advisory lock on the file itself.

use anyhow::{Context, Result};
use arca_protocol::defaults::{POOL_MIN_AVAILABLE, SEED_POOL_SIZE, SPRITE_NAME_PREFIX};
use arca_protocol::naming::{canonical_sprite_url, canonicalize_sprite_url};
use arca_protocol::{Assignment, PoolDocument, PoolStatus, SpriteRecord, SpriteStatus};
use chrono::Utc;
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::lock::LockedFile;

/// Handle to the on-disk pool document.
#[derive(Debug, Clone)]
pub struct SpritePool {
    path: PathBuf,
}

impl SpritePool {
    /// Open the pool at `path`, seeding a fresh document on first use.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create pool directory {}", parent.display()))?;
        }
        if !path.exists() {
            write_atomic(&path, &seed_document())?;
            info!(
                "Seeded sprite pool with {} sprites at {}",
                SEED_POOL_SIZE,
                path.display()
            );
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assign an available sprite to a customer.
    ///
    /// Idempotent: a username that already holds a sprite gets that sprite
    /// back. Selection walks the map in insertion order, so test scenarios
    /// are reproducible. Returns `None` when the pool is depleted.
    pub fn assign(
        &self,
        username: &str,
        customer_email: &str,
        customer_name: &str,
    ) -> Result<Option<Assignment>> {
        self.mutate(|doc| {
            if let Some(existing) = doc.assignments.get(username) {
                if let Some(sprite) = doc.sprites.get(existing) {
                    debug!("assign({username}): already holds {existing}");
                    return Some(Assignment {
                        sprite_name: existing.clone(),
                        sprite_url: sprite.sprite_url.clone(),
                    });
                }
            }

            let now = Utc::now().to_rfc3339();
            for (name, sprite) in doc.sprites.iter_mut() {
                if sprite.status != SpriteStatus::Available {
                    continue;
                }
                sprite.status = SpriteStatus::Assigned;
                sprite.assigned_to = Some(username.to_string());
                sprite.assigned_at = Some(now.clone());
                sprite.customer_email = Some(customer_email.to_string());
                sprite.customer_name = Some(customer_name.to_string());
                doc.assignments
                    .insert(username.to_string(), name.clone());
                info!("Assigned sprite {name} to {username}");
                return Some(Assignment {
                    sprite_name: name.clone(),
                    sprite_url: sprite.sprite_url.clone(),
                });
            }
            None
        })
    }

    /// Return a customer's sprite to the pool, clearing its customer
    /// attributes. Returns false when the user holds nothing.
    pub fn release(&self, username: &str) -> Result<bool> {
        self.mutate(|doc| {
            let Some(sprite_name) = doc.assignments.shift_remove(username) else {
                return false;
            };
            if let Some(sprite) = doc.sprites.get_mut(&sprite_name) {
                sprite.clear_assignment();
            }
            info!("Released sprite {sprite_name} from {username}");
            true
        })
    }

    /// Look up a customer's sprite. Lock-free snapshot read; falls back to
    /// scanning the sprite records when the index entry is missing.
    pub fn get(&self, username: &str) -> Result<Option<Assignment>> {
        let doc = self.snapshot()?;
        if let Some(name) = doc.assignments.get(username) {
            if let Some(sprite) = doc.sprites.get(name) {
                return Ok(Some(Assignment {
                    sprite_name: name.clone(),
                    sprite_url: sprite.sprite_url.clone(),
                }));
            }
            return Ok(None);
        }
        for (name, sprite) in &doc.sprites {
            if sprite.status == SpriteStatus::Assigned
                && sprite.assigned_to.as_deref() == Some(username)
            {
                return Ok(Some(Assignment {
                    sprite_name: name.clone(),
                    sprite_url: sprite.sprite_url.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Pool counters. Lock-free snapshot read.
    pub fn status(&self) -> Result<PoolStatus> {
        let doc = self.snapshot()?;
        let available = doc
            .sprites
            .values()
            .filter(|s| s.status == SpriteStatus::Available)
            .count();
        let assigned = doc
            .sprites
            .values()
            .filter(|s| s.status == SpriteStatus::Assigned)
            .count();
        Ok(PoolStatus {
            total: doc.sprites.len(),
            available,
            assigned,
            needs_expansion: available < POOL_MIN_AVAILABLE,
        })
    }

    /// Add a freshly created sprite to the pool as available.
    pub fn add(&self, name: &str, sprite_url: &str) -> Result<()> {
        let url = canonicalize_sprite_url(sprite_url);
        self.mutate(|doc| {
            doc.sprites.insert(
                name.to_string(),
                SpriteRecord::available(Utc::now().to_rfc3339(), url.clone()),
            );
            info!("Added sprite {name} to pool");
        })
    }

    /// Take a sprite out of rotation after a failed liveness probe.
    pub fn mark_unreachable(&self, name: &str) -> Result<()> {
        self.mutate(|doc| {
            if let Some(sprite) = doc.sprites.get_mut(name) {
                sprite.status = SpriteStatus::Unreachable;
                sprite.unreachable_since = Some(Utc::now().to_rfc3339());
                warn!("Sprite {name} marked unreachable");
            }
        })
    }

    /// Return an unreachable sprite to `available`. Returns false when the
    /// sprite is missing or not unreachable.
    pub fn try_recover(&self, name: &str) -> Result<bool> {
        self.mutate(|doc| {
            match doc.sprites.get_mut(name) {
                Some(sprite) if sprite.status == SpriteStatus::Unreachable => {
                    sprite.status = SpriteStatus::Available;
                    sprite.unreachable_since = None;
                    info!("Sprite {name} recovered, back in pool");
                    true
                }
                _ => false,
            }
        })
    }

    /// Unlocked snapshot of the whole document. Callers must treat the
    /// result as a point-in-time view.
    pub fn snapshot(&self) -> Result<PoolDocument> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read pool file {}", self.path.display()))?;
        let mut doc = parse_document(&content)
            .with_context(|| format!("Corrupt pool file {}", self.path.display()))?;
        heal(&mut doc);
        Ok(doc)
    }

    /// Locked read-heal-mutate-write cycle shared by every mutating call.
    fn mutate<T>(&self, op: impl FnOnce(&mut PoolDocument) -> T) -> Result<T> {
        let mut locked = LockedFile::acquire(&self.path)?;
        let content = locked.read_to_string()?;
        let mut doc = parse_document(&content)
            .with_context(|| format!("Corrupt pool file {}", self.path.display()))?;

        let corrections = heal(&mut doc);
        if corrections > 0 {
            warn!(
                "Pool healed: {corrections} correction(s) between sprite records and assignments"
            );
        }

        let out = op(&mut doc);

        let payload =
            serde_json::to_vec_pretty(&doc).context("Failed to serialize pool document")?;
        locked.replace_contents(&payload)?;
        Ok(out)
    }
}

/// Reconcile the assignment index with the sprite records (the records win)
/// and canonicalize sprite URLs. Returns the number of changes. Idempotent.
pub fn heal(doc: &mut PoolDocument) -> usize {
    let mut changes = 0;

    for sprite in doc.sprites.values_mut() {
        let canonical = canonicalize_sprite_url(&sprite.sprite_url);
        if canonical != sprite.sprite_url {
            sprite.sprite_url = canonical;
            changes += 1;
        }
    }

    let actual: IndexMap<String, String> = doc
        .sprites
        .iter()
        .filter(|(_, s)| s.status == SpriteStatus::Assigned)
        .filter_map(|(name, s)| {
            s.assigned_to
                .as_ref()
                .map(|user| (user.clone(), name.clone()))
        })
        .collect();

    let before = doc.assignments.len();
    doc.assignments
        .retain(|user, name| actual.get(user) == Some(&*name));
    changes += before - doc.assignments.len();

    for (user, name) in actual {
        if !doc.assignments.contains_key(&user) {
            doc.assignments.insert(user, name);
            changes += 1;
        }
    }

    changes
}

fn parse_document(content: &str) -> Result<PoolDocument> {
    if content.trim().is_empty() {
        return Ok(PoolDocument::default());
    }
    serde_json::from_str(content).map_err(Into::into)
}

fn seed_document() -> PoolDocument {
    let now = Utc::now().to_rfc3339();
    let mut doc = PoolDocument::default();
    for i in 1..=SEED_POOL_SIZE {
        let name = format!("{SPRITE_NAME_PREFIX}{i:03}");
        let url = canonical_sprite_url(&name);
        doc.sprites
            .insert(name, SpriteRecord::available(now.clone(), url));
    }
    doc
}

/// Initial write without a lock held yet: write a sibling `.tmp` file and
/// rename it into place so readers never see a partial seed.
fn write_atomic(path: &Path, doc: &PoolDocument) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(doc).context("Failed to serialize pool document")?;
    fs::write(&tmp, payload)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_in(dir: &TempDir) -> SpritePool {
        SpritePool::open(dir.path().join("sprite_pool.json")).unwrap()
    }

    #[test]
    fn seeds_ten_available_sprites() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);
        let status = pool.status().unwrap();
        assert_eq!(status.total, 10);
        assert_eq!(status.available, 10);
        assert_eq!(status.assigned, 0);
        assert!(!status.needs_expansion);

        let doc = pool.snapshot().unwrap();
        let first = doc.sprites.keys().next().unwrap();
        assert_eq!(first, "arca-customer-001");
        assert_eq!(
            doc.sprites[first].sprite_url,
            "https://arca-customer-001-bl4yi.sprites.app"
        );
    }

    #[test]
    fn assign_picks_first_available_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);

        let a = pool.assign("alice", "a@x.io", "A").unwrap().unwrap();
        assert_eq!(a.sprite_name, "arca-customer-001");
        let b = pool.assign("bob", "b@x.io", "B").unwrap().unwrap();
        assert_eq!(b.sprite_name, "arca-customer-002");
    }

    #[test]
    fn assign_is_idempotent_per_username() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);

        let first = pool.assign("carol", "c@x.io", "C").unwrap().unwrap();
        let doc_after_first = pool.snapshot().unwrap();
        let assigned_at = doc_after_first.sprites[&first.sprite_name]
            .assigned_at
            .clone();

        let second = pool.assign("carol", "c@x.io", "C").unwrap().unwrap();
        assert_eq!(first, second);

        // The retry must not rewrite the assignment timestamp.
        let doc = pool.snapshot().unwrap();
        assert_eq!(doc.sprites[&first.sprite_name].assigned_at, assigned_at);
        assert_eq!(pool.status().unwrap().assigned, 1);
    }

    #[test]
    fn release_clears_customer_attributes() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);

        let a = pool.assign("dave", "d@x.io", "D").unwrap().unwrap();
        assert!(pool.release("dave").unwrap());
        assert!(!pool.release("dave").unwrap());

        let doc = pool.snapshot().unwrap();
        let sprite = &doc.sprites[&a.sprite_name];
        assert_eq!(sprite.status, SpriteStatus::Available);
        assert!(sprite.assigned_to.is_none());
        assert!(sprite.customer_email.is_none());
        assert!(doc.assignments.get("dave").is_none());

        // assign -> release -> assign keeps the pool size stable
        assert!(pool.assign("dave", "d@x.io", "D").unwrap().is_some());
        assert_eq!(pool.status().unwrap().total, 10);
    }

    #[test]
    fn assign_returns_none_when_depleted() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);
        for i in 0..10 {
            assert!(pool
                .assign(&format!("user{i}"), "u@x.io", "U")
                .unwrap()
                .is_some());
        }
        assert!(pool.assign("late", "l@x.io", "L").unwrap().is_none());
    }

    #[test]
    fn needs_expansion_below_three_available() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);
        for i in 0..7 {
            pool.assign(&format!("user{i}"), "u@x.io", "U").unwrap();
        }
        assert!(!pool.status().unwrap().needs_expansion); // 3 left
        pool.assign("user7", "u@x.io", "U").unwrap();
        assert!(pool.status().unwrap().needs_expansion); // 2 left
    }

    #[test]
    fn heal_rebuilds_index_from_sprite_records() {
        let mut doc = PoolDocument::default();
        let mut assigned = SpriteRecord::available(
            "2025-01-01T00:00:00Z".into(),
            "https://arca-customer-001-bl4yi.sprites.app".into(),
        );
        assigned.status = SpriteStatus::Assigned;
        assigned.assigned_to = Some("eve".into());
        doc.sprites.insert("arca-customer-001".into(), assigned);
        doc.sprites.insert(
            "arca-customer-002".into(),
            SpriteRecord::available(
                "2025-01-01T00:00:00Z".into(),
                "https://arca-customer-002-bl4yi.sprites.app".into(),
            ),
        );
        // Stale entry for a user whose sprite is no longer assigned, and a
        // missing entry for eve.
        doc.assignments
            .insert("ghost".into(), "arca-customer-002".into());

        let changes = heal(&mut doc);
        assert_eq!(changes, 2);
        assert_eq!(
            doc.assignments.get("eve"),
            Some(&"arca-customer-001".to_string())
        );
        assert!(doc.assignments.get("ghost").is_none());

        // Idempotent: a second pass changes nothing.
        assert_eq!(heal(&mut doc), 0);
    }

    #[test]
    fn heal_canonicalizes_dotted_urls() {
        let mut doc = PoolDocument::default();
        doc.sprites.insert(
            "arca-customer-001".into(),
            SpriteRecord::available(
                "2025-01-01T00:00:00Z".into(),
                "https://arca-customer-001.bl4yi.sprites.app".into(),
            ),
        );
        heal(&mut doc);
        assert_eq!(
            doc.sprites["arca-customer-001"].sprite_url,
            "https://arca-customer-001-bl4yi.sprites.app"
        );
    }

    #[test]
    fn concurrent_assign_for_same_user_agrees() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sprite_pool.json");
        SpritePool::open(&path).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let pool = SpritePool::open(&path).unwrap();
                    pool.assign("carol", "c@x.io", "C").unwrap().unwrap()
                })
            })
            .collect();

        let results: Vec<Assignment> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);

        let pool = SpritePool::open(&path).unwrap();
        assert_eq!(pool.status().unwrap().assigned, 1);
    }

    #[test]
    fn recover_only_applies_to_unreachable_sprites() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);

        assert!(!pool.try_recover("arca-customer-001").unwrap());
        pool.mark_unreachable("arca-customer-001").unwrap();

        let doc = pool.snapshot().unwrap();
        assert_eq!(
            doc.sprites["arca-customer-001"].status,
            SpriteStatus::Unreachable
        );
        assert!(doc.sprites["arca-customer-001"].unreachable_since.is_some());

        assert!(pool.try_recover("arca-customer-001").unwrap());
        let doc = pool.snapshot().unwrap();
        assert_eq!(
            doc.sprites["arca-customer-001"].status,
            SpriteStatus::Available
        );
        assert!(doc.sprites["arca-customer-001"].unreachable_since.is_none());
    }
}
