//! Arcamatrix provisioning agent library.
//!
//! The binary wires an [`Agent`] together from the configuration and hands
//! it to the dispatcher loop; everything else (patch engine, handlers,
//! router, mail, reconciler) works against the shared [`Agent`].

pub mod config;
pub mod dispatcher;
pub mod email;
pub mod handlers;
pub mod patch;
pub mod reconciler;
pub mod router;
pub mod watchdog;

use anyhow::Result;
use arca_sprites::SpritesClient;
use arca_store::{PatchLog, SpritePool, TaskStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub use config::{AgentConfig, Args};
pub use email::Mailer;
pub use router::{RouterAdmin, RouterRepo};

/// Everything a task needs, built once at startup.
#[derive(Debug)]
pub struct Agent {
    pub config: AgentConfig,
    pub pool: SpritePool,
    pub tasks: TaskStore,
    pub patch_log: PatchLog,
    pub client: SpritesClient,
    pub router: RouterRepo,
    pub admin: RouterAdmin,
    pub mailer: Mailer,
    expansion_running: AtomicBool,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let pool = SpritePool::open(&config.pool_file)?;
        let tasks = TaskStore::open(&config.task_file)?;
        let patch_log = PatchLog::open(&config.patch_log_file)?;
        let client = SpritesClient::new(&config.sprites_api_base, &config.sprites_token)?;
        let router = RouterRepo::new(&config.router_repo);
        let admin = RouterAdmin::new(&config.arcamatrix_api_base, &config.admin_key)?;
        let mailer = Mailer::new(&config.mail_api_base, &config.mail_key, &config.mail_from)?;
        Ok(Self {
            config,
            pool,
            tasks,
            patch_log,
            client,
            router,
            admin,
            mailer,
            expansion_running: AtomicBool::new(false),
        })
    }

    /// Kick off a background expansion toward `target_available`. At most
    /// one expansion runs at a time; a second request while one is in
    /// flight is dropped.
    pub fn spawn_expansion(self: &Arc<Self>, target_available: usize) {
        if self
            .expansion_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Pool expansion already in flight; not spawning another");
            return;
        }

        let agent = Arc::clone(self);
        std::thread::spawn(move || {
            if let Err(err) = handlers::expand::expand_to(&agent, target_available) {
                warn!("Background pool expansion failed: {err:#}");
            }
            agent.expansion_running.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_protocol::{PatchEvent, PatchPhase};

    #[test]
    fn agent_wires_all_stores_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let agent = Agent::new(config::test_config(dir.path())).unwrap();

        // The pool self-seeds on first open.
        let status = agent.pool.status().unwrap();
        assert_eq!(status.total, 10);

        // Task store starts out empty but readable.
        assert!(agent.tasks.snapshot().unwrap().is_empty());

        // Patch log is writable in place.
        agent
            .patch_log
            .record(PatchEvent {
                task_id: "PROV-001".into(),
                phase: PatchPhase::Pre,
                at: "2025-01-01T00:00:00Z".into(),
                patches: vec![],
                fixes: vec![],
            })
            .unwrap();
        assert_eq!(agent.patch_log.recent(10).unwrap().len(), 1);
    }
}
