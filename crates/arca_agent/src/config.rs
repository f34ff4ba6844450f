//! Agent configuration.
//!
//! Everything the agent needs - endpoints, credentials, file paths - is
//! resolved once at startup into an immutable [`AgentConfig`] and threaded
//! by reference into the components. Secrets come from the environment so
//! they never appear in process listings.

use arca_protocol::defaults::{
    DEFAULT_ARCAMATRIX_API_BASE, DEFAULT_MAIL_API_BASE, DEFAULT_SPRITES_API_BASE,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "arca-agent", about = "Arcamatrix sprite provisioning agent")]
pub struct Args {
    /// Sprites control plane base URL
    #[arg(long, default_value = DEFAULT_SPRITES_API_BASE)]
    pub sprites_api: String,

    /// Sprites API bearer token
    #[arg(long, env = "SPRITES_API_TOKEN", hide_env_values = true)]
    pub sprites_token: String,

    /// Arcamatrix REST base (router admin endpoint)
    #[arg(long, default_value = DEFAULT_ARCAMATRIX_API_BASE)]
    pub arcamatrix_api: String,

    /// Admin key for the router REST endpoint
    #[arg(long, env = "ARCAMATRIX_ADMIN_KEY", hide_env_values = true)]
    pub admin_key: String,

    /// Transactional mail API base URL
    #[arg(long, default_value = DEFAULT_MAIL_API_BASE)]
    pub mail_api: String,

    /// Transactional mail API key
    #[arg(long, env = "RESEND_API_KEY", hide_env_values = true)]
    pub mail_key: String,

    /// From address on welcome mail
    #[arg(long, default_value = "Arcamatrix <onboarding@arcamatrix.com>")]
    pub mail_from: String,

    /// Sprite pool document
    #[arg(long, default_value = "/home/sprite/blackboard/sprite_pool.json")]
    pub pool_file: PathBuf,

    /// Task document written by the checkout intake
    #[arg(long, default_value = "/home/sprite/swarm-orchestrator/blackboard/tasks.json")]
    pub task_file: PathBuf,

    /// Patch log document
    #[arg(long, default_value = "/home/sprite/blackboard/patch_log.json")]
    pub patch_log_file: PathBuf,

    /// Local checkout of the arcamatrix repository (router mapping lives in
    /// src/middleware.ts)
    #[arg(long, default_value = "/home/sprite/arcamatrix")]
    pub router_repo: PathBuf,

    /// Directory holding the provisioning assets uploaded to sprites
    #[arg(long, default_value = "/home/sprite")]
    pub assets_dir: PathBuf,
}

/// Immutable resolved configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub sprites_api_base: String,
    pub sprites_token: String,
    pub arcamatrix_api_base: String,
    pub admin_key: String,
    pub mail_api_base: String,
    pub mail_key: String,
    pub mail_from: String,
    pub pool_file: PathBuf,
    pub task_file: PathBuf,
    pub patch_log_file: PathBuf,
    pub router_repo: PathBuf,
    pub assets_dir: PathBuf,
}

impl From<Args> for AgentConfig {
    fn from(args: Args) -> Self {
        Self {
            sprites_api_base: args.sprites_api,
            sprites_token: args.sprites_token,
            arcamatrix_api_base: args.arcamatrix_api,
            admin_key: args.admin_key,
            mail_api_base: args.mail_api,
            mail_key: args.mail_key,
            mail_from: args.mail_from,
            pool_file: args.pool_file,
            task_file: args.task_file,
            patch_log_file: args.patch_log_file,
            router_repo: args.router_repo,
            assets_dir: args.assets_dir,
        }
    }
}

impl AgentConfig {
    /// Local copy of the customer provisioning script.
    pub fn provision_script_local(&self) -> PathBuf {
        self.assets_dir.join("provision_customer.sh")
    }

    /// Local copy of the pool-sprite prepare script.
    pub fn prepare_script_local(&self) -> PathBuf {
        self.assets_dir.join("prepare_pool_sprite.sh")
    }

    /// Local copy of the customer UI page (optional upload).
    pub fn custom_ui_local(&self) -> PathBuf {
        self.assets_dir.join("arcamatrix-ui.html")
    }

    /// Local copy of the customer proxy script (optional upload).
    pub fn proxy_script_local(&self) -> PathBuf {
        self.assets_dir.join("customer_ui.py")
    }

    /// The router mapping file inside the repo checkout.
    pub fn middleware_path(&self) -> PathBuf {
        self.router_repo.join("src").join("middleware.ts")
    }
}

/// Log the non-secret configuration once at startup.
pub fn log_config(config: &AgentConfig) {
    tracing::info!("  Sprites API: {}", config.sprites_api_base);
    tracing::info!("  Arcamatrix API: {}", config.arcamatrix_api_base);
    tracing::info!("  Pool file: {}", config.pool_file.display());
    tracing::info!("  Task file: {}", config.task_file.display());
    tracing::info!("  Router repo: {}", config.router_repo.display());
    tracing::info!("  Assets dir: {}", config.assets_dir.display());
}

#[cfg(test)]
pub(crate) fn test_config(root: &std::path::Path) -> AgentConfig {
    AgentConfig {
        sprites_api_base: "http://127.0.0.1:9".into(),
        sprites_token: "test-token".into(),
        arcamatrix_api_base: "http://127.0.0.1:9/api".into(),
        admin_key: "test-admin".into(),
        mail_api_base: "http://127.0.0.1:9".into(),
        mail_key: "test-mail".into(),
        mail_from: "Arcamatrix <onboarding@arcamatrix.test>".into(),
        pool_file: root.join("sprite_pool.json"),
        task_file: root.join("tasks.json"),
        patch_log_file: root.join("patch_log.json"),
        router_repo: root.join("arcamatrix"),
        assets_dir: root.join("assets"),
    }
}
