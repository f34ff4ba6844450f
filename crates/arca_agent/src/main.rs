//! arca-agent: customer sprite provisioning and recycling daemon.
//!
//! Usage:
//!     arca-agent --pool-file /home/sprite/blackboard/sprite_pool.json
//!
//! Credentials come from SPRITES_API_TOKEN, ARCAMATRIX_ADMIN_KEY and
//! RESEND_API_KEY. The process runs until SIGTERM/SIGINT and exits 0.

use anyhow::Result;
use arca_agent::{dispatcher, Agent, AgentConfig, Args};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

fn main() -> Result<()> {
    let args = Args::parse();
    arca_logging::init_logging("arca-agent")?;

    let config = AgentConfig::from(args);
    let agent = Arc::new(Agent::new(config)?);

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&shutdown))?;

    dispatcher::run(&agent, &shutdown)?;

    info!("Agent stopped");
    Ok(())
}

fn install_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("Received signal {sig}, initiating shutdown...");
            shutdown.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
}
