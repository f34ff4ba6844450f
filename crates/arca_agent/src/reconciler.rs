//! Periodic health reconciliation of the sprite fleet.
//!
//! Assigned sprites must keep the customer proxy (8080) and gateway (3001)
//! listening; missing listeners get a `service start`. Unreachable sprites
//! are probed with a trivial exec and return to the pool once they answer.

use anyhow::Result;
use arca_protocol::defaults::{GATEWAY_PORT, GATEWAY_SERVICE, PROXY_PORT, PROXY_SERVICE};
use arca_protocol::SpriteStatus;
use arca_sprites::{strip_control_sequences, SpritesClient};
use arca_store::SpritePool;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// One reconciler sweep over the whole pool.
pub fn reconcile(pool: &SpritePool, client: &SpritesClient) -> Result<()> {
    let doc = pool.snapshot()?;
    let mut checked = 0usize;

    for (name, sprite) in &doc.sprites {
        match sprite.status {
            SpriteStatus::Assigned => {
                checked += 1;
                check_assigned(pool, client, name);
            }
            SpriteStatus::Unreachable => {
                probe_unreachable(pool, client, name);
            }
            SpriteStatus::Available => {}
        }
    }

    debug!("Reconciler sweep finished: {checked} assigned sprite(s) checked");
    Ok(())
}

fn check_assigned(pool: &SpritePool, client: &SpritesClient, name: &str) {
    let listeners = match client.exec(name, "ss -tlnp", &[], PROBE_TIMEOUT) {
        Ok(output) => strip_control_sequences(output.output()),
        Err(err) => {
            warn!("Sprite {name} did not answer the port audit: {err:#}");
            if let Err(err) = pool.mark_unreachable(name) {
                warn!("Failed to mark {name} unreachable: {err:#}");
            }
            return;
        }
    };

    for (port, service) in [(PROXY_PORT, PROXY_SERVICE), (GATEWAY_PORT, GATEWAY_SERVICE)] {
        if has_listen_port(&listeners, port) {
            continue;
        }
        warn!("Sprite {name}: port {port} not bound; starting {service}");
        if let Err(err) = client.exec(
            name,
            &format!("service start {service}"),
            &[],
            PROBE_TIMEOUT,
        ) {
            warn!("Failed to start {service} on {name}: {err:#}");
        }
    }
}

fn probe_unreachable(pool: &SpritePool, client: &SpritesClient, name: &str) {
    match client.exec(name, "echo ok", &[], PROBE_TIMEOUT) {
        Ok(output) if output.output().contains("ok") => {
            match pool.try_recover(name) {
                Ok(true) => info!("Sprite {name} answered the probe; recovered"),
                Ok(false) => {}
                Err(err) => warn!("Failed to recover {name}: {err:#}"),
            }
        }
        Ok(_) => debug!("Sprite {name} answered the probe without output"),
        Err(err) => debug!("Sprite {name} still unreachable: {err:#}"),
    }
}

/// Whether an `ss -tlnp` listing shows a listener on `port`. The leading
/// colon in the needle keeps e.g. 13001 from matching 3001.
pub fn has_listen_port(listing: &str, port: u16) -> bool {
    let needle = format!(":{port}");
    listing
        .lines()
        .filter(|line| line.contains("LISTEN"))
        .any(|line| {
            line.split_whitespace()
                .any(|field| field.ends_with(&needle))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS_OUTPUT: &str = "\
State   Recv-Q  Send-Q  Local Address:Port  Peer Address:Port  Process
LISTEN  0       128     0.0.0.0:8080        0.0.0.0:*          users:((\"python3\",pid=312,fd=5))
LISTEN  0       128     127.0.0.1:13001     0.0.0.0:*          users:((\"node\",pid=290,fd=18))
LISTEN  0       4096    [::]:22             [::]:*              users:((\"sshd\",pid=101,fd=4))
";

    #[test]
    fn finds_bound_proxy_port() {
        assert!(has_listen_port(SS_OUTPUT, 8080));
    }

    #[test]
    fn missing_gateway_port_is_detected() {
        // 13001 must not count as 3001
        assert!(!has_listen_port(SS_OUTPUT, 3001));
    }

    #[test]
    fn unrelated_ports_do_not_match() {
        assert!(has_listen_port(SS_OUTPUT, 22));
        assert!(!has_listen_port(SS_OUTPUT, 80));
    }
}
