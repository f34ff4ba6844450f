//! Cron watchdog installed on sprites whose customer services keep dying.

use anyhow::{Context, Result};
use arca_protocol::defaults::{GATEWAY_SERVICE, PROXY_SERVICE};
use arca_sprites::SpritesClient;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::Duration;
use tracing::info;

const WATCHDOG_REMOTE_B64: &str = "/home/sprite/watchdog.sh.b64";
const WATCHDOG_REMOTE_PATH: &str = "/home/sprite/watchdog.sh";
const WATCHDOG_LOG: &str = "/home/sprite/watchdog.log";
const CRON_SCHEDULE: &str = "*/2 * * * *";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

/// The script cron runs every two minutes: restart the proxy and gateway
/// processes when they are not running.
pub fn watchdog_script() -> String {
    format!(
        r#"#!/bin/bash
# Keeps the customer proxy and gateway alive between agent reconciler runs.
LOG={WATCHDOG_LOG}
if ! pgrep -f customer_ui.py >/dev/null; then
  echo "$(date -u +%FT%TZ) restarting {PROXY_SERVICE}" >> "$LOG"
  service start {PROXY_SERVICE} >> "$LOG" 2>&1 || true
fi
if ! pgrep -f 'openclaw gateway' >/dev/null; then
  echo "$(date -u +%FT%TZ) restarting {GATEWAY_SERVICE}" >> "$LOG"
  service start {GATEWAY_SERVICE} >> "$LOG" 2>&1 || true
fi
"#
    )
}

/// Install the watchdog on a sprite: ship the script base64-encoded, decode
/// it in place, mark it executable and register the crontab line. Safe to
/// run repeatedly; the crontab line is only added once.
pub fn install(client: &SpritesClient, sprite: &str) -> Result<()> {
    let encoded = BASE64.encode(watchdog_script());
    client
        .write_file(sprite, encoded.as_bytes(), WATCHDOG_REMOTE_B64)
        .with_context(|| format!("Failed to upload watchdog to {sprite}"))?;

    let install_cmd = format!(
        "base64 -d {WATCHDOG_REMOTE_B64} > {WATCHDOG_REMOTE_PATH} \
         && chmod +x {WATCHDOG_REMOTE_PATH} \
         && rm -f {WATCHDOG_REMOTE_B64} \
         && ((crontab -l 2>/dev/null | grep -qF {WATCHDOG_REMOTE_PATH}) \
             || (crontab -l 2>/dev/null; echo '{CRON_SCHEDULE} {WATCHDOG_REMOTE_PATH}') | crontab -)"
    );
    client
        .exec(sprite, &install_cmd, &[], INSTALL_TIMEOUT)
        .with_context(|| format!("Failed to install watchdog on {sprite}"))?;

    info!("Watchdog installed on {sprite}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_restarts_both_services() {
        let script = watchdog_script();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("service start proxy"));
        assert!(script.contains("service start gateway"));
        assert!(script.contains(WATCHDOG_LOG));
    }

    #[test]
    fn script_survives_base64_round_trip() {
        let script = watchdog_script();
        let encoded = BASE64.encode(&script);
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), script);
    }
}
