//! The typed HTTP client.

use anyhow::{Context, Result};
use arca_protocol::naming::{canonical_sprite_url, canonicalize_sprite_url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::text::strip_control_sequences;

/// Connect/read timeout applied when a call does not pass its own.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sprite creation can be slow on the control plane side.
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    url: Option<String>,
}

/// Result of an exec call. The endpoint returns JSON when the command
/// finishes cleanly; otherwise the raw text is wrapped as `{output: text}`.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub body: serde_json::Value,
}

impl ExecOutput {
    /// The command's textual output, empty when the response carried none.
    pub fn output(&self) -> &str {
        self.body
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

/// Bearer-authenticated client for the Sprites API.
///
/// Does not retry: transient failures surface as errors and the calling
/// handler decides whether the operation is worth repeating.
pub struct SpritesClient {
    base_url: String,
    token: String,
    http: reqwest::blocking::Client,
}

impl SpritesClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }

    /// Cheap reachability probe against the list endpoint.
    pub fn is_reachable(&self) -> bool {
        let url = format!("{}/sprites", self.base_url);
        match self.http.get(&url).bearer_auth(&self.token).send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("Sprites API unreachable: {err}");
                false
            }
        }
    }

    /// Create a sprite and return its public URL. The response's `url` is
    /// canonicalized; a missing `url` falls back to the canonical template.
    pub fn create(&self, name: &str) -> Result<String> {
        let url = format!("{}/sprites", self.base_url);
        let payload = serde_json::json!({
            "name": name,
            "url_settings": { "auth": "public" },
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(CREATE_TIMEOUT)
            .json(&payload)
            .send()
            .with_context(|| format!("Failed to create sprite {name}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Sprite create for {name} returned {status}: {body}");
        }

        let created: CreateResponse = response
            .json()
            .context("Failed to parse sprite create response")?;
        Ok(created
            .url
            .map(|u| canonicalize_sprite_url(&u))
            .unwrap_or_else(|| canonical_sprite_url(name)))
    }

    /// Write raw bytes to a path inside the sprite, creating intermediate
    /// directories.
    pub fn write_file(&self, sprite: &str, contents: &[u8], remote_path: &str) -> Result<()> {
        let url = format!("{}/sprites/{sprite}/fs/write", self.base_url);
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .query(&[("path", remote_path), ("mkdir", "true")])
            .body(contents.to_vec())
            .send()
            .with_context(|| format!("Failed to write {remote_path} on {sprite}"))?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("File write of {remote_path} on {sprite} returned {status}");
        }
        debug!("Wrote {} bytes to {sprite}:{remote_path}", contents.len());
        Ok(())
    }

    /// Run `bash -c <script>` on the sprite with optional env vars.
    pub fn exec(
        &self,
        sprite: &str,
        script: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let url = format!("{}/sprites/{sprite}/exec", self.base_url);

        let mut query: Vec<(&str, String)> = vec![
            ("cmd", "bash".to_string()),
            ("cmd", "-c".to_string()),
            ("cmd", script.to_string()),
        ];
        for (key, value) in env {
            query.push(("env", format!("{key}={value}")));
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .query(&query)
            .timeout(timeout)
            .send()
            .with_context(|| format!("Exec on {sprite} failed to send"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Exec on {sprite} returned {status}: {body}");
        }

        let text = response
            .text()
            .with_context(|| format!("Exec on {sprite}: failed to read response"))?;
        let body = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) => json,
            Err(_) => {
                let cleaned = strip_control_sequences(&text);
                warn!("Exec on {sprite} returned non-JSON output ({} bytes)", text.len());
                serde_json::json!({ "output": cleaned })
            }
        };
        Ok(ExecOutput { body })
    }
}

impl std::fmt::Debug for SpritesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpritesClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_reads_output_field() {
        let out = ExecOutput {
            body: serde_json::json!({ "output": "LISTEN 8080", "exit_code": 0 }),
        };
        assert_eq!(out.output(), "LISTEN 8080");

        let empty = ExecOutput {
            body: serde_json::json!({ "exit_code": 0 }),
        };
        assert_eq!(empty.output(), "");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = SpritesClient::new("https://api.sprites.dev/v1/", "tok").unwrap();
        assert_eq!(client.base_url, "https://api.sprites.dev/v1");
    }
}
