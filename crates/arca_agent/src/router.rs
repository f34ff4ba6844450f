//! Customer routing updates.
//!
//! The traffic router reads `customerMappings` out of `src/middleware.ts`
//! in the arcamatrix repository, so publishing a route means committing to
//! that repo and pushing. The working tree is treated as a critical
//! section: `git pull --rebase` before the edit, `git checkout -- <file>`
//! to discard the edit on any later failure. A REST admin endpoint takes a
//! backup copy of every mapping change.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

const MIDDLEWARE_REL: &str = "src/middleware.ts";
const MAPPING_BLOCK_PATTERN: &str = "customerMappings: Record<string, string> = {";

/// Git-backed editor for the router mapping file.
#[derive(Debug, Clone)]
pub struct RouterRepo {
    repo_dir: PathBuf,
}

impl RouterRepo {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn middleware_path(&self) -> PathBuf {
        self.repo_dir.join(MIDDLEWARE_REL)
    }

    /// True when `git status --porcelain` reports nothing.
    pub fn is_clean(&self) -> Result<bool> {
        let status = self.git(&["status", "--porcelain"])?;
        Ok(status.trim().is_empty())
    }

    /// Throw away local state: `git reset --hard origin/main` + `git clean`.
    pub fn reset_hard(&self) -> Result<()> {
        self.git(&["fetch", "origin"])?;
        self.git(&["reset", "--hard", "origin/main"])?;
        self.git(&["clean", "-fd"])?;
        warn!("Router repo reset to origin/main");
        Ok(())
    }

    /// Whether the mapping file currently carries an entry for `username`.
    pub fn has_mapping(&self, username: &str) -> Result<bool> {
        let content = self.read_middleware()?;
        Ok(content.contains(&entry_key(username)))
    }

    /// Add `'username': 'sprite_url',` inside the mapping block and push.
    ///
    /// Idempotent: an existing entry is success without a commit. Returns
    /// whether a commit was made.
    pub fn add_mapping(&self, username: &str, sprite_url: &str) -> Result<bool> {
        self.git(&["pull", "--rebase"])?;

        let content = self.read_middleware()?;
        if content.contains(&entry_key(username)) {
            info!("Router mapping for {username} already present");
            return Ok(false);
        }

        let updated = insert_mapping(&content, username, sprite_url)
            .context("customerMappings block not found in middleware.ts")?;

        self.commit_edit(&updated, &format!("Add customer mapping for {username}"))?;
        info!("Router mapping added for {username} -> {sprite_url}");
        Ok(true)
    }

    /// Delete every line carrying `'username'` and push. A missing entry is
    /// a successful no-op. Returns whether a commit was made.
    pub fn remove_mapping(&self, username: &str) -> Result<bool> {
        self.git(&["pull", "--rebase"])?;

        let content = self.read_middleware()?;
        let updated = remove_mapping_lines(&content, username);
        if updated == content {
            info!("No router mapping for {username}; nothing to remove");
            return Ok(false);
        }

        self.commit_edit(&updated, &format!("Remove customer mapping for {username}"))?;
        info!("Router mapping removed for {username}");
        Ok(true)
    }

    /// Write the edited file, then add/commit/push; on any failure discard
    /// the local edit before propagating.
    fn commit_edit(&self, contents: &str, message: &str) -> Result<()> {
        let path = self.middleware_path();
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let pushed = self
            .git(&["add", MIDDLEWARE_REL])
            .and_then(|_| self.git(&["commit", "-m", message]))
            .and_then(|_| self.git(&["push"]));

        if let Err(err) = pushed {
            if let Err(rollback) = self.git(&["checkout", "--", MIDDLEWARE_REL]) {
                warn!("Rollback of middleware.ts failed: {rollback:#}");
            }
            return Err(err);
        }
        Ok(())
    }

    fn read_middleware(&self) -> Result<String> {
        let path = self.middleware_path();
        fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .with_context(|| format!("Failed to spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed in {}: {}",
                args.join(" "),
                self.repo_dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn entry_key(username: &str) -> String {
    format!("'{username}'")
}

/// Insert a mapping entry right before the closing brace of the
/// `customerMappings` block. Returns `None` when the block is absent.
fn insert_mapping(content: &str, username: &str, sprite_url: &str) -> Option<String> {
    let block_start = content.find(MAPPING_BLOCK_PATTERN)?;
    let after_block = block_start + MAPPING_BLOCK_PATTERN.len();
    let close_offset = content[after_block..].find('}')?;
    let insert_at = after_block + close_offset;

    // Back up past the indentation of the closing brace line. A brace on
    // the same line as the opener gets the entry inserted right before it.
    let line_start = match content[..insert_at].rfind('\n') {
        Some(idx) if idx + 1 > block_start => idx + 1,
        _ => insert_at,
    };

    let mut updated = String::with_capacity(content.len() + 64);
    updated.push_str(&content[..line_start]);
    if line_start == insert_at {
        updated.push_str(&format!("\n  '{username}': '{sprite_url}',\n"));
    } else {
        updated.push_str(&format!("  '{username}': '{sprite_url}',\n"));
    }
    updated.push_str(&content[line_start..]);
    Some(updated)
}

fn remove_mapping_lines(content: &str, username: &str) -> String {
    let key = entry_key(username);
    let mut lines: Vec<&str> = content
        .split_inclusive('\n')
        .filter(|line| !line.contains(&key))
        .collect();
    if lines.is_empty() {
        lines.push("");
    }
    lines.concat()
}

// ============================================================================
// REST admin backup
// ============================================================================

/// Backup channel: the router's admin endpoint accepts the same mapping
/// changes over REST, keyed by the admin secret.
pub struct RouterAdmin {
    api_base: String,
    admin_key: String,
    http: reqwest::blocking::Client,
}

impl RouterAdmin {
    pub fn new(api_base: impl Into<String>, admin_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            admin_key: admin_key.into(),
            http,
        })
    }

    pub fn add(&self, username: &str, sprite_url: &str, sprite_name: &str) -> Result<()> {
        self.post(serde_json::json!({
            "action": "add",
            "username": username,
            "spriteUrl": sprite_url,
            "spriteName": sprite_name,
            "adminKey": self.admin_key,
        }))
    }

    pub fn remove(&self, username: &str) -> Result<()> {
        self.post(serde_json::json!({
            "action": "remove",
            "username": username,
            "adminKey": self.admin_key,
        }))
    }

    fn post(&self, payload: serde_json::Value) -> Result<()> {
        let url = format!("{}/customer-proxy", self.api_base);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .context("customer-proxy request failed to send")?;
        if !response.status().is_success() {
            bail!("customer-proxy returned {}", response.status());
        }
        Ok(())
    }
}

impl std::fmt::Debug for RouterAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterAdmin")
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIDDLEWARE: &str = r#"import { NextResponse } from 'next/server';

const customerMappings: Record<string, string> = {
  'alice': 'https://arca-customer-001-bl4yi.sprites.app',
};

export function middleware(request) {
  return NextResponse.next();
}
"#;

    #[test]
    fn insert_places_entry_before_closing_brace() {
        let updated = insert_mapping(
            MIDDLEWARE,
            "bob",
            "https://arca-customer-002-bl4yi.sprites.app",
        )
        .unwrap();

        let alice = updated.find("'alice'").unwrap();
        let bob = updated.find("'bob'").unwrap();
        let close = updated.find("};").unwrap();
        assert!(alice < bob && bob < close);
        assert!(updated.contains(
            "  'bob': 'https://arca-customer-002-bl4yi.sprites.app',\n"
        ));
    }

    #[test]
    fn insert_fails_without_mapping_block() {
        assert!(insert_mapping("export {};", "bob", "https://x").is_none());
    }

    #[test]
    fn insert_handles_single_line_block() {
        let content = "const customerMappings: Record<string, string> = {};\n";
        let updated = insert_mapping(content, "bob", "https://x").unwrap();
        assert!(updated.contains("  'bob': 'https://x',\n};"));
    }

    #[test]
    fn remove_deletes_only_matching_lines() {
        let updated = remove_mapping_lines(MIDDLEWARE, "alice");
        assert!(!updated.contains("'alice'"));
        assert!(updated.contains("customerMappings"));
        assert!(updated.contains("export function middleware"));

        // 'ali' must not match 'alice''s entry
        let untouched = remove_mapping_lines(MIDDLEWARE, "ali");
        assert_eq!(untouched, MIDDLEWARE);
    }

    #[test]
    fn remove_absent_is_identity() {
        assert_eq!(remove_mapping_lines(MIDDLEWARE, "zoe"), MIDDLEWARE);
    }
}
