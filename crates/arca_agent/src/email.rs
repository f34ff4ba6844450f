//! Welcome email over the transactional mail REST API.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Total send attempts, including the first.
const MAX_ATTEMPTS: usize = 3;

/// Backoff before the second and third attempt.
const BACKOFF_SECS: [u64; 2] = [5, 10];

/// Upper bound honored on a 429 `Retry-After`.
const RETRY_AFTER_CAP_SECS: u64 = 60;

const WELCOME_SUBJECT: &str = "Welcome to Arcamatrix - your workspace is ready";

/// What to do with a non-success mail response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long and try again.
    After(Duration),
    /// Client error that a retry cannot fix.
    Fatal,
}

/// Retry policy: 429 honors `Retry-After` (capped), other 4xx are final,
/// everything else backs off on the fixed schedule.
pub fn classify_failure(
    status: u16,
    retry_after_secs: Option<u64>,
    attempt: usize,
) -> RetryDecision {
    if status == 429 {
        let wait = retry_after_secs
            .unwrap_or_else(|| backoff_secs(attempt))
            .min(RETRY_AFTER_CAP_SECS);
        return RetryDecision::After(Duration::from_secs(wait));
    }
    if (400..500).contains(&status) {
        return RetryDecision::Fatal;
    }
    RetryDecision::After(Duration::from_secs(backoff_secs(attempt)))
}

fn backoff_secs(attempt: usize) -> u64 {
    BACKOFF_SECS
        .get(attempt)
        .copied()
        .unwrap_or(BACKOFF_SECS[BACKOFF_SECS.len() - 1])
}

/// Client for the mail API. `send_welcome` reports only a boolean: a lost
/// email is a partial success on the task, never a task failure.
pub struct Mailer {
    api_base: String,
    api_key: String,
    from: String,
    http: reqwest::blocking::Client,
}

impl Mailer {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from: from.into(),
            http,
        })
    }

    /// Send the welcome mail; true when the API accepted it.
    pub fn send_welcome(
        &self,
        to: &str,
        customer_name: &str,
        username: &str,
        customer_url: &str,
    ) -> bool {
        let html = welcome_html(customer_name, username, customer_url);
        match self.send(to, WELCOME_SUBJECT, &html) {
            Ok(()) => {
                info!("Welcome email sent to {to}");
                true
            }
            Err(err) => {
                warn!("Welcome email to {to} failed: {err:#}");
                false
            }
        }
    }

    fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let url = format!("{}/emails", self.api_base);
        let payload = serde_json::json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "html": html,
        });

        for attempt in 0..MAX_ATTEMPTS {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send();

            let decision = match response {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after = parse_retry_after(&response);
                    warn!("Mail API returned {status} (attempt {})", attempt + 1);
                    classify_failure(status, retry_after, attempt)
                }
                Err(err) => {
                    warn!("Mail API transport error (attempt {}): {err}", attempt + 1);
                    RetryDecision::After(Duration::from_secs(backoff_secs(attempt)))
                }
            };

            match decision {
                RetryDecision::Fatal => bail!("mail API rejected the request"),
                RetryDecision::After(wait) => {
                    if attempt + 1 == MAX_ATTEMPTS {
                        bail!("mail API still failing after {MAX_ATTEMPTS} attempts");
                    }
                    std::thread::sleep(wait);
                }
            }
        }
        unreachable!("send loop always returns")
    }
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer")
            .field("api_base", &self.api_base)
            .field("from", &self.from)
            .finish()
    }
}

fn parse_retry_after(response: &reqwest::blocking::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn welcome_html(customer_name: &str, username: &str, customer_url: &str) -> String {
    let display_name = if customer_name.is_empty() {
        username
    } else {
        customer_name
    };
    format!(
        r#"<html>
  <body style="font-family: sans-serif; color: #1a1a1a;">
    <h2>Welcome to Arcamatrix, {display_name}!</h2>
    <p>Your personal workspace is ready:</p>
    <p><a href="{customer_url}">{customer_url}</a></p>
    <p>Sign in with the username <strong>{username}</strong> and the
    credentials you chose at checkout.</p>
    <p>&mdash; The Arcamatrix team</p>
  </body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_honors_retry_after() {
        assert_eq!(
            classify_failure(429, Some(5), 0),
            RetryDecision::After(Duration::from_secs(5))
        );
    }

    #[test]
    fn rate_limit_wait_is_capped() {
        assert_eq!(
            classify_failure(429, Some(500), 0),
            RetryDecision::After(Duration::from_secs(60))
        );
    }

    #[test]
    fn rate_limit_without_header_uses_schedule() {
        assert_eq!(
            classify_failure(429, None, 1),
            RetryDecision::After(Duration::from_secs(10))
        );
    }

    #[test]
    fn client_errors_are_final() {
        assert_eq!(classify_failure(400, None, 0), RetryDecision::Fatal);
        assert_eq!(classify_failure(422, None, 0), RetryDecision::Fatal);
    }

    #[test]
    fn server_errors_follow_backoff_schedule() {
        assert_eq!(
            classify_failure(500, None, 0),
            RetryDecision::After(Duration::from_secs(5))
        );
        assert_eq!(
            classify_failure(503, None, 1),
            RetryDecision::After(Duration::from_secs(10))
        );
        // Past the schedule the last step repeats.
        assert_eq!(
            classify_failure(502, None, 5),
            RetryDecision::After(Duration::from_secs(10))
        );
    }

    #[test]
    fn welcome_html_mentions_workspace_url() {
        let html = welcome_html("Alice", "alice", "https://alice.arcamatrix.com");
        assert!(html.contains("https://alice.arcamatrix.com"));
        assert!(html.contains("Alice"));
    }
}
