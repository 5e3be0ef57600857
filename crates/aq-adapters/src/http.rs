use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

use crate::AdapterError;

/// Rate limits, timeouts and upstream 5xx (Anthropic's 529 "overloaded"
/// included) are worth another attempt; auth and request errors are not.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Whole-second `Retry-After`, as Gmail and Anthropic send it on 429.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (0-based): the server's hint when it
    /// gave one, else doubling from `base_delay`. Never above `max_delay`.
    pub fn wait(&self, retry: usize, hint: Option<Duration>) -> Duration {
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|r| 1u32.checked_shl(r))
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor));
        hint.unwrap_or(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: format!("applyquest/{}", env!("CARGO_PKG_VERSION")),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout = std::env::var("AQ_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        Self { timeout, ..defaults }
    }

    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .context("building reqwest client")
    }
}

/// Sends the request built by `build`, retrying transient statuses and
/// transport errors per `backoff`. Non-success final responses become
/// [`AdapterError::HttpStatus`].
pub async fn send_with_retry<F>(
    backoff: &BackoffPolicy,
    build: F,
) -> Result<Response, AdapterError>
where
    F: Fn() -> RequestBuilder,
{
    let mut retry = 0;
    loop {
        let can_retry = retry < backoff.max_retries;
        let hint = match build().send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) if can_retry && is_transient_status(resp.status()) => {
                warn!(status = resp.status().as_u16(), retry, "upstream busy; retrying");
                retry_after(resp.headers())
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let url = resp.url().to_string();
                let body = resp.text().await.unwrap_or_default();
                return Err(AdapterError::HttpStatus { status, url, body });
            }
            Err(err) if can_retry && is_transient_transport(&err) => {
                warn!(error = %err, retry, "upstream unreachable; retrying");
                None
            }
            Err(err) => return Err(AdapterError::Request(err)),
        };
        tokio::time::sleep(backoff.wait(retry, hint)).await;
        retry += 1;
    }
}
