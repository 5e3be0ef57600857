//! Upstream adapters: the Gmail email source, the Anthropic-backed email
//! classifier, and the retry policy both share.

use aq_core::{Classification, EmailMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod classifier;
pub mod gmail;
pub mod http;
pub mod mime;

pub use classifier::{parse_classification, AnthropicClassifier, ClassifierConfig};
pub use gmail::{GmailConfig, GmailSource, GmailSourceFactory};
pub use http::{BackoffPolicy, HttpClientConfig};

pub const CRATE_NAME: &str = "aq-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("unexpected upstream payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A user's mailbox, bound to one access token.
#[async_trait]
pub trait EmailSource: Send + Sync {
    /// Emails strictly newer than `since`, oldest first. Any upstream failure
    /// fails the whole call.
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<EmailMessage>, AdapterError>;
}

/// Builds a request-scoped [`EmailSource`] from the caller's mail access token.
pub trait MailSourceFactory: Send + Sync {
    fn for_token(&self, access_token: &str) -> Box<dyn EmailSource>;
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// `Err` only for transport/upstream failures; malformed model output is
    /// `Ok(Classification::Indeterminate)`.
    async fn classify(&self, email: &EmailMessage) -> Result<Classification, AdapterError>;
}
