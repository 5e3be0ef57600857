use aq_core::EmailMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{debug, info, info_span, Instrument};

use crate::http::{send_with_retry, BackoffPolicy, HttpClientConfig};
use crate::mime::{BodyParts, MessagePart, MimeNode};
use crate::{AdapterError, EmailSource, MailSourceFactory};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail caps `maxResults` per list page at 500.
const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub base_url: String,
    pub query: String,
    /// `maxResults` per list request. Every page newer than the watermark is
    /// read regardless.
    pub page_size: usize,
    pub detail_concurrency: usize,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            base_url: GMAIL_API_BASE.to_string(),
            query: "in:inbox".to_string(),
            page_size: 100,
            detail_concurrency: 8,
        }
    }
}

impl GmailConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            query: std::env::var("AQ_GMAIL_QUERY").unwrap_or(defaults.query),
            page_size: std::env::var("AQ_GMAIL_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// A `users.messages.get?format=full` resource.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub payload: MessagePart,
}

impl GmailMessage {
    /// `internalDate` (epoch millis) first, then the `Date` header.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.internal_date
            .as_deref()
            .and_then(|ms| ms.trim().parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .or_else(|| {
                self.payload
                    .header("Date")
                    .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                    .map(|d| d.with_timezone(&Utc))
            })
    }

    pub fn into_email(self, fallback_timestamp: DateTime<Utc>) -> EmailMessage {
        let timestamp = self.timestamp().unwrap_or(fallback_timestamp);
        let sender = self.payload.header("From").unwrap_or_default().to_string();
        let subject = self.payload.header("Subject").unwrap_or_default().to_string();
        let mut body = BodyParts::collect(&MimeNode::from(&self.payload)).into_text();
        if body.is_empty() {
            body = self.snippet;
        }
        EmailMessage {
            id: self.id,
            sender,
            subject,
            body,
            timestamp,
        }
    }
}

/// Gmail REST client bound to one user's OAuth access token.
#[derive(Debug, Clone)]
pub struct GmailSource {
    client: reqwest::Client,
    access_token: String,
    config: GmailConfig,
    backoff: BackoffPolicy,
}

impl GmailSource {
    pub fn new(
        client: reqwest::Client,
        access_token: impl Into<String>,
        config: GmailConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            access_token: access_token.into(),
            config,
            backoff,
        }
    }

    /// Ids of every message matching the query after `since`. Gmail lists
    /// newest first, so stopping early would lose the oldest unread mail.
    async fn list_ids(&self, since: DateTime<Utc>) -> Result<Vec<String>, AdapterError> {
        let url = format!("{}/messages", self.config.base_url);
        let q = format!("{} after:{}", self.config.query, since.timestamp());
        let page_size = self.config.page_size.clamp(1, MAX_PAGE_SIZE).to_string();
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![("q", q.clone()), ("maxResults", page_size.clone())];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let resp = send_with_retry(&self.backoff, || {
                self.client
                    .get(&url)
                    .bearer_auth(&self.access_token)
                    .query(&params)
            })
            .await?;
            let page: ListResponse = resp.json().await?;

            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(ids)
    }

    pub async fn get_message(&self, id: &str) -> Result<GmailMessage, AdapterError> {
        let url = format!("{}/messages/{}", self.config.base_url, id);
        let resp = send_with_retry(&self.backoff, || {
            self.client
                .get(&url)
                .bearer_auth(&self.access_token)
                .query(&[("format", "full")])
        })
        .await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl EmailSource for GmailSource {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<EmailMessage>, AdapterError> {
        let span = info_span!("gmail_fetch", since = %since);
        async move {
            let fetched_at = Utc::now();
            let ids = self.list_ids(since).await?;
            debug!(count = ids.len(), "listed gmail messages");

            let messages: Vec<GmailMessage> = stream::iter(ids)
                .map(|id| async move { self.get_message(&id).await })
                .buffered(self.config.detail_concurrency.max(1))
                .try_collect()
                .await?;

            let mut emails: Vec<EmailMessage> = messages
                .into_iter()
                .map(|m| m.into_email(fetched_at))
                .filter(|e| e.timestamp > since)
                .collect();
            emails.sort_by_key(|e| e.timestamp);
            info!(count = emails.len(), "fetched new emails");
            Ok(emails)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GmailSourceFactory {
    client: reqwest::Client,
    config: GmailConfig,
    backoff: BackoffPolicy,
}

impl GmailSourceFactory {
    pub fn new(http: &HttpClientConfig, config: GmailConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            config,
            backoff: http.backoff,
        })
    }
}

impl MailSourceFactory for GmailSourceFactory {
    fn for_token(&self, access_token: &str) -> Box<dyn EmailSource> {
        Box::new(GmailSource::new(
            self.client.clone(),
            access_token,
            self.config.clone(),
            self.backoff,
        ))
    }
}
