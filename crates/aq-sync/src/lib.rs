//! Request-scoped refresh pipeline: fetch new emails, classify, upsert,
//! reconcile achievements/XP, and refresh the cached read models.

use std::sync::Arc;

use aq_adapters::{AdapterError, Classifier, EmailSource};
use aq_core::{calendar_day, Classification, EmailMessage};
use aq_storage::{upsert_application, LogoTable, Store, StoreError, UpsertRequest};
use chrono::{DateTime, Duration, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub mod accounts;
pub mod read_models;
pub mod reconcile;

pub use accounts::{AccountError, AddFriendOutcome, NewUser};
pub use reconcile::{default_catalogue, ReconciliationReport};

pub const CRATE_NAME: &str = "aq-sync";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Window used when the user has never been fetched.
    pub fallback_lookback: Duration,
    pub classifier_concurrency: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            fallback_lookback: Duration::days(7),
            classifier_concurrency: 4,
        }
    }
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fallback_lookback: std::env::var("AQ_FALLBACK_LOOKBACK_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .map(Duration::days)
                .unwrap_or(defaults.fallback_lookback),
            classifier_concurrency: std::env::var("AQ_CLASSIFIER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.classifier_concurrency),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub emails_processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unlocked: Vec<String>,
    pub xp: u64,
    pub current_streak: u32,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("user {0} not found")]
    UnknownUser(String),
    #[error("mail source failed: {0}")]
    MailSource(#[source] AdapterError),
    #[error("store failed after {processed} emails: {source}")]
    Store {
        processed: usize,
        #[source]
        source: StoreError,
    },
}

fn store_failure(processed: usize) -> impl FnOnce(StoreError) -> RefreshError {
    move |source| RefreshError::Store { processed, source }
}

/// Everything one refresh needs besides the per-request mail source.
pub struct RefreshPipeline {
    store: Arc<dyn Store>,
    classifier: Arc<dyn Classifier>,
    logos: Arc<LogoTable>,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
}

impl RefreshPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        classifier: Arc<dyn Classifier>,
        logos: Arc<LogoTable>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            logos,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs one refresh for `user_id`. A mail-source failure aborts before
    /// the watermark moves; a classifier failure only skips that email.
    pub async fn run(
        &self,
        user_id: &str,
        source: &dyn EmailSource,
    ) -> Result<RefreshSummary, RefreshError> {
        let span = info_span!("refresh", user_id);
        self.run_inner(user_id, source).instrument(span).await
    }

    async fn run_inner(
        &self,
        user_id: &str,
        source: &dyn EmailSource,
    ) -> Result<RefreshSummary, RefreshError> {
        let now = self.clock.now();
        let today = calendar_day(now);
        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(store_failure(0))?
            .ok_or_else(|| RefreshError::UnknownUser(user_id.to_string()))?;

        let since = user
            .last_fetched
            .unwrap_or(now - self.config.fallback_lookback);
        let mut emails = source
            .fetch_since(since)
            .await
            .map_err(RefreshError::MailSource)?;
        self.store
            .set_last_fetched(user_id, now)
            .await
            .map_err(store_failure(0))?;
        emails.sort_by_key(|e| e.timestamp);
        info!(count = emails.len(), since = %since, "fetched emails");

        let mut summary = RefreshSummary {
            emails_processed: emails.len(),
            ..RefreshSummary::default()
        };
        let pre_count = self
            .store
            .count_applications(user_id)
            .await
            .map_err(store_failure(0))?;

        let verdicts = self.classify_all(emails).await;

        for (processed, (email, verdict)) in verdicts.into_iter().enumerate() {
            let classified = match verdict {
                Ok(Classification::Classified(classified)) => classified,
                Ok(Classification::Indeterminate) => {
                    debug!(email_id = %email.id, "skipping indeterminate email");
                    summary.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(email_id = %email.id, error = %err, "classifier failed; skipping email");
                    summary.failed += 1;
                    continue;
                }
            };

            let outcome = upsert_application(
                self.store.as_ref(),
                &self.logos,
                UpsertRequest {
                    user_id,
                    company: &classified.company,
                    position: &classified.position,
                    status: classified.status,
                    date: email.timestamp,
                    logo_hint: classified.logo.as_deref(),
                },
            )
            .await
            .map_err(store_failure(processed))?;

            if outcome.created {
                summary.created += 1;
            } else {
                summary.updated += 1;
            }
        }

        let processed = summary.emails_processed;
        let mut xp = user.xp;
        if summary.created + summary.updated > 0 {
            let report = reconcile::reconcile(self.store.as_ref(), user_id, pre_count, today)
                .await
                .map_err(store_failure(processed))?;
            xp = report.xp_after;
            summary.unlocked = report.unlocked;
        }

        let streak = read_models::refresh_streak(self.store.as_ref(), user_id, today)
            .await
            .map_err(store_failure(processed))?;
        read_models::refresh_chart(self.store.as_ref(), user_id)
            .await
            .map_err(store_failure(processed))?;

        summary.xp = xp;
        summary.current_streak = streak.current_streak;
        info!(
            processed,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "refresh complete"
        );
        Ok(summary)
    }

    /// Bounded fan-out that keeps input order.
    async fn classify_all(
        &self,
        emails: Vec<EmailMessage>,
    ) -> Vec<(EmailMessage, Result<Classification, AdapterError>)> {
        let classifier = &self.classifier;
        stream::iter(emails)
            .map(|email| async move {
                let verdict = classifier.classify(&email).await;
                (email, verdict)
            })
            .buffered(self.config.classifier_concurrency.max(1))
            .collect()
            .await
    }
}
