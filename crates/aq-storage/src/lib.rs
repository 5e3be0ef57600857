//! Document persistence for ApplyQuest: application/user/invite/achievement
//! stores, the exact-match application upsert, and the static logo table.

use aq_core::{
    Achievement, ApplicationStatus, CumulativeChart, JobApplication, StatusEntry, UserRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod logos;
mod memory;
mod postgres;

pub use logos::LogoTable;
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "aq-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt document {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("application {0} not found")]
    ApplicationNotFound(Uuid),
}

impl StoreError {
    pub(crate) fn corrupt(id: impl ToString, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Exact-string lookup on the natural key.
    async fn find_application(
        &self,
        user_id: &str,
        company: &str,
        position: &str,
    ) -> StoreResult<Option<JobApplication>>;

    async fn insert_application(&self, application: &JobApplication) -> StoreResult<()>;

    /// Appends `entry` to the history and overwrites the current status.
    async fn append_status(&self, id: Uuid, entry: &StatusEntry) -> StoreResult<()>;

    /// All of a user's applications, ordered by `application_date` ascending.
    async fn list_applications(&self, user_id: &str) -> StoreResult<Vec<JobApplication>>;

    async fn count_applications(&self, user_id: &str) -> StoreResult<usize>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>>;

    /// Inserts `user` and registers its invite code as one write. Neither row
    /// is kept unless both land.
    async fn create_user(&self, user: &UserRecord) -> StoreResult<UserCreation>;

    async fn set_last_fetched(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Single write of the reconciliation result.
    async fn save_progress(&self, user_id: &str, xp: u64, achievements: &[String])
        -> StoreResult<()>;

    async fn set_current_streak(&self, user_id: &str, streak: u32) -> StoreResult<()>;

    async fn set_chart(&self, user_id: &str, chart: &CumulativeChart) -> StoreResult<()>;

    /// Adds a one-directional edge; `false` when it already existed.
    async fn add_friend(&self, user_id: &str, friend_id: &str) -> StoreResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCreation {
    Created,
    /// Another request created the user first.
    UserExists,
    InviteCodeTaken,
}

#[async_trait]
pub trait InviteCodeStore: Send + Sync {
    async fn resolve_invite_code(&self, code: &str) -> StoreResult<Option<String>>;
}

#[async_trait]
pub trait AchievementStore: Send + Sync {
    /// Reference achievements in catalogue order.
    async fn list_achievements(&self) -> StoreResult<Vec<Achievement>>;

    async fn put_achievement(&self, achievement: &Achievement) -> StoreResult<()>;
}

/// Everything the pipeline and the HTTP layer need from persistence.
pub trait Store: ApplicationStore + UserStore + InviteCodeStore + AchievementStore {}

impl<T> Store for T where T: ApplicationStore + UserStore + InviteCodeStore + AchievementStore {}

#[derive(Debug, Clone)]
pub struct UpsertRequest<'a> {
    pub user_id: &'a str,
    pub company: &'a str,
    pub position: &'a str,
    pub status: ApplicationStatus,
    pub date: DateTime<Utc>,
    /// Logo suggested by the classifier, used when the table has none.
    pub logo_hint: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub created: bool,
    pub application: JobApplication,
}

/// Create-if-absent, else append-status, keyed by exact (user, company,
/// position). The lookup and the write are separate calls, so concurrent
/// refreshes for the same user can race.
pub async fn upsert_application<S>(
    store: &S,
    logos: &LogoTable,
    request: UpsertRequest<'_>,
) -> StoreResult<UpsertOutcome>
where
    S: ApplicationStore + ?Sized,
{
    let existing = store
        .find_application(request.user_id, request.company, request.position)
        .await?;

    match existing {
        None => {
            let logo = logos
                .lookup(request.company)
                .map(ToString::to_string)
                .or_else(|| request.logo_hint.map(ToString::to_string));
            let application = JobApplication::new(
                request.user_id,
                request.company,
                request.position,
                request.status,
                request.date,
                logo,
            );
            store.insert_application(&application).await?;
            debug!(
                user_id = request.user_id,
                company = request.company,
                position = request.position,
                "created application"
            );
            Ok(UpsertOutcome {
                created: true,
                application,
            })
        }
        Some(mut application) => {
            let entry = StatusEntry {
                status: request.status,
                date: request.date,
            };
            store.append_status(application.id, &entry).await?;
            application.record_status(entry.status, entry.date);
            debug!(
                user_id = request.user_id,
                company = request.company,
                status = %request.status,
                history_len = application.status_history.len(),
                "updated application"
            );
            Ok(UpsertOutcome {
                created: false,
                application,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).single().unwrap()
    }

    fn request<'a>(
        company: &'a str,
        position: &'a str,
        status: ApplicationStatus,
        date: DateTime<Utc>,
    ) -> UpsertRequest<'a> {
        UpsertRequest {
            user_id: "u1",
            company,
            position,
            status,
            date,
            logo_hint: None,
        }
    }

    #[tokio::test]
    async fn second_sighting_appends_history_in_order() {
        let store = MemoryStore::new();
        let logos = LogoTable::builtin();

        let first = upsert_application(
            &store,
            &logos,
            request("Salesforce", "Software Engineer Intern", ApplicationStatus::Applied, ts(1, 9)),
        )
        .await
        .unwrap();
        let second = upsert_application(
            &store,
            &logos,
            request(
                "Salesforce",
                "Software Engineer Intern",
                ApplicationStatus::Interview,
                ts(4, 15),
            ),
        )
        .await
        .unwrap();

        assert!(first.created);
        assert!(!second.created);
        let apps = store.list_applications("u1").await.unwrap();
        assert_eq!(apps.len(), 1);
        let app = &apps[0];
        assert_eq!(app.status, ApplicationStatus::Interview);
        let statuses: Vec<_> = app.status_history.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![ApplicationStatus::Applied, ApplicationStatus::Interview]);
        assert_eq!(app.application_date, ts(1, 9));
        assert!(app.logo.is_some(), "salesforce is in the built-in logo table");
    }

    #[tokio::test]
    async fn near_duplicate_company_names_stay_separate() {
        let store = MemoryStore::new();
        let logos = LogoTable::builtin();

        let google = request("Google", "SWE", ApplicationStatus::Applied, ts(1, 9));
        upsert_application(&store, &logos, google).await.unwrap();
        let outcome = upsert_application(
            &store,
            &logos,
            request("Google LLC", "SWE", ApplicationStatus::Applied, ts(1, 10)),
        )
        .await
        .unwrap();

        assert!(outcome.created);
        assert_eq!(store.count_applications("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn logo_hint_is_used_only_when_table_misses() {
        let store = MemoryStore::new();
        let logos = LogoTable::builtin();
        let mut req =
            request("Tiny Startup", "Founding Engineer", ApplicationStatus::Applied, ts(2, 9));
        req.logo_hint = Some("https://tiny.example/logo.png");

        let outcome = upsert_application(&store, &logos, req).await.unwrap();
        assert_eq!(outcome.application.logo.as_deref(), Some("https://tiny.example/logo.png"));

        let mut unknown = request("Nobody Co", "Analyst", ApplicationStatus::Applied, ts(2, 9));
        unknown.logo_hint = None;
        let outcome = upsert_application(&store, &logos, unknown).await.unwrap();
        assert!(outcome.application.logo.is_none());
    }
}
