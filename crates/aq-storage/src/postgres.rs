use aq_core::{
    Achievement, ApplicationStatus, CumulativeChart, JobApplication, StatusEntry, UserRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{
    AchievementStore, ApplicationStore, InviteCodeStore, StoreError, StoreResult, UserCreation,
    UserStore,
};

const APPLICATION_COLUMNS: &str =
    "id, user_id, company, position, status, application_date, status_history, logo";

const USER_COLUMNS: &str = "user_id, name, email, xp, achievements, current_streak, friends, \
     invite_code, last_fetched, chart, created_at";

/// Postgres-backed store; documents that are arrays or nested objects live in
/// JSONB columns.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn ensure_updated(user_id: &str, rows_affected: u64) -> StoreResult<()> {
    if rows_affected == 0 {
        return Err(StoreError::UserNotFound(user_id.to_string()));
    }
    Ok(())
}

fn row_to_application(row: &PgRow) -> StoreResult<JobApplication> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<ApplicationStatus>()
        .map_err(|err| StoreError::corrupt(id, err))?;
    let Json(status_history): Json<Vec<StatusEntry>> = row.try_get("status_history")?;
    if status_history.is_empty() {
        return Err(StoreError::corrupt(id, "empty status history"));
    }
    Ok(JobApplication {
        id,
        user_id: row.try_get("user_id")?,
        company: row.try_get("company")?,
        position: row.try_get("position")?,
        status,
        application_date: row.try_get("application_date")?,
        status_history,
        logo: row.try_get("logo")?,
    })
}

fn row_to_user(row: &PgRow) -> StoreResult<UserRecord> {
    let user_id: String = row.try_get("user_id")?;
    let xp: i64 = row.try_get("xp")?;
    let current_streak: i32 = row.try_get("current_streak")?;
    let Json(achievements): Json<Vec<String>> = row.try_get("achievements")?;
    let Json(friends): Json<Vec<String>> = row.try_get("friends")?;
    let Json(chart): Json<CumulativeChart> = row.try_get("chart")?;
    Ok(UserRecord {
        xp: u64::try_from(xp).map_err(|_| StoreError::corrupt(&user_id, "negative xp"))?,
        current_streak: u32::try_from(current_streak)
            .map_err(|_| StoreError::corrupt(&user_id, "negative streak"))?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        achievements,
        friends,
        invite_code: row.try_get("invite_code")?,
        last_fetched: row.try_get("last_fetched")?,
        chart,
        created_at: row.try_get("created_at")?,
        user_id,
    })
}

fn xp_column(user_id: &str, xp: u64) -> StoreResult<i64> {
    i64::try_from(xp).map_err(|_| StoreError::corrupt(user_id, "xp exceeds column range"))
}

#[async_trait]
impl ApplicationStore for PgStore {
    async fn find_application(
        &self,
        user_id: &str,
        company: &str,
        position: &str,
    ) -> StoreResult<Option<JobApplication>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM job_applications
              WHERE user_id = $1 AND company = $2 AND position = $3
              ORDER BY application_date
              LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(company)
            .bind(position)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_application).transpose()
    }

    async fn insert_application(&self, application: &JobApplication) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_applications
                (id, user_id, company, position, status, application_date, status_history, logo)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(application.id)
        .bind(&application.user_id)
        .bind(&application.company)
        .bind(&application.position)
        .bind(application.status.as_str())
        .bind(application.application_date)
        .bind(Json(&application.status_history))
        .bind(&application.logo)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_status(&self, id: Uuid, entry: &StatusEntry) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_applications
               SET status = $2,
                   status_history = status_history || $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(entry.status.as_str())
        .bind(Json(vec![entry]))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ApplicationNotFound(id));
        }
        Ok(())
    }

    async fn list_applications(&self, user_id: &str) -> StoreResult<Vec<JobApplication>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM job_applications
              WHERE user_id = $1
              ORDER BY application_date"
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_application).collect()
    }

    async fn count_applications(&self, user_id: &str) -> StoreResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_applications WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        usize::try_from(count).map_err(|_| StoreError::corrupt(user_id, "negative count"))
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1");
        let row = sqlx::query(&sql).bind(user_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn create_user(&self, user: &UserRecord) -> StoreResult<UserCreation> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO users
                (user_id, name, email, xp, achievements, current_streak, friends,
                 invite_code, last_fetched, chart, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&user.user_id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(xp_column(&user.user_id, user.xp)?)
        .bind(Json(&user.achievements))
        .bind(i32::try_from(user.current_streak).unwrap_or(i32::MAX))
        .bind(Json(&user.friends))
        .bind(&user.invite_code)
        .bind(user.last_fetched)
        .bind(Json(&user.chart))
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(UserCreation::UserExists);
        }

        // The user row must exist before the invite code can reference it.
        let claimed = sqlx::query(
            r#"
            INSERT INTO invite_codes (code, user_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(&user.invite_code)
        .bind(&user.user_id)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(UserCreation::InviteCodeTaken);
        }

        tx.commit().await?;
        Ok(UserCreation::Created)
    }

    async fn set_last_fetched(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET last_fetched = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        ensure_updated(user_id, result.rows_affected())
    }

    async fn save_progress(
        &self,
        user_id: &str,
        xp: u64,
        achievements: &[String],
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET xp = $2, achievements = $3 WHERE user_id = $1")
            .bind(user_id)
            .bind(xp_column(user_id, xp)?)
            .bind(Json(achievements))
            .execute(&self.pool)
            .await?;
        ensure_updated(user_id, result.rows_affected())
    }

    async fn set_current_streak(&self, user_id: &str, streak: u32) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET current_streak = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(i32::try_from(streak).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await?;
        ensure_updated(user_id, result.rows_affected())
    }

    async fn set_chart(&self, user_id: &str, chart: &CumulativeChart) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET chart = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(Json(chart))
            .execute(&self.pool)
            .await?;
        ensure_updated(user_id, result.rows_affected())
    }

    async fn add_friend(&self, user_id: &str, friend_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET friends = friends || jsonb_build_array($2::text)
             WHERE user_id = $1
               AND NOT friends @> jsonb_build_array($2::text)
            "#,
        )
        .bind(user_id)
        .bind(friend_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_user(user_id).await?.is_none() {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        Ok(false)
    }
}

#[async_trait]
impl InviteCodeStore for PgStore {
    async fn resolve_invite_code(&self, code: &str) -> StoreResult<Option<String>> {
        let user_id = sqlx::query_scalar("SELECT user_id FROM invite_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user_id)
    }
}

#[async_trait]
impl AchievementStore for PgStore {
    async fn list_achievements(&self) -> StoreResult<Vec<Achievement>> {
        let rows = sqlx::query("SELECT name, description, xp_reward FROM achievements ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let xp_reward: i64 = row.try_get("xp_reward")?;
            out.push(Achievement {
                xp_reward: u64::try_from(xp_reward)
                    .map_err(|_| StoreError::corrupt(&name, "negative xp reward"))?,
                description: row.try_get("description")?,
                name,
            });
        }
        Ok(out)
    }

    async fn put_achievement(&self, achievement: &Achievement) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO achievements (name, description, xp_reward)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
               SET description = EXCLUDED.description,
                   xp_reward = EXCLUDED.xp_reward
            "#,
        )
        .bind(&achievement.name)
        .bind(&achievement.description)
        .bind(xp_column(&achievement.name, achievement.xp_reward)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
