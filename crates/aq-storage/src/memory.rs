use std::collections::HashMap;

use aq_core::{Achievement, CumulativeChart, InviteCode, JobApplication, StatusEntry, UserRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    AchievementStore, ApplicationStore, InviteCodeStore, StoreError, StoreResult, UserCreation,
    UserStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, UserRecord>,
    applications: Vec<JobApplication>,
    invite_codes: HashMap<String, InviteCode>,
    achievements: Vec<Achievement>,
}

/// Process-local store used by tests and `serve --in-memory`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_user<F>(&self, user_id: &str, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut UserRecord) + Send,
    {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        f(user);
        Ok(())
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn find_application(
        &self,
        user_id: &str,
        company: &str,
        position: &str,
    ) -> StoreResult<Option<JobApplication>> {
        let state = self.state.read().await;
        Ok(state
            .applications
            .iter()
            .find(|a| a.matches_key(user_id, company, position))
            .cloned())
    }

    async fn insert_application(&self, application: &JobApplication) -> StoreResult<()> {
        self.state.write().await.applications.push(application.clone());
        Ok(())
    }

    async fn append_status(&self, id: Uuid, entry: &StatusEntry) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let application = state
            .applications
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::ApplicationNotFound(id))?;
        application.record_status(entry.status, entry.date);
        Ok(())
    }

    async fn list_applications(&self, user_id: &str) -> StoreResult<Vec<JobApplication>> {
        let state = self.state.read().await;
        let mut apps = state
            .applications
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        apps.sort_by_key(|a| a.application_date);
        Ok(apps)
    }

    async fn count_applications(&self, user_id: &str) -> StoreResult<usize> {
        let state = self.state.read().await;
        Ok(state.applications.iter().filter(|a| a.user_id == user_id).count())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn create_user(&self, user: &UserRecord) -> StoreResult<UserCreation> {
        let mut state = self.state.write().await;
        if state.users.contains_key(&user.user_id) {
            return Ok(UserCreation::UserExists);
        }
        if state.invite_codes.contains_key(&user.invite_code) {
            return Ok(UserCreation::InviteCodeTaken);
        }
        state.invite_codes.insert(
            user.invite_code.clone(),
            InviteCode {
                code: user.invite_code.clone(),
                user_id: user.user_id.clone(),
                created_at: user.created_at,
            },
        );
        state.users.insert(user.user_id.clone(), user.clone());
        Ok(UserCreation::Created)
    }

    async fn set_last_fetched(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.with_user(user_id, |u| u.last_fetched = Some(at)).await
    }

    async fn save_progress(
        &self,
        user_id: &str,
        xp: u64,
        achievements: &[String],
    ) -> StoreResult<()> {
        let achievements = achievements.to_vec();
        self.with_user(user_id, move |u| {
            u.xp = xp;
            u.achievements = achievements;
        })
        .await
    }

    async fn set_current_streak(&self, user_id: &str, streak: u32) -> StoreResult<()> {
        self.with_user(user_id, |u| u.current_streak = streak).await
    }

    async fn set_chart(&self, user_id: &str, chart: &CumulativeChart) -> StoreResult<()> {
        let chart = chart.clone();
        self.with_user(user_id, move |u| u.chart = chart).await
    }

    async fn add_friend(&self, user_id: &str, friend_id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        if user.friends.iter().any(|f| f == friend_id) {
            return Ok(false);
        }
        user.friends.push(friend_id.to_string());
        Ok(true)
    }
}

#[async_trait]
impl InviteCodeStore for MemoryStore {
    async fn resolve_invite_code(&self, code: &str) -> StoreResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.invite_codes.get(code).map(|i| i.user_id.clone()))
    }
}

#[async_trait]
impl AchievementStore for MemoryStore {
    async fn list_achievements(&self) -> StoreResult<Vec<Achievement>> {
        Ok(self.state.read().await.achievements.clone())
    }

    async fn put_achievement(&self, achievement: &Achievement) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.achievements.iter_mut().find(|a| a.name == achievement.name) {
            Some(existing) => *existing = achievement.clone(),
            None => state.achievements.push(achievement.clone()),
        }
        Ok(())
    }
}
