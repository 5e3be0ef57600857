//! Derived views over the application set: current streak, cumulative chart,
//! friends leaderboard. Each is recomputed in full and cached on the user.

use std::collections::BTreeSet;

use aq_core::{calendar_day, level_for_xp, ChartPoint, CumulativeChart, JobApplication, UserRecord};
use aq_storage::{Store, StoreResult};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, warn};

pub fn unique_days(applications: &[JobApplication]) -> BTreeSet<NaiveDate> {
    applications
        .iter()
        .map(|a| calendar_day(a.application_date))
        .collect()
}

/// Consecutive application days ending today; 0 when today has none.
pub fn current_streak(days: &BTreeSet<NaiveDate>, today: NaiveDate) -> u32 {
    let mut streak = 0;
    let mut cursor = Some(today);
    while let Some(day) = cursor.filter(|d| days.contains(d)) {
        streak += 1;
        cursor = day.checked_sub_days(Days::new(1));
    }
    streak
}

/// One point per distinct day with the running total of applications.
pub fn cumulative_chart(applications: &[JobApplication]) -> CumulativeChart {
    let mut dates: Vec<_> = applications.iter().map(|a| a.application_date).collect();
    dates.sort();

    let mut points: Vec<ChartPoint> = Vec::new();
    for (index, date) in dates.into_iter().enumerate() {
        let day = calendar_day(date);
        let total = index as u64 + 1;
        match points.last_mut() {
            Some(last) if last.day == day => last.total = total,
            _ => points.push(ChartPoint { day, total }),
        }
    }
    CumulativeChart { points }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreakView {
    pub dates: Vec<String>,
    pub current_streak: u32,
}

/// Recomputes and persists the current streak.
pub async fn refresh_streak<S>(
    store: &S,
    user_id: &str,
    today: NaiveDate,
) -> StoreResult<StreakView>
where
    S: Store + ?Sized,
{
    let applications = store.list_applications(user_id).await?;
    let days = unique_days(&applications);
    let current_streak = current_streak(&days, today);
    store.set_current_streak(user_id, current_streak).await?;
    debug!(user_id, current_streak, "refreshed streak");
    Ok(StreakView {
        dates: days.iter().map(|d| d.to_string()).collect(),
        current_streak,
    })
}

/// Recomputes and persists the cumulative chart.
pub async fn refresh_chart<S>(store: &S, user_id: &str) -> StoreResult<CumulativeChart>
where
    S: Store + ?Sized,
{
    let applications = store.list_applications(user_id).await?;
    let chart = cumulative_chart(&applications);
    store.set_chart(user_id, &chart).await?;
    debug!(user_id, points = chart.points.len(), "refreshed chart");
    Ok(chart)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendSummary {
    #[serde(skip)]
    pub user_id: String,
    pub name: String,
    pub xp: u64,
    pub level: u64,
    pub streak: u32,
}

impl From<&UserRecord> for FriendSummary {
    fn from(user: &UserRecord) -> Self {
        Self {
            user_id: user.user_id.clone(),
            name: user.name.clone(),
            xp: user.xp,
            level: level_for_xp(user.xp),
            streak: user.current_streak,
        }
    }
}

/// The user's friends, highest XP first, using each friend's cached streak.
pub async fn leaderboard<S>(store: &S, user: &UserRecord) -> StoreResult<Vec<FriendSummary>>
where
    S: Store + ?Sized,
{
    let mut friends = Vec::with_capacity(user.friends.len());
    for friend_id in &user.friends {
        match store.get_user(friend_id).await? {
            Some(friend) => friends.push(FriendSummary::from(&friend)),
            None => warn!(user_id = %user.user_id, friend_id = %friend_id, "friend record missing"),
        }
    }
    friends.sort_by(|a, b| b.xp.cmp(&a.xp).then_with(|| a.name.cmp(&b.name)));
    Ok(friends)
}
