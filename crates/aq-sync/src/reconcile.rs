//! Achievement and XP reconciliation over a user's full application set.

use std::collections::BTreeMap;

use aq_core::{
    calendar_day, Achievement, ApplicationStatus, JobApplication, XP_PER_APPLICATION,
};
use aq_storage::{Store, StoreError, StoreResult};
use chrono::{Datelike, NaiveDate, Timelike, Weekday};
use serde::Serialize;
use tracing::{debug, info};

pub const FIRST_APPLICATION: &str = "First Application";
pub const FIVE_IN_A_DAY: &str = "Five in a Day";
pub const TEN_TOTAL: &str = "Ten Total";
pub const HUNDRED_CLUB: &str = "Hundred Club";
pub const WEEKEND_WARRIOR: &str = "Weekend Warrior";
pub const CONSISTENCY_IS_KEY: &str = "Consistency is Key";
pub const WEEKLY_STREAK: &str = "Weekly Streak";
pub const TWO_WEEK_HUSTLE: &str = "Two-Week Hustle";
pub const JOB_HUNT_MARATHONER: &str = "Job Hunt Marathoner";
pub const FIRST_RESPONSE: &str = "First Response";
pub const FIRST_INTERVIEW: &str = "First Interview";
pub const TECHNICAL_CHALLENGER: &str = "Technical Challenger";
pub const ONSITE_EXPERIENCE: &str = "Onsite Experience";
pub const OFFER_RECEIVED: &str = "Offer Received";
pub const EARLY_BIRD: &str = "Early Bird";
pub const NIGHT_OWL: &str = "Night Owl";

/// Reference catalogue written by `aq-cli seed-achievements`, in display order.
pub fn default_catalogue() -> Vec<Achievement> {
    vec![
        Achievement::new(FIRST_APPLICATION, "Track your first job application", 50),
        Achievement::new(FIVE_IN_A_DAY, "Apply to 5 jobs in one day", 100),
        Achievement::new(TEN_TOTAL, "Track 10 applications", 100),
        Achievement::new(HUNDRED_CLUB, "Track 100 applications", 500),
        Achievement::new(WEEKEND_WARRIOR, "Apply on a Saturday or Sunday", 50),
        Achievement::new(CONSISTENCY_IS_KEY, "Apply 3 days in a row", 100),
        Achievement::new(WEEKLY_STREAK, "Apply 7 days in a row", 200),
        Achievement::new(TWO_WEEK_HUSTLE, "Apply 14 days in a row", 300),
        Achievement::new(JOB_HUNT_MARATHONER, "Apply 30 days in a row", 500),
        Achievement::new(FIRST_RESPONSE, "Hear back from a company", 50),
        Achievement::new(FIRST_INTERVIEW, "Land your first interview", 150),
        Achievement::new(TECHNICAL_CHALLENGER, "Receive an online assessment", 100),
        // Unreachable while the status set has no onsite stage.
        Achievement::new(ONSITE_EXPERIENCE, "Get invited to an onsite interview", 200),
        Achievement::new(OFFER_RECEIVED, "Receive your first job offer", 300),
        Achievement::new(EARLY_BIRD, "Apply before 8 AM", 50),
        Achievement::new(NIGHT_OWL, "Apply between midnight and 5 AM", 50),
    ]
}

/// Day-bucketed view of one user's applications.
#[derive(Debug, Clone)]
pub struct ApplicationFacts<'a> {
    applications: &'a [JobApplication],
    histogram: BTreeMap<NaiveDate, usize>,
    today: NaiveDate,
}

impl<'a> ApplicationFacts<'a> {
    pub fn new(applications: &'a [JobApplication], today: NaiveDate) -> Self {
        let mut histogram = BTreeMap::new();
        for app in applications {
            *histogram.entry(calendar_day(app.application_date)).or_insert(0) += 1;
        }
        Self {
            applications,
            histogram,
            today,
        }
    }

    pub fn total(&self) -> usize {
        self.applications.len()
    }

    pub fn on_day(&self, day: NaiveDate) -> usize {
        self.histogram.get(&day).copied().unwrap_or(0)
    }

    /// Ascending unique application days.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.histogram.keys().copied()
    }

    /// Longest run of consecutive calendar days anywhere in history.
    pub fn longest_run(&self) -> usize {
        let mut longest = 0;
        let mut current = 0;
        let mut previous: Option<NaiveDate> = None;
        for day in self.days() {
            current = match previous {
                Some(prev) if (day - prev).num_days() == 1 => current + 1,
                _ => 1,
            };
            longest = longest.max(current);
            previous = Some(day);
        }
        longest
    }

    pub fn has_run(&self, length: usize) -> bool {
        self.longest_run() >= length
    }

    fn any_current_status(&self, status: ApplicationStatus) -> bool {
        self.applications.iter().any(|a| a.status == status)
    }

    fn any_hour(&self, pred: impl Fn(u32) -> bool) -> bool {
        self.applications
            .iter()
            .any(|a| pred(a.application_date.hour()))
    }

    /// `None` for names without a known unlock rule.
    pub fn satisfies(&self, achievement: &str) -> Option<bool> {
        let unlocked = match achievement {
            FIRST_APPLICATION => self.total() >= 1,
            FIVE_IN_A_DAY => self.on_day(self.today) >= 5,
            TEN_TOTAL => self.total() >= 10,
            HUNDRED_CLUB => self.total() >= 100,
            WEEKEND_WARRIOR => self
                .days()
                .any(|d| matches!(d.weekday(), Weekday::Sat | Weekday::Sun)),
            CONSISTENCY_IS_KEY => self.has_run(3),
            WEEKLY_STREAK => self.has_run(7),
            TWO_WEEK_HUSTLE => self.has_run(14),
            JOB_HUNT_MARATHONER => self.has_run(30),
            FIRST_RESPONSE => self.applications.iter().any(|a| a.status_history.len() > 1),
            FIRST_INTERVIEW => self.any_current_status(ApplicationStatus::Interview),
            TECHNICAL_CHALLENGER => self.any_current_status(ApplicationStatus::OnlineAssessment),
            ONSITE_EXPERIENCE => self
                .applications
                .iter()
                .any(|a| a.status.as_str().to_ascii_lowercase().contains("onsite")),
            OFFER_RECEIVED => self.any_current_status(ApplicationStatus::Offer),
            EARLY_BIRD => self.any_hour(|h| h < 8),
            NIGHT_OWL => self.any_hour(|h| h < 5),
            _ => return None,
        };
        Some(unlocked)
    }
}

/// Catalogue entries not yet in `already_unlocked` whose rule holds, in
/// catalogue order.
pub fn newly_unlocked<'c>(
    catalogue: &'c [Achievement],
    already_unlocked: &[String],
    facts: &ApplicationFacts<'_>,
) -> Vec<&'c Achievement> {
    catalogue
        .iter()
        .filter(|a| !already_unlocked.iter().any(|u| u == &a.name))
        .filter(|a| match facts.satisfies(&a.name) {
            Some(holds) => holds,
            None => {
                debug!(achievement = %a.name, "no unlock rule for catalogue entry");
                false
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub apps_added: u64,
    pub xp_before: u64,
    pub xp_after: u64,
    pub unlocked: Vec<String>,
}

impl ReconciliationReport {
    pub fn changed(&self) -> bool {
        self.xp_after != self.xp_before || !self.unlocked.is_empty()
    }
}

/// Grants per-application XP for `post - pre_count` new records, unlocks
/// achievements, and persists `{xp, achievements}` in one write when
/// anything changed.
pub async fn reconcile<S>(
    store: &S,
    user_id: &str,
    pre_count: usize,
    today: NaiveDate,
) -> StoreResult<ReconciliationReport>
where
    S: Store + ?Sized,
{
    let user = store
        .get_user(user_id)
        .await?
        .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
    let applications = store.list_applications(user_id).await?;

    let mut catalogue = store.list_achievements().await?;
    if catalogue.is_empty() {
        debug!("achievement catalogue not seeded; using defaults");
        catalogue = default_catalogue();
    }

    let apps_added = applications.len().saturating_sub(pre_count) as u64;
    let mut xp = user.xp + apps_added * XP_PER_APPLICATION;
    let facts = ApplicationFacts::new(&applications, today);

    let mut achievements = user.achievements.clone();
    let mut unlocked = Vec::new();
    for achievement in newly_unlocked(&catalogue, &user.achievements, &facts) {
        xp += achievement.xp_reward;
        achievements.push(achievement.name.clone());
        unlocked.push(achievement.name.clone());
    }

    let report = ReconciliationReport {
        apps_added,
        xp_before: user.xp,
        xp_after: xp,
        unlocked,
    };

    if report.changed() {
        store.save_progress(user_id, xp, &achievements).await?;
        info!(
            user_id,
            apps_added,
            xp = report.xp_after,
            unlocked = ?report.unlocked,
            "reconciled achievements"
        );
    }
    Ok(report)
}
