//! Core domain model for ApplyQuest: applications, users, achievements and
//! the email/classification handoff types shared by every other crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "aq-core";

/// Flat XP granted for every newly created application record.
pub const XP_PER_APPLICATION: u64 = 10;

pub const XP_PER_LEVEL: u64 = 100;

/// Sentinel the classifier uses for "not a job-application email".
pub const INDETERMINATE: &str = "indeterminate";

/// Lifecycle status of a tracked application. `indeterminate` is not a
/// variant: such results never reach persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationStatus {
    #[serde(rename = "applied")]
    Applied,
    #[serde(rename = "OA")]
    OnlineAssessment,
    #[serde(rename = "interview")]
    Interview,
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "rejected")]
    Rejected,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 5] = [
        ApplicationStatus::Applied,
        ApplicationStatus::OnlineAssessment,
        ApplicationStatus::Interview,
        ApplicationStatus::Offer,
        ApplicationStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Applied => "applied",
            ApplicationStatus::OnlineAssessment => "OA",
            ApplicationStatus::Interview => "interview",
            ApplicationStatus::Offer => "offer",
            ApplicationStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown application status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for ApplicationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ApplicationStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownStatus(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: ApplicationStatus,
    pub date: DateTime<Utc>,
}

/// One tracked application, keyed naturally by (user_id, company, position).
///
/// `status_history` is append-only and never empty; its last entry always
/// carries the current `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobApplication {
    pub id: Uuid,
    pub user_id: String,
    pub company: String,
    pub position: String,
    pub status: ApplicationStatus,
    pub application_date: DateTime<Utc>,
    pub status_history: Vec<StatusEntry>,
    pub logo: Option<String>,
}

impl JobApplication {
    pub fn new(
        user_id: impl Into<String>,
        company: impl Into<String>,
        position: impl Into<String>,
        status: ApplicationStatus,
        date: DateTime<Utc>,
        logo: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            company: company.into(),
            position: position.into(),
            status,
            application_date: date,
            status_history: vec![StatusEntry { status, date }],
            logo,
        }
    }

    pub fn record_status(&mut self, status: ApplicationStatus, date: DateTime<Utc>) {
        self.status = status;
        self.status_history.push(StatusEntry { status, date });
    }

    pub fn application_day(&self) -> NaiveDate {
        calendar_day(self.application_date)
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.status_history
            .last()
            .map(|entry| entry.date)
            .unwrap_or(self.application_date)
    }

    pub fn matches_key(&self, user_id: &str, company: &str, position: &str) -> bool {
        self.user_id == user_id && self.company == company && self.position == position
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub day: NaiveDate,
    pub total: u64,
}

/// Cached cumulative-applications projection stored on the user record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CumulativeChart {
    pub points: Vec<ChartPoint>,
}

impl CumulativeChart {
    pub fn x(&self) -> Vec<String> {
        self.points.iter().map(|p| p.day.to_string()).collect()
    }

    pub fn y(&self) -> Vec<u64> {
        self.points.iter().map(|p| p.total).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
    pub xp: u64,
    /// Unlocked achievement names in unlock order.
    pub achievements: Vec<String>,
    pub current_streak: u32,
    pub friends: Vec<String>,
    pub invite_code: String,
    /// Watermark for the email source; `None` until the first successful fetch.
    pub last_fetched: Option<DateTime<Utc>>,
    pub chart: CumulativeChart,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        email: Option<String>,
        invite_code: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            email,
            xp: 0,
            achievements: Vec::new(),
            current_streak: 0,
            friends: Vec::new(),
            invite_code: invite_code.into(),
            last_fetched: None,
            chart: CumulativeChart::default(),
            created_at,
        }
    }

    pub fn level(&self) -> u64 {
        level_for_xp(self.xp)
    }

    pub fn has_achievement(&self, name: &str) -> bool {
        self.achievements.iter().any(|a| a == name)
    }
}

pub fn level_for_xp(xp: u64) -> u64 {
    xp / XP_PER_LEVEL + 1
}

/// Reference achievement definition; unlock predicates are keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Achievement {
    pub name: String,
    pub description: String,
    pub xp_reward: u64,
}

impl Achievement {
    pub fn new(name: &str, description: &str, xp_reward: u64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            xp_reward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteCode {
    pub code: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Mail-source handoff contract into the refresh pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl EmailMessage {
    /// Flattened form handed to the classifier.
    pub fn prompt_text(&self) -> String {
        format!(
            "Sender: {}\nSubject: {}\nBody: {}",
            self.sender, self.subject, self.body
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedApplication {
    pub company: String,
    pub position: String,
    pub status: ApplicationStatus,
    pub logo: Option<String>,
}

/// Classifier verdict for one email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    Classified(ClassifiedApplication),
    Indeterminate,
}

impl Classification {
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Classification::Indeterminate)
    }
}

/// Calendar-day bucketing used by streaks, achievements and charts. Days are
/// UTC days everywhere.
pub fn calendar_day(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}
