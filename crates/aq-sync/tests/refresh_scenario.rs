use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aq_adapters::{AdapterError, Classifier, EmailSource};
use aq_core::{
    Achievement, ApplicationStatus, Classification, ClassifiedApplication, CumulativeChart,
    EmailMessage, JobApplication, StatusEntry, UserRecord, XP_PER_APPLICATION,
};
use aq_storage::{
    AchievementStore, ApplicationStore, InviteCodeStore, LogoTable, MemoryStore, Store,
    StoreError, StoreResult, UserCreation, UserStore,
};
use aq_sync::accounts::{ensure_user, NewUser};
use aq_sync::reconcile::{FIRST_APPLICATION, FIRST_INTERVIEW, FIRST_RESPONSE};
use aq_sync::{default_catalogue, Clock, RefreshConfig, RefreshError, RefreshPipeline};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

fn at(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).single().unwrap()
}

struct TestClock(Mutex<DateTime<Utc>>);

impl TestClock {
    fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Mailbox that honours the watermark like the Gmail source does.
#[derive(Default)]
struct Mailbox {
    emails: Mutex<Vec<EmailMessage>>,
    requested_since: Mutex<Vec<DateTime<Utc>>>,
    fail: bool,
}

impl Mailbox {
    fn deliver(&self, email: EmailMessage) {
        self.emails.lock().unwrap().push(email);
    }
}

#[async_trait]
impl EmailSource for Mailbox {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<EmailMessage>, AdapterError> {
        self.requested_since.lock().unwrap().push(since);
        if self.fail {
            return Err(AdapterError::Payload("gmail unavailable".into()));
        }
        Ok(self
            .emails
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect())
    }
}

/// Canned verdicts keyed by email id; unknown ids are upstream failures.
#[derive(Default)]
struct ScriptedClassifier {
    verdicts: HashMap<String, Classification>,
}

impl ScriptedClassifier {
    fn with(mut self, id: &str, verdict: Classification) -> Self {
        self.verdicts.insert(id.to_string(), verdict);
        self
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, email: &EmailMessage) -> Result<Classification, AdapterError> {
        self.verdicts.get(&email.id).cloned().ok_or_else(|| AdapterError::HttpStatus {
            status: 529,
            url: "https://api.anthropic.com/v1/messages".into(),
            body: "overloaded".into(),
        })
    }
}

fn email(id: &str, sender: &str, subject: &str, timestamp: DateTime<Utc>) -> EmailMessage {
    EmailMessage {
        id: id.into(),
        sender: sender.into(),
        subject: subject.into(),
        body: String::new(),
        timestamp,
    }
}

fn salesforce(status: ApplicationStatus) -> Classification {
    Classification::Classified(ClassifiedApplication {
        company: "Salesforce".into(),
        position: "Software Engineer Intern".into(),
        status,
        logo: None,
    })
}

fn classifier() -> ScriptedClassifier {
    ScriptedClassifier::default()
        .with("oracle-draft", Classification::Indeterminate)
        .with("sf-applied", salesforce(ApplicationStatus::Applied))
        .with("sf-interview", salesforce(ApplicationStatus::Interview))
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<TestClock>,
    pipeline: RefreshPipeline,
}

async fn harness(classifier: ScriptedClassifier, start: DateTime<Utc>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let identity = NewUser {
        user_id: "u1".into(),
        name: "Sanjay".into(),
        email: Some("sanjay@example.com".into()),
    };
    ensure_user(store.as_ref(), &identity, start).await.unwrap();

    let clock = Arc::new(TestClock(Mutex::new(start)));
    let pipeline = RefreshPipeline::new(
        store.clone() as Arc<dyn Store>,
        Arc::new(classifier),
        Arc::new(LogoTable::builtin()),
        RefreshConfig::default(),
    )
    .with_clock(clock.clone());
    Harness {
        store,
        clock,
        pipeline,
    }
}

#[tokio::test]
async fn three_email_salesforce_scenario() {
    let h = harness(classifier(), at(2, 15)).await;
    let mailbox = Mailbox::default();
    mailbox.deliver(email(
        "oracle-draft",
        "GSRecruiting@oracle.com",
        "Continue to apply for the job 2026 | Americas | Summer Analyst",
        at(2, 9),
    ));
    mailbox.deliver(email(
        "sf-applied",
        "salesforce@myworkday.com",
        "Great News! We've Received Your Application",
        at(2, 10),
    ));

    let first = h.pipeline.run("u1", &mailbox).await.unwrap();
    assert_eq!(first.emails_processed, 2);
    assert_eq!((first.created, first.updated, first.skipped, first.failed), (1, 0, 1, 0));
    assert_eq!(first.unlocked, vec![FIRST_APPLICATION.to_string()]);
    assert_eq!(first.xp, XP_PER_APPLICATION + 50);
    assert_eq!(first.current_streak, 1);

    let apps = h.store.list_applications("u1").await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].company, "Salesforce");
    assert_eq!(apps[0].application_date, at(2, 10));
    assert_eq!(
        apps[0].logo.as_deref(),
        Some("https://logo.clearbit.com/salesforce.com")
    );

    h.clock.set(at(4, 18));
    mailbox.deliver(email(
        "sf-interview",
        "salesforce@myworkday.com",
        "Interview invitation: Software Engineer Intern",
        at(4, 16),
    ));

    let second = h.pipeline.run("u1", &mailbox).await.unwrap();
    assert_eq!(second.emails_processed, 1, "older emails are behind the watermark");
    assert_eq!((second.created, second.updated), (0, 1));
    assert_eq!(
        second.unlocked,
        vec![FIRST_RESPONSE.to_string(), FIRST_INTERVIEW.to_string()]
    );
    assert_eq!(second.xp, XP_PER_APPLICATION + 50 + 50 + 150);
    assert_eq!(second.current_streak, 0, "no application dated today");

    let apps = h.store.list_applications("u1").await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].status, ApplicationStatus::Interview);
    let history: Vec<_> = apps[0].status_history.iter().map(|e| (e.status, e.date)).collect();
    assert_eq!(
        history,
        vec![
            (ApplicationStatus::Applied, at(2, 10)),
            (ApplicationStatus::Interview, at(4, 16)),
        ]
    );

    let user = h.store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.xp, second.xp);
    assert_eq!(
        user.achievements,
        vec![FIRST_APPLICATION, FIRST_RESPONSE, FIRST_INTERVIEW]
    );
    assert_eq!(user.last_fetched, Some(at(4, 18)));
    assert_eq!(user.chart.x(), vec!["2026-03-02".to_string()]);
    assert_eq!(user.chart.y(), vec![1]);

    let requested = mailbox.requested_since.lock().unwrap().clone();
    assert_eq!(requested, vec![at(2, 15) - Duration::days(7), at(2, 15)]);
}

#[tokio::test]
async fn empty_batches_change_nothing() {
    let h = harness(classifier(), at(2, 15)).await;
    let mailbox = Mailbox::default();
    mailbox.deliver(email("sf-applied", "salesforce@myworkday.com", "Received", at(2, 10)));
    h.pipeline.run("u1", &mailbox).await.unwrap();
    let before = h.store.get_user("u1").await.unwrap().unwrap();
    let apps_before = h.store.list_applications("u1").await.unwrap();

    for hour in [16, 17, 18] {
        h.clock.set(at(2, hour));
        let summary = h.pipeline.run("u1", &mailbox).await.unwrap();
        assert_eq!(summary.emails_processed, 0);
        assert!(summary.unlocked.is_empty());
        assert_eq!(summary.xp, before.xp);
    }

    let after = h.store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(after.xp, before.xp);
    assert_eq!(after.achievements, before.achievements);
    assert_eq!(h.store.list_applications("u1").await.unwrap(), apps_before);
}

#[tokio::test]
async fn xp_never_decreases_across_refreshes() {
    let scripted = (0..6).fold(ScriptedClassifier::default(), |c, i| {
        c.with(
            &format!("e{i}"),
            Classification::Classified(ClassifiedApplication {
                company: format!("Company {}", i % 3),
                position: "Analyst".into(),
                status: if i < 3 {
                    ApplicationStatus::Applied
                } else {
                    ApplicationStatus::Rejected
                },
                logo: None,
            }),
        )
    });
    let h = harness(scripted, at(2, 23)).await;
    let mailbox = Mailbox::default();

    let mut last_xp = 0;
    for i in 0..6u32 {
        mailbox.deliver(email(&format!("e{i}"), "jobs@example.com", "Update", at(2 + i, 12)));
        h.clock.set(at(2 + i, 23));
        let summary = h.pipeline.run("u1", &mailbox).await.unwrap();
        assert!(summary.xp >= last_xp, "xp went from {last_xp} to {}", summary.xp);
        last_xp = summary.xp;
    }

    let user = h.store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.xp, last_xp);
    assert!(user.achievements.iter().any(|a| a == "Consistency is Key"));
    assert_eq!(h.store.count_applications("u1").await.unwrap(), 3);
}

#[tokio::test]
async fn mail_failure_aborts_without_moving_watermark() {
    let h = harness(classifier(), at(2, 15)).await;
    let mailbox = Mailbox {
        fail: true,
        ..Mailbox::default()
    };

    let err = h.pipeline.run("u1", &mailbox).await.unwrap_err();
    assert!(matches!(err, RefreshError::MailSource(_)));

    let user = h.store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.last_fetched, None);
    assert_eq!(user.xp, 0);
}

#[tokio::test]
async fn classifier_failure_skips_only_that_email() {
    let h = harness(classifier(), at(2, 15)).await;
    let mailbox = Mailbox::default();
    mailbox.deliver(email("unknown-to-classifier", "x@example.com", "Hello", at(2, 8)));
    mailbox.deliver(email("sf-applied", "salesforce@myworkday.com", "Received", at(2, 10)));

    let summary = h.pipeline.run("u1", &mailbox).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.created, 1);
    assert_eq!(h.store.count_applications("u1").await.unwrap(), 1);
}

#[tokio::test]
async fn seeded_catalogue_is_used_over_defaults() {
    let h = harness(classifier(), at(2, 15)).await;
    for mut achievement in default_catalogue() {
        if achievement.name == FIRST_APPLICATION {
            achievement.xp_reward = 5;
        }
        h.store.put_achievement(&achievement).await.unwrap();
    }
    let mailbox = Mailbox::default();
    mailbox.deliver(email("sf-applied", "salesforce@myworkday.com", "Received", at(2, 10)));

    let summary = h.pipeline.run("u1", &mailbox).await.unwrap();
    assert_eq!(summary.xp, XP_PER_APPLICATION + 5);
}

#[tokio::test]
async fn unknown_user_is_rejected() {
    let h = harness(classifier(), at(2, 15)).await;
    let err = h.pipeline.run("ghost", &Mailbox::default()).await.unwrap_err();
    assert!(matches!(err, RefreshError::UnknownUser(id) if id == "ghost"));
}

/// Memory store that fails the `fail_insert_at`-th application insert
/// (1-based) and reports the first `taken_codes` invite codes as taken.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_insert_at: usize,
    inserts: AtomicUsize,
    taken_codes: AtomicUsize,
}

#[async_trait]
impl ApplicationStore for FlakyStore {
    async fn find_application(
        &self,
        user_id: &str,
        company: &str,
        position: &str,
    ) -> StoreResult<Option<JobApplication>> {
        self.inner.find_application(user_id, company, position).await
    }

    async fn insert_application(&self, application: &JobApplication) -> StoreResult<()> {
        if self.inserts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_insert_at {
            return Err(StoreError::Corrupt {
                id: application.id.to_string(),
                reason: "write rejected".into(),
            });
        }
        self.inner.insert_application(application).await
    }

    async fn append_status(&self, id: Uuid, entry: &StatusEntry) -> StoreResult<()> {
        self.inner.append_status(id, entry).await
    }

    async fn list_applications(&self, user_id: &str) -> StoreResult<Vec<JobApplication>> {
        self.inner.list_applications(user_id).await
    }

    async fn count_applications(&self, user_id: &str) -> StoreResult<usize> {
        self.inner.count_applications(user_id).await
    }
}

#[async_trait]
impl UserStore for FlakyStore {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>> {
        self.inner.get_user(user_id).await
    }

    async fn create_user(&self, user: &UserRecord) -> StoreResult<UserCreation> {
        let taken = self
            .taken_codes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            return Ok(UserCreation::InviteCodeTaken);
        }
        self.inner.create_user(user).await
    }

    async fn set_last_fetched(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.set_last_fetched(user_id, at).await
    }

    async fn save_progress(
        &self,
        user_id: &str,
        xp: u64,
        achievements: &[String],
    ) -> StoreResult<()> {
        self.inner.save_progress(user_id, xp, achievements).await
    }

    async fn set_current_streak(&self, user_id: &str, streak: u32) -> StoreResult<()> {
        self.inner.set_current_streak(user_id, streak).await
    }

    async fn set_chart(&self, user_id: &str, chart: &CumulativeChart) -> StoreResult<()> {
        self.inner.set_chart(user_id, chart).await
    }

    async fn add_friend(&self, user_id: &str, friend_id: &str) -> StoreResult<bool> {
        self.inner.add_friend(user_id, friend_id).await
    }
}

#[async_trait]
impl InviteCodeStore for FlakyStore {
    async fn resolve_invite_code(&self, code: &str) -> StoreResult<Option<String>> {
        self.inner.resolve_invite_code(code).await
    }
}

#[async_trait]
impl AchievementStore for FlakyStore {
    async fn list_achievements(&self) -> StoreResult<Vec<Achievement>> {
        self.inner.list_achievements().await
    }

    async fn put_achievement(&self, achievement: &Achievement) -> StoreResult<()> {
        self.inner.put_achievement(achievement).await
    }
}

fn sanjay() -> NewUser {
    NewUser {
        user_id: "u1".into(),
        name: "Sanjay".into(),
        email: None,
    }
}

#[tokio::test]
async fn store_failure_mid_batch_keeps_earlier_writes() {
    let store = Arc::new(FlakyStore {
        fail_insert_at: 3,
        ..FlakyStore::default()
    });
    ensure_user(store.as_ref(), &sanjay(), at(2, 15)).await.unwrap();

    let scripted = (0..4).fold(ScriptedClassifier::default(), |c, i| {
        c.with(
            &format!("e{i}"),
            Classification::Classified(ClassifiedApplication {
                company: format!("Company {i}"),
                position: "Analyst".into(),
                status: ApplicationStatus::Applied,
                logo: None,
            }),
        )
    });
    let pipeline = RefreshPipeline::new(
        store.clone() as Arc<dyn Store>,
        Arc::new(scripted),
        Arc::new(LogoTable::builtin()),
        RefreshConfig::default(),
    )
    .with_clock(Arc::new(TestClock(Mutex::new(at(2, 15)))));
    let mailbox = Mailbox::default();
    for i in 0..4u32 {
        mailbox.deliver(email(&format!("e{i}"), "jobs@example.com", "Received", at(2, 8 + i)));
    }

    let err = pipeline.run("u1", &mailbox).await.unwrap_err();
    assert!(
        matches!(err, RefreshError::Store { processed: 2, .. }),
        "unexpected error: {err:?}"
    );

    let companies: Vec<_> = store
        .list_applications("u1")
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.company)
        .collect();
    assert_eq!(companies, vec!["Company 0", "Company 1"]);
    let user = store.get_user("u1").await.unwrap().unwrap();
    assert_eq!(user.last_fetched, Some(at(2, 15)));
    assert_eq!(user.xp, 0, "reconciliation never ran");
}

#[tokio::test]
async fn ensure_user_retries_taken_invite_codes() {
    let store = FlakyStore {
        taken_codes: AtomicUsize::new(2),
        ..FlakyStore::default()
    };

    let user = ensure_user(&store, &sanjay(), at(2, 15)).await.unwrap();
    assert_eq!(store.taken_codes.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.resolve_invite_code(&user.invite_code).await.unwrap().as_deref(),
        Some("u1")
    );
    assert_eq!(store.get_user("u1").await.unwrap(), Some(user));
}
