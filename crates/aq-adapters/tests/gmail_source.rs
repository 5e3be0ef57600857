use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aq_adapters::{AdapterError, BackoffPolicy, EmailSource, GmailConfig, GmailSource};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

fn fixture(name: &str) -> Value {
    let path = format!("{}/../../fixtures/gmail/{name}", env!("CARGO_MANIFEST_DIR"));
    let text = std::fs::read_to_string(&path).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[derive(Default)]
struct FakeGmail {
    list_calls: AtomicUsize,
    fail_first_lists: usize,
    last_query: std::sync::Mutex<String>,
}

async fn list(
    State(state): State<Arc<FakeGmail>>,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer ya29.token") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let call = state.list_calls.fetch_add(1, Ordering::SeqCst);
    if call < state.fail_first_lists {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    *state.last_query.lock().unwrap() = params.get("q").cloned().unwrap_or_default();
    Json(json!({
        "messages": [
            {"id": "18f0b2oracle", "threadId": "18f0b2oracle"},
            {"id": "18f0a1salesforce", "threadId": "18f0a1salesforce"}
        ],
        "resultSizeEstimate": 2
    }))
    .into_response()
}

async fn get_message(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "18f0a1salesforce" => Json(fixture("salesforce_applied.json")).into_response(),
        "18f0b2oracle" => Json(fixture("oracle_html_only.json")).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn(state: Arc<FakeGmail>) -> String {
    let app = Router::new()
        .route("/messages", get(list))
        .route("/messages/{id}", get(get_message))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn source(base_url: String, token: &str, backoff: BackoffPolicy) -> GmailSource {
    GmailSource::new(
        reqwest::Client::new(),
        token,
        GmailConfig {
            base_url,
            ..GmailConfig::default()
        },
        backoff,
    )
}

#[tokio::test]
async fn fetch_returns_decoded_emails_oldest_first() {
    let state = Arc::new(FakeGmail::default());
    let base = spawn(state.clone()).await;
    let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();

    let emails = source(base, "ya29.token", BackoffPolicy::none())
        .fetch_since(since)
        .await
        .unwrap();

    assert_eq!(emails.len(), 2);
    assert_eq!(emails[0].id, "18f0a1salesforce");
    assert_eq!(emails[0].sender, "salesforce@myworkday.com");
    assert!(emails[0].subject.starts_with("Great News!"));
    assert!(emails[0].body.starts_with("Hi Sanjay Kumar, You have officially applied"));
    assert_eq!(
        emails[0].timestamp,
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    );

    assert_eq!(emails[1].id, "18f0b2oracle");
    assert_eq!(
        emails[1].body,
        "Thank you for completing the online assessment for Data Analyst."
    );

    let q = state.last_query.lock().unwrap().clone();
    assert_eq!(q, format!("in:inbox after:{}", since.timestamp()));
}

#[tokio::test]
async fn emails_at_or_before_watermark_are_dropped() {
    let state = Arc::new(FakeGmail::default());
    let base = spawn(state).await;
    let since = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();

    let emails = source(base, "ya29.token", BackoffPolicy::none())
        .fetch_since(since)
        .await
        .unwrap();

    let ids: Vec<_> = emails.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["18f0b2oracle"]);
}

#[tokio::test]
async fn transient_list_failures_are_retried() {
    let state = Arc::new(FakeGmail {
        fail_first_lists: 2,
        ..FakeGmail::default()
    });
    let base = spawn(state.clone()).await;
    let backoff = BackoffPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    };
    let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();

    let emails = source(base, "ya29.token", backoff).fetch_since(since).await.unwrap();

    assert_eq!(emails.len(), 2);
    assert_eq!(state.list_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejected_token_fails_the_fetch() {
    let state = Arc::new(FakeGmail::default());
    let base = spawn(state).await;
    let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();

    let err = source(base, "expired", BackoffPolicy::default())
        .fetch_since(since)
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::HttpStatus { status: 401, .. }));
}

/// Lists `m3, m2, m1` (newest first) in pages of `maxResults`, using the
/// offset as the page token.
#[derive(Default)]
struct PagedGmail {
    list_calls: AtomicUsize,
}

const PAGED_IDS: [&str; 3] = ["m3", "m2", "m1"];

async fn paged_list(
    State(state): State<Arc<PagedGmail>>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    state.list_calls.fetch_add(1, Ordering::SeqCst);
    let size: usize = params.get("maxResults").and_then(|v| v.parse().ok()).unwrap_or(100);
    let offset: usize = params.get("pageToken").and_then(|v| v.parse().ok()).unwrap_or(0);
    let end = (offset + size).min(PAGED_IDS.len());
    let messages: Vec<_> = PAGED_IDS[offset..end].iter().map(|id| json!({ "id": id })).collect();
    let mut body = json!({ "messages": messages });
    if end < PAGED_IDS.len() {
        body["nextPageToken"] = json!(end.to_string());
    }
    Json(body).into_response()
}

async fn paged_message(Path(id): Path<String>) -> Response {
    let Some(n) = id.strip_prefix('m').and_then(|n| n.parse::<u32>().ok()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let received = Utc.with_ymd_and_hms(2026, 3, 2, 8 + n, 0, 0).single().unwrap();
    Json(json!({
        "id": id,
        "internalDate": received.timestamp_millis().to_string(),
        "snippet": format!("Application update {n}"),
        "payload": {
            "mimeType": "text/plain",
            "headers": [{ "name": "Subject", "value": format!("Update {n}") }]
        }
    }))
    .into_response()
}

#[tokio::test]
async fn backlog_larger_than_a_page_is_fetched_in_full_oldest_first() {
    let state = Arc::new(PagedGmail::default());
    let app = Router::new()
        .route("/messages", get(paged_list))
        .route("/messages/{id}", get(paged_message))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let gmail = GmailSource::new(
        reqwest::Client::new(),
        "ya29.token",
        GmailConfig {
            base_url: format!("http://{addr}"),
            page_size: 2,
            ..GmailConfig::default()
        },
        BackoffPolicy::none(),
    );
    let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();

    let emails = gmail.fetch_since(since).await.unwrap();

    let ids: Vec<_> = emails.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert_eq!(emails[0].body, "Application update 1");
    assert_eq!(state.list_calls.load(Ordering::SeqCst), 2);
}
