//! Axum JSON API for ApplyQuest. Every route under `/api/v1` is
//! authenticated with a Firebase ID token; `/health` is open.

use std::sync::Arc;

use aq_adapters::MailSourceFactory;
use aq_core::{calendar_day, CumulativeChart};
use aq_storage::{AchievementStore, ApplicationStore};
use aq_sync::accounts::{add_friend_by_code, find_friend_by_name};
use aq_sync::{
    default_catalogue, read_models, AccountError, AddFriendOutcome, RefreshError, RefreshPipeline,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub mod auth;

pub use auth::{AuthError, AuthUser, FirebaseTokenVerifier, Identity, TokenVerifier};

pub const CRATE_NAME: &str = "aq-web";

pub struct AppState {
    pub pipeline: RefreshPipeline,
    pub verifier: Arc<dyn TokenVerifier>,
    pub mail: Arc<dyn MailSourceFactory>,
}

impl AppState {
    pub fn new(
        pipeline: RefreshPipeline,
        verifier: Arc<dyn TokenVerifier>,
        mail: Arc<dyn MailSourceFactory>,
    ) -> Self {
        Self {
            pipeline,
            verifier,
            mail,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("AQ_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/refresh/applications", post(refresh_handler))
        .route("/refresh_applications", post(refresh_handler))
        .route("/jobs_applied_dates", post(applied_dates_handler))
        .route("/user_chart", post(user_chart_handler))
        .route("/achievements", get(achievements_handler))
        .route("/add_friend", post(add_friend_handler))
        .route("/user_details", get(user_details_handler))
        .route("/friends", get(friends_handler))
        .route("/friend_user_chart", get(friend_chart_handler))
        .route("/application_status", get(application_status_handler));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1", api)
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({
        "status": "OK",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    access_token: Option<String>,
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> Response {
    let token = serde_json::from_slice::<RefreshRequest>(&body)
        .ok()
        .and_then(|req| req.access_token)
        .filter(|t| !t.trim().is_empty());
    let Some(token) = token else {
        return error_response(StatusCode::BAD_REQUEST, "Missing access_token in body");
    };

    let source = state.mail.for_token(&token);
    match state.pipeline.run(&user.user_id, source.as_ref()).await {
        Ok(summary) => Json(json!({
            "success": true,
            "message": format!("Processed {} emails", summary.emails_processed),
            "emailsProcessed": summary.emails_processed,
            "created": summary.created,
            "updated": summary.updated,
            "skipped": summary.skipped,
            "failed": summary.failed,
            "unlocked": summary.unlocked,
            "xp": summary.xp,
            "currentStreak": summary.current_streak,
        }))
        .into_response(),
        Err(err) => refresh_failure(err),
    }
}

fn refresh_failure(err: RefreshError) -> Response {
    let (status, processed) = match &err {
        RefreshError::MailSource(_) => (StatusCode::BAD_GATEWAY, 0),
        RefreshError::Store { processed, .. } => (StatusCode::INTERNAL_SERVER_ERROR, *processed),
        RefreshError::UnknownUser(_) => (StatusCode::NOT_FOUND, 0),
    };
    warn!(error = %err, status = status.as_u16(), "refresh failed");
    (
        status,
        Json(json!({
            "success": false,
            "message": err.to_string(),
            "emailsProcessed": processed,
        })),
    )
        .into_response()
}

async fn applied_dates_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Response {
    let today = calendar_day(state.pipeline.now());
    let store = state.pipeline.store().as_ref();
    match read_models::refresh_streak(store, &user.user_id, today).await {
        Ok(view) => Json(json!({
            "dates": view.dates,
            "currentStreak": view.current_streak,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

fn chart_json(chart: &CumulativeChart) -> Response {
    Json(json!({ "x": chart.x(), "y": chart.y() })).into_response()
}

async fn user_chart_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Response {
    match read_models::refresh_chart(state.pipeline.store().as_ref(), &user.user_id).await {
        Ok(chart) => chart_json(&chart),
        Err(err) => server_error(err),
    }
}

async fn achievements_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Response {
    let catalogue = match state.pipeline.store().list_achievements().await {
        Ok(list) if list.is_empty() => default_catalogue(),
        Ok(list) => list,
        Err(err) => return server_error(err),
    };
    let achievements: Vec<_> = catalogue
        .iter()
        .map(|a| {
            json!({
                "name": a.name,
                "description": a.description,
                "xp": a.xp_reward,
                "completed": user.has_achievement(&a.name),
            })
        })
        .collect();
    Json(json!({ "achievements": achievements })).into_response()
}

#[derive(Debug, Deserialize)]
struct AddFriendRequest {
    invite_code: Option<String>,
}

async fn add_friend_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> Response {
    let code = serde_json::from_slice::<AddFriendRequest>(&body)
        .ok()
        .and_then(|req| req.invite_code)
        .filter(|c| !c.trim().is_empty());
    let Some(code) = code else {
        return error_response(StatusCode::BAD_REQUEST, "Missing invite_code in body");
    };

    match add_friend_by_code(state.pipeline.store().as_ref(), &user.user_id, &code).await {
        Ok(AddFriendOutcome::Added { .. }) => {
            Json(json!({ "success": true, "message": "Friend added successfully" })).into_response()
        }
        Ok(AddFriendOutcome::AlreadyFriends { .. }) => {
            Json(json!({ "success": true, "message": "Already friends" })).into_response()
        }
        Err(AccountError::InvalidInviteCode) => {
            error_response(StatusCode::NOT_FOUND, "Invalid invite code")
        }
        Err(AccountError::SelfFriend) => {
            error_response(StatusCode::BAD_REQUEST, "Cannot add yourself as a friend")
        }
        Err(err) => server_error(err),
    }
}

async fn user_details_handler(AuthUser(user): AuthUser) -> Response {
    Json(json!({
        "xp": user.xp,
        "level": user.level(),
        "invite_code": user.invite_code,
    }))
    .into_response()
}

async fn friends_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Response {
    match read_models::leaderboard(state.pipeline.store().as_ref(), &user).await {
        Ok(friends) => Json(json!({ "friends": friends })).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct FriendChartQuery {
    #[serde(rename = "friendName")]
    friend_name: Option<String>,
}

async fn friend_chart_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<FriendChartQuery>,
) -> Response {
    let Some(name) = query.friend_name.filter(|n| !n.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing friendName");
    };
    match find_friend_by_name(state.pipeline.store().as_ref(), &user, &name).await {
        Ok(Some(friend)) => chart_json(&friend.chart),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Friend not found"),
        Err(err) => server_error(err),
    }
}

async fn application_status_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Response {
    let mut applications = match state.pipeline.store().list_applications(&user.user_id).await {
        Ok(apps) => apps,
        Err(err) => return server_error(err),
    };
    applications.sort_by_key(|a| std::cmp::Reverse(a.last_updated()));

    let rows: Vec<_> = applications
        .iter()
        .map(|a| {
            json!({
                "icon": a.logo.as_deref().unwrap_or(""),
                "company_name": a.company,
                "position": a.position,
                "status": a.status,
                "last_updated": a.last_updated().to_rfc3339_opts(SecondsFormat::Secs, true),
            })
        })
        .collect();
    Json(json!({ "applications": rows })).into_response()
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub(crate) fn server_error(err: impl Into<anyhow::Error>) -> Response {
    let err = err.into();
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}
