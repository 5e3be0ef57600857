use std::collections::HashMap;
use std::sync::Arc;

use aq_core::UserRecord;
use aq_sync::accounts::{ensure_user, NewUser};
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{error_response, server_error, AppState};

const FIREBASE_KEYS_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";

/// Verified identity behind a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Identity {
    pub fn into_new_user(self) -> NewUser {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                self.email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.uid.clone());
        NewUser {
            user_id: self.uid,
            name,
            email: self.email,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization token required")]
    MissingToken,
    #[error("invalid authorization header format")]
    InvalidHeader,
    #[error("token verification failed: {0}")]
    Verification(String),
    #[error("could not load signing keys: {0}")]
    Keys(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Firebase ID-token verifier: RS256, audience = project id, issuer =
/// `securetoken.google.com/<project>`. Google's signing certificates are
/// cached by `kid` and refetched on a miss.
pub struct FirebaseTokenVerifier {
    project_id: String,
    keys_url: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, String>>,
}

impl FirebaseTokenVerifier {
    pub fn new(project_id: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            project_id: project_id.into(),
            keys_url: FIREBASE_KEYS_URL.to_string(),
            client,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let project_id = std::env::var("FIREBASE_PROJECT_ID")
            .map_err(|_| anyhow::anyhow!("FIREBASE_PROJECT_ID environment variable not set"))?;
        Ok(Self::new(project_id, client))
    }

    async fn refresh_keys(&self) -> Result<(), AuthError> {
        let keys: HashMap<String, String> = self
            .client
            .get(&self.keys_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::Keys(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Keys(e.to_string()))?;
        info!(count = keys.len(), "updated firebase public keys");
        *self.keys.write().await = keys;
        Ok(())
    }

    async fn key_for(&self, kid: &str) -> Result<String, AuthError> {
        if let Some(pem) = self.keys.read().await.get(kid) {
            return Ok(pem.clone());
        }
        self.refresh_keys().await?;
        self.keys
            .read()
            .await
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::Verification(format!("unknown key id {kid}")))
    }
}

#[async_trait]
impl TokenVerifier for FirebaseTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::Verification(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Verification("missing kid in token header".into()))?;
        let pem = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[format!("https://securetoken.google.com/{}", self.project_id)]);

        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::Verification(e.to_string()))?;
        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| AuthError::Verification(e.to_string()))?;

        Ok(Identity {
            uid: data.claims.sub,
            name: data.claims.name,
            email: data.claims.email,
        })
    }
}

pub(crate) fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let value = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidHeader)?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::InvalidHeader),
    }
}

/// Authenticated caller; the user record is created on first sight.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserRecord);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).map_err(|err| {
            warn!(error = %err, "rejected request");
            error_response(StatusCode::UNAUTHORIZED, err.to_string())
        })?;

        let identity = state.verifier.verify(token).await.map_err(|err| {
            warn!(error = %err, "token verification failed");
            error_response(StatusCode::UNAUTHORIZED, "token verification failed")
        })?;

        let store = state.pipeline.store();
        let user = ensure_user(store.as_ref(), &identity.into_new_user(), state.pipeline.now())
            .await
            .map_err(server_error)?;
        Ok(AuthUser(user))
    }
}
