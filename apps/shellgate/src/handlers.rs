use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::registry::{SessionEntry, SessionRegistry, UserIdentity};
use crate::ssh;

/// Header carrying the opaque session key on authenticated requests.
pub const SESSION_KEY_HEADER: &str = "session-key";

pub type SharedRegistry = Arc<SessionRegistry>;

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub cluster: String,
    pub username: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub session_key: String,
    pub home_path: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    active_sessions: usize,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: error.into() }))
}

/// POST /api/login - authenticate against a login node and register a session.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<(StatusCode, Json<LoginResponse>), (StatusCode, Json<ErrorBody>)> {
    let timeout = Duration::from_secs(state.config.ssh_connect_timeout_seconds);
    let handle = ssh::connect(
        &payload.host,
        payload.port,
        &payload.username,
        &payload.password,
        timeout,
    )
    .await
    .map_err(|err| {
        error!(host = %payload.host, user = %payload.username, error = %err, "login failed");
        let status = if err.to_string().contains("authentication failed") {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        error_response(status, err.to_string())
    })?;

    // Best effort: a session without a known home path is still usable.
    let home_path = match ssh::exec_capture(&handle, "pwd").await {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, "home path discovery failed");
            String::new()
        }
    };

    let key = SessionRegistry::generate_key(&payload.cluster, &payload.host);
    let identity = UserIdentity {
        username: payload.username.clone(),
        cluster: payload.cluster.clone(),
        home_path,
    };
    let entry = state
        .registry
        .insert(SessionEntry::new(key.clone(), handle, identity));
    info!(cluster = %payload.cluster, user = %payload.username, "session registered");

    Ok((
        StatusCode::CREATED,
        Json(LoginResponse {
            session_key: key,
            home_path: entry.identity.home_path.clone(),
        }),
    ))
}

/// GET /api/logout - drop the session named by the `session-key` header.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, (StatusCode, Json<ErrorBody>)> {
    let key = session_key_from(&headers)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "session key header is required"))?;

    let Some(entry) = state.registry.remove(&key) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "user not logged in"));
    };
    ssh::disconnect(&entry.handle).await;
    info!(
        cluster = %entry.identity.cluster,
        user = %entry.identity.username,
        opened_at = %entry.created_at,
        "session closed"
    );

    Ok(Json(LogoutResponse {
        message: "logout success",
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        active_sessions: state.registry.len(),
    })
}

pub fn session_key_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}
