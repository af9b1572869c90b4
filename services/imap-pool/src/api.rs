//! HTTP front for the pool
//!
//! Endpoints:
//! - POST /v1/execute  run one IMAP command on a pooled Transient session
//! - POST /v1/idle     wait for server pushes on a dedicated Push session
//! - GET  /v1/pool     occupancy snapshot
//!
//! Credentials travel with every request and are only used if a new session
//! has to be opened. A session that fails mid-command is discarded rather
//! than returned to the pool.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use imap_session::Status;
use serde::Deserialize;
use session_pool::{Credentials, Error, Pool, Purpose};
use tracing::warn;

/// Longest IDLE a caller may ask for.
const MAX_IDLE: Duration = Duration::from_secs(29 * 60);

pub fn build_api_router(pool: Arc<Pool>) -> Router {
    Router::new()
        .route("/v1/execute", post(execute))
        .route("/v1/idle", post(idle))
        .route("/v1/pool", get(pool_snapshot))
        .with_state(pool)
}

#[derive(Deserialize)]
struct Login {
    account: String,
    /// Defaults to `account`.
    #[serde(default)]
    username: Option<String>,
    password: String,
}

impl Login {
    fn credentials(&self) -> Credentials {
        let username = self.username.as_deref().unwrap_or(&self.account);
        Credentials::new(username, self.password.as_str())
    }
}

#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(flatten)]
    login: Login,
    command: String,
}

#[derive(Deserialize)]
struct IdleRequest {
    #[serde(flatten)]
    login: Login,
    #[serde(default = "default_idle_secs")]
    timeout_secs: u64,
}

fn default_idle_secs() -> u64 {
    30
}

/// POST /v1/execute
async fn execute(State(pool): State<Arc<Pool>>, Json(req): Json<ExecuteRequest>) -> Response {
    if req.command.trim().is_empty() || req.command.contains(['\r', '\n']) {
        return bad_request("command must be a single non-empty line");
    }

    let credentials = req.login.credentials();
    let mut lease = match pool
        .acquire(&req.login.account, &credentials, Purpose::Transient)
        .await
    {
        Ok(lease) => lease,
        Err(e) => return pool_error(&e),
    };

    match lease.execute(&req.command).await {
        Ok(response) => {
            let reused = lease.was_reused();
            pool.release(lease).await;
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": status_label(response.status),
                    "untagged": response.untagged,
                    "completion": response.completion,
                    "reused_session": reused,
                })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(account = %req.login.account, error = %e, "command failed, discarding session");
            pool.discard(lease).await;
            session_error(&e)
        }
    }
}

/// POST /v1/idle
async fn idle(State(pool): State<Arc<Pool>>, Json(req): Json<IdleRequest>) -> Response {
    if req.timeout_secs == 0 {
        return bad_request("timeout_secs must be greater than 0");
    }
    let timeout = Duration::from_secs(req.timeout_secs).min(MAX_IDLE);

    let credentials = req.login.credentials();
    let mut lease = match pool
        .acquire(&req.login.account, &credentials, Purpose::Push)
        .await
    {
        Ok(lease) => lease,
        Err(e) => return pool_error(&e),
    };

    match lease.idle(timeout).await {
        Ok(untagged) => {
            pool.release(lease).await;
            (
                StatusCode::OK,
                Json(serde_json::json!({ "untagged": untagged })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(account = %req.login.account, error = %e, "idle failed, discarding session");
            pool.discard(lease).await;
            session_error(&e)
        }
    }
}

/// GET /v1/pool
async fn pool_snapshot(State(pool): State<Arc<Pool>>) -> impl IntoResponse {
    Json(pool.snapshot())
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Ok => "OK",
        Status::No => "NO",
        Status::Bad => "BAD",
    }
}

fn pool_error(err: &Error) -> Response {
    let status = match err {
        Error::Authentication(_) => StatusCode::UNAUTHORIZED,
        Error::Transport(_) => StatusCode::BAD_GATEWAY,
        Error::PoolExhausted { .. } | Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, err.label(), &err.to_string(), err.is_retryable())
}

fn session_error(err: &imap_session::SessionError) -> Response {
    error_body(StatusCode::BAD_GATEWAY, "session", &err.to_string(), true)
}

fn bad_request(message: &str) -> Response {
    error_body(StatusCode::BAD_REQUEST, "invalid_request", message, false)
}

fn error_body(status: StatusCode, kind: &str, message: &str, retryable: bool) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "type": kind,
                "message": message,
                "retryable": retryable,
            }
        })),
    )
        .into_response()
}
