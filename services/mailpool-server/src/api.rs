//! Local JSON API for the UI
//!
//! One route per client operation. Handlers parse their own bodies so that
//! malformed input gets the same error envelope as every other failure.

use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use mail_client::{ApiClient, CreateInboxOptions, Mode, SendEmailOptions, WaitOptions};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::ApiError;
use crate::notifications::NotificationLog;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub client: ApiClient,
    pub notifications: NotificationLog,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

type ApiResult = Result<Response, ApiError>;

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds the number of requests handled at once.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/inboxes", get(list_inboxes).post(create_inbox))
        .route("/inboxes/{id}", get(get_inbox).delete(delete_inbox))
        .route("/inboxes/{id}/emails", get(list_emails).post(send_email))
        .route("/inboxes/{id}/wait", get(wait_for_latest_email))
        .route("/emails/{id}", get(get_email).delete(delete_email))
        .route("/attachments/{id}", get(download_attachment))
        .route("/mode", get(get_mode).put(switch_mode))
        .route("/personal-credential", put(set_personal_credential))
        .route("/settings/timeouts", get(get_timeouts).put(set_timeouts))
        .route("/pool", get(pool_status))
        .route("/pool/reset", post(reset_pool))
        .route("/pool/keys/{index}", put(replace_pool_key))
        .route("/pool/keys/{index}/check", post(check_pool_key))
        .route("/pool/check", post(check_all_pool_keys))
        .route("/usage", get(key_usage))
        .route("/account", get(account_status))
        .route("/notifications", get(recent_notifications))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    crate::metrics::record_request(
        response.status().as_u16(),
        &route,
        started.elapsed().as_secs_f64(),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (status, [(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn ok<T: Serialize>(value: &T) -> ApiResult {
    Ok(json_response(StatusCode::OK, value))
}

/// Parse a JSON body; an empty body yields the type's default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("malformed JSON body: {e}")))
}

fn parse_index(raw: &str) -> Result<usize, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("key index must be a non-negative integer, got: {raw}")))
}

// --- inboxes and emails ---

async fn list_inboxes(State(state): State<AppState>) -> ApiResult {
    ok(&state.client.list_inboxes().await?)
}

async fn create_inbox(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let options: CreateInboxOptions = parse_body(&body)?;
    let inbox = state.client.create_inbox(options).await?;
    Ok(json_response(StatusCode::CREATED, &inbox))
}

async fn get_inbox(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(&state.client.get_inbox(&id).await?)
}

async fn delete_inbox(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.client.delete_inbox(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_emails(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(&state.client.list_emails(&id).await?)
}

async fn send_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let options: SendEmailOptions = parse_body(&body)?;
    ok(&state.client.send_email(&id, options).await?)
}

#[derive(Debug, Default, Deserialize)]
struct WaitQuery {
    #[serde(default)]
    unread_only: bool,
    timeout_secs: Option<u64>,
}

async fn wait_for_latest_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult {
    let options = WaitOptions {
        timeout: query.timeout_secs.map(Duration::from_secs),
        unread_only: query.unread_only,
    };
    ok(&state.client.wait_for_latest_email(&id, options).await?)
}

async fn get_email(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(&state.client.get_email(&id).await?)
}

async fn delete_email(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.client.delete_email(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn download_attachment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let attachment = state.client.download_attachment(&id).await?;
    let content_type = attachment
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    Ok((StatusCode::OK, [(CONTENT_TYPE, content_type)], attachment.bytes).into_response())
}

// --- mode and credentials ---

#[derive(Debug, Serialize)]
struct ModeBody {
    mode: Mode,
}

#[derive(Debug, Default, Deserialize)]
struct ModeRequest {
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SecretRequest {
    secret: Option<String>,
}

/// Announce reachability after a credential change without holding up the
/// response.
fn refresh_connection(client: &ApiClient) {
    let client = client.clone();
    tokio::spawn(async move {
        client.check_connection().await;
    });
}

async fn get_mode(State(state): State<AppState>) -> ApiResult {
    ok(&ModeBody {
        mode: state.client.get_mode().await,
    })
}

async fn switch_mode(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: ModeRequest = parse_body(&body)?;
    let mode: Mode = request
        .mode
        .ok_or_else(|| ApiError::BadRequest("mode is required".into()))?
        .parse()?;
    state.client.switch_mode(mode).await?;
    info!(mode = %mode, "mode switched");
    refresh_connection(&state.client);
    ok(&ModeBody { mode })
}

async fn set_personal_credential(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: SecretRequest = parse_body(&body)?;
    let installed = request.secret.as_deref().is_some_and(|s| !s.trim().is_empty());
    state.client.set_personal_credential(request.secret).await?;
    info!(installed, "personal credential updated");
    refresh_connection(&state.client);
    ok(&ModeBody {
        mode: state.client.get_mode().await,
    })
}

#[derive(Debug, Serialize)]
struct TimeoutsBody {
    http_timeout_secs: u64,
    email_wait_timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TimeoutsRequest {
    http_timeout_secs: Option<u64>,
    email_wait_timeout_secs: Option<u64>,
}

async fn timeouts_body(client: &ApiClient) -> TimeoutsBody {
    let (http, wait) = client.timeouts().await;
    TimeoutsBody {
        http_timeout_secs: http.as_secs(),
        email_wait_timeout_secs: wait.as_secs(),
    }
}

async fn get_timeouts(State(state): State<AppState>) -> ApiResult {
    ok(&timeouts_body(&state.client).await)
}

async fn set_timeouts(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: TimeoutsRequest = parse_body(&body)?;
    if let Some(secs) = request.http_timeout_secs {
        state
            .client
            .set_http_timeout(Duration::from_secs(secs))
            .await?;
    }
    if let Some(secs) = request.email_wait_timeout_secs {
        state
            .client
            .set_email_wait_timeout(Duration::from_secs(secs))
            .await?;
    }
    ok(&timeouts_body(&state.client).await)
}

// --- pool administration ---

async fn pool_status(State(state): State<AppState>) -> ApiResult {
    ok(&state.client.get_pool_status().await)
}

async fn reset_pool(State(state): State<AppState>) -> ApiResult {
    state.client.reset_pool().await;
    ok(&state.client.get_pool_status().await)
}

async fn replace_pool_key(
    State(state): State<AppState>,
    Path(index): Path<String>,
    body: Bytes,
) -> ApiResult {
    let index = parse_index(&index)?;
    let request: SecretRequest = parse_body(&body)?;
    let secret = request
        .secret
        .ok_or_else(|| ApiError::BadRequest("secret is required".into()))?;
    state.client.replace_pool_key(index, &secret).await?;
    ok(&state.client.get_pool_status().await)
}

async fn check_pool_key(State(state): State<AppState>, Path(index): Path<String>) -> ApiResult {
    let index = parse_index(&index)?;
    ok(&state.client.check_pool_key(index).await?)
}

async fn check_all_pool_keys(State(state): State<AppState>) -> ApiResult {
    ok(&state.client.check_all_pool_keys().await?)
}

async fn key_usage(State(state): State<AppState>) -> ApiResult {
    ok(&state.client.get_key_usage_info().await?)
}

async fn account_status(State(state): State<AppState>) -> ApiResult {
    ok(&state.client.check_account_status().await?)
}

async fn recent_notifications(State(state): State<AppState>) -> ApiResult {
    ok(&state.notifications.recent().await)
}

/// Pool health: 200 while at least one key is available, 503 otherwise.
/// Health follows the credentials the current mode can actually use. The
/// pool's own verdict is always reported as `pool_status`.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mode = state.client.get_mode().await;
    let personal = state.client.has_personal_credential().await;
    let mut body = state.client.pool().health().await;
    let pool_status = body["status"].as_str().unwrap_or("unhealthy").to_string();

    let label = match mode {
        Mode::Personal if personal => "healthy",
        Mode::Personal => "unhealthy",
        Mode::Combined if personal && pool_status == "unhealthy" => "degraded",
        _ => pool_status.as_str(),
    };
    let status = if label == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    body["status"] = serde_json::Value::from(label);
    body["pool_status"] = serde_json::Value::from(pool_status.as_str());
    body["mode"] = serde_json::Value::from(mode.as_str());
    body["uptime_seconds"] = serde_json::Value::from(state.started_at.elapsed().as_secs());
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
