//! HTTP surface: Telegram webhook, health probe and the admin JSON API.

use crate::pipeline::{CaptionPipeline, RegenerateError};
use crate::{update_mode_name, Services};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use gauguin_config::{token_fingerprint, Config, UpdateMode};
use gauguin_scheduler::PollScheduler;
use gauguin_storage::Storage;
use gauguin_telegram::TelegramUpdate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

type ApiError = (StatusCode, Json<Value>);

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub config_ok: bool,
    pub config_error: Option<String>,
    pub bot_token_fp: Option<String>,
    pub update_mode: Option<String>,
    pub webhook_configured: bool,
    pub webhook_error: Option<String>,
}

impl HealthStatus {
    pub fn ok(bot_token_fp: String, update_mode: &str) -> Self {
        Self {
            status: "ok".to_string(),
            config_ok: true,
            config_error: None,
            bot_token_fp: Some(bot_token_fp),
            update_mode: Some(update_mode.to_string()),
            webhook_configured: false,
            webhook_error: None,
        }
    }

    pub fn config_error(error: String) -> Self {
        Self {
            status: "ok".to_string(),
            config_ok: false,
            config_error: Some(error),
            bot_token_fp: None,
            update_mode: None,
            webhook_configured: false,
            webhook_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSecrets {
    pub path_secret: String,
    pub secret_token: String,
}

/// Shared state for HTTP handlers. Every service is optional so the server can
/// still answer `/health` when configuration is broken.
#[derive(Clone)]
pub struct AppState {
    pub health: Arc<RwLock<HealthStatus>>,
    pub webhook: Option<WebhookSecrets>,
    pub admin_token: Option<String>,
    pub pipeline: Option<Arc<CaptionPipeline>>,
    pub scheduler: Option<Arc<PollScheduler>>,
    pub storage: Option<Arc<Mutex<Storage>>>,
}

impl AppState {
    pub fn degraded(error: String) -> Self {
        Self {
            health: Arc::new(RwLock::new(HealthStatus::config_error(error))),
            webhook: None,
            admin_token: None,
            pipeline: None,
            scheduler: None,
            storage: None,
        }
    }

    pub fn ready(config: &Config, services: &Services) -> Self {
        let mode = config.telegram.update_mode;
        let webhook = (mode == UpdateMode::Webhook).then(|| WebhookSecrets {
            path_secret: config.webhook.path_secret.clone(),
            secret_token: config.webhook.secret_token.clone(),
        });
        Self {
            health: Arc::new(RwLock::new(HealthStatus::ok(
                token_fingerprint(&config.telegram.bot_token),
                update_mode_name(mode),
            ))),
            webhook,
            admin_token: config.admin.token.clone().filter(|t| !t.trim().is_empty()),
            pipeline: Some(services.pipeline.clone()),
            scheduler: services.scheduler.clone(),
            storage: services.storage.clone(),
        }
    }

    pub fn health_snapshot(&self) -> HealthStatus {
        self.health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_health(&self, update: impl FnOnce(&mut HealthStatus)) {
        let mut health = self.health.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut health);
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "ok": false, "error": message })))
}

/// Bearer check for `/admin/*`. Without a configured token the admin API is off.
fn check_admin(headers: &HeaderMap, admin_token: &Option<String>) -> Result<(), ApiError> {
    let Some(expected) = admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(api_error(StatusCode::FORBIDDEN, "admin API disabled"));
    };

    let value = headers
        .get("authorization")
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing Authorization header"))?
        .to_str()
        .map_err(|_| api_error(StatusCode::UNAUTHORIZED, "invalid Authorization header"))?;

    match value.strip_prefix("Bearer ") {
        Some(token) if constant_time_eq(token, expected) => Ok(()),
        _ => Err(api_error(StatusCode::UNAUTHORIZED, "invalid token")),
    }
}

async fn root() -> &'static str {
    "OK"
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.health_snapshot())
}

/// `POST /webhook/{path_secret}`. The answer only acknowledges receipt.
async fn webhook(
    State(state): State<AppState>,
    Path(path_secret): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let Some(pipeline) = &state.pipeline else {
        return api_error(StatusCode::SERVICE_UNAVAILABLE, "not ready");
    };
    let Some(secrets) = &state.webhook else {
        return api_error(StatusCode::NOT_FOUND, "webhook disabled");
    };
    if !constant_time_eq(&path_secret, &secrets.path_secret) {
        return api_error(StatusCode::NOT_FOUND, "not found");
    }

    let header = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(header, &secrets.secret_token) {
        warn!("Webhook call with invalid secret token");
        return api_error(StatusCode::FORBIDDEN, "forbidden");
    }

    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Malformed webhook update: {}", e);
            return api_error(StatusCode::BAD_REQUEST, "bad update");
        }
    };

    let worker = Arc::clone(pipeline);
    pipeline.spawn_tracked(async move {
        worker.process_update(update).await;
    });
    (StatusCode::OK, Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct PostsQuery {
    limit: Option<usize>,
}

/// `GET /admin/posts?limit=N`
async fn admin_posts(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<PostsQuery>,
) -> Result<Json<Value>, ApiError> {
    check_admin(&headers, &state.admin_token)?;
    let storage = state
        .storage
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "ledger disabled"))?;
    let limit = query.limit.unwrap_or(20).clamp(1, 200);

    let storage = storage.lock().await;
    let internal = |e: anyhow::Error| {
        error!("Admin ledger query failed: {:#}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger query failed")
    };
    let posts = storage.recent_posts(limit).map_err(internal)?;
    let polls = storage.recent_polls(limit).map_err(internal)?;

    Ok(Json(json!({ "ok": true, "posts": posts, "polls": polls })))
}

#[derive(Debug, Default, Deserialize)]
struct PollRunRequest {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    channel_id: Option<i64>,
}

/// `POST /admin/poll/run`, body `{force?, channel_id?}` (may be empty).
async fn admin_poll_run(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    check_admin(&headers, &state.admin_token)?;
    let request: PollRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PollRunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| api_error(StatusCode::BAD_REQUEST, "bad request body"))?
    };
    let scheduler = state
        .scheduler
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "ledger disabled"))?;

    info!(force = request.force, channel_id = ?request.channel_id, "Manual daily poll run");
    let outcome = scheduler
        .run_once(Utc::now(), request.force, request.channel_id)
        .await
        .map_err(|e| {
            error!("Manual daily poll run failed: {:#}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "poll run failed")
        })?;

    Ok(Json(json!({ "ok": outcome.is_posted(), "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
struct RegenerateRequest {
    channel_id: i64,
    message_id: i64,
}

/// `POST /admin/caption/regenerate`, body `{channel_id, message_id}`.
async fn admin_regenerate(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    check_admin(&headers, &state.admin_token)?;
    let request: RegenerateRequest = serde_json::from_slice(&body)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "expected {channel_id, message_id}"))?;
    let pipeline = state
        .pipeline
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "not ready"))?;

    match pipeline
        .regenerate(request.channel_id, request.message_id)
        .await
    {
        Ok(outcome) => Ok(Json(json!({
            "ok": matches!(outcome, crate::pipeline::CommentOutcome::Sent { .. }),
            "outcome": outcome,
        }))),
        Err(e) => {
            let status = match e {
                RegenerateError::LedgerDisabled => StatusCode::SERVICE_UNAVAILABLE,
                RegenerateError::PostNotFound | RegenerateError::DiscussionNotFound => {
                    StatusCode::NOT_FOUND
                }
                RegenerateError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                RegenerateError::Download(_) | RegenerateError::Caption(_) => {
                    StatusCode::BAD_GATEWAY
                }
            };
            warn!(
                channel_id = request.channel_id,
                message_id = request.message_id,
                "Caption regeneration failed: {}", e
            );
            Err(api_error(status, &e.to_string()))
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/webhook/{path_secret}", post(webhook))
        .route("/admin/posts", get(admin_posts))
        .route("/admin/poll/run", post(admin_poll_run))
        .route("/admin/caption/regenerate", post(admin_regenerate))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
