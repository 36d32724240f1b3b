pub mod channels;
pub mod config;
pub mod db;
pub mod matcher;
pub mod processor;
pub mod queue;
pub mod scheduled;
pub mod scheduler;
pub mod throttle;
pub mod types;
pub mod vault;
pub mod worker;
pub mod ws;

pub use config::Config;

use self::channels::instagram::{self, InstagramClient};
use self::config::{load_config, resolve_database_url};
use self::db::DbKind;
use self::scheduler::{ApiError, ScheduleRequest};
use self::types::{ScheduledStatus, WebhookPayload};
use self::vault::{CredentialStore, Vault, VaultCredentialStore};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub instagram: InstagramClient,
    pub credentials: Arc<dyn CredentialStore>,
    pub ws_tx: broadcast::Sender<ws::WsEvent>,
}

impl AppState {
    /// Wires the default collaborators around an initialized pool.
    pub fn new(config: Config, pool: AnyPool, db_kind: DbKind) -> Self {
        let instagram = InstagramClient::from_config(reqwest::Client::new(), &config.instagram);
        let vault = config.vault.encryption_key.as_deref().map(Vault::new);
        let credentials: Arc<dyn CredentialStore> = Arc::new(VaultCredentialStore::new(pool.clone(), db_kind, vault));
        let (ws_tx, _) = broadcast::channel(100);
        Self {
            config,
            pool,
            db_kind,
            instagram,
            credentials,
            ws_tx,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    pub bot_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledQuery {
    pub bot_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn page(limit: Option<i64>, offset: Option<i64>, default_limit: i64) -> (i64, i64) {
    (limit.unwrap_or(default_limit).clamp(1, 500), offset.unwrap_or(0).max(0))
}

pub async fn connect(config: &Config) -> anyhow::Result<(AnyPool, DbKind)> {
    sqlx::any::install_default_drivers();

    let db_url = resolve_database_url(config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;
    Ok((pool, db_kind))
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    let config = load_config();
    let (pool, db_kind) = connect(&config).await?;
    let state = AppState::new(config, pool, db_kind);
    let app = build_router(state.clone());
    Ok((state, app))
}

pub fn build_router(state: AppState) -> Router {
    let webhook_path = state.config.instagram.webhook_path.clone();

    let authed_routes = Router::new()
        .route("/v1/scheduled-messages", post(create_scheduled).get(list_scheduled))
        .route("/v1/scheduled-messages/:id/cancel", post(cancel_scheduled))
        .route("/v1/chats", get(list_chats))
        .route("/v1/chats/:id", get(get_chat))
        .route("/v1/chats/:id/messages", get(list_chat_messages))
        .route("/v1/queues/stats", get(queue_stats))
        .route("/v1/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route(&webhook_path, get(webhook_verify).post(webhook_receive));

    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers
            .get("X-DM-Pilot-Token")
            .and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    let token = state.config.auth.token.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, rx, token))
}

async fn webhook_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let challenge = instagram::verify_subscription(
        params.get("hub.mode").map(String::as_str),
        params.get("hub.verify_token").map(String::as_str),
        params.get("hub.challenge").map(String::as_str),
        state.config.instagram.verify_token.as_deref(),
    );
    match challenge {
        Some(challenge) => {
            info!("webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        None => {
            warn!("webhook verification failed: invalid token or mode");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
    }
}

async fn webhook_receive(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let signature = headers
        .get(instagram::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    match (state.config.instagram.app_secret.as_deref(), signature) {
        (Some(secret), Some(signature)) => {
            if !instagram::validate_signature(secret, &body, signature) {
                warn!("rejecting webhook with invalid signature");
                return (StatusCode::FORBIDDEN, Json(json!({"status": "error"}))).into_response();
            }
        }
        (Some(_), None) => warn!("webhook without signature accepted"),
        (None, _) => warn!("no app secret configured, webhook signature not checked"),
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            error!("unparseable webhook body: {err}");
            return Json(json!({"status": "error"})).into_response();
        }
    };

    let mut status = "ok";
    for job in instagram::extract_message_events(&payload) {
        if let Err(err) = scheduler::queue_webhook_message(&state, job).await {
            error!("failed to queue webhook message: {err:#}");
            status = "error";
        }
    }
    Json(json!({"status": status})).into_response()
}

async fn create_scheduled(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = scheduler::schedule_message(&state, req).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn cancel_scheduled(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let record = scheduler::cancel_scheduled_message(&state, &id).await?;
    Ok(Json(record))
}

async fn list_scheduled(
    State(state): State<AppState>,
    Query(query): Query<ScheduledQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            ScheduledStatus::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let (limit, offset) = page(query.limit, query.offset, 100);
    let rows = db::list_scheduled_messages(
        &state.pool,
        state.db_kind,
        query.bot_id.as_deref(),
        status,
        limit,
        offset,
    )
    .await?;
    Ok(Json(rows))
}

async fn list_chats(State(state): State<AppState>, Query(query): Query<ChatQuery>) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = page(query.limit, query.offset, 100);
    let chats = db::list_chats(&state.pool, state.db_kind, query.bot_id.as_deref(), limit, offset).await?;
    Ok(Json(chats))
}

async fn get_chat(State(state): State<AppState>, Path(chat_id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let chat = db::get_chat(&state.pool, state.db_kind, &chat_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Chat {chat_id} not found")))?;
    Ok(Json(chat))
}

async fn list_chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(page_query): Query<Pagination>,
) -> Result<impl IntoResponse, ApiError> {
    if db::get_chat(&state.pool, state.db_kind, &chat_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Chat {chat_id} not found")));
    }
    let (limit, offset) = page(page_query.limit, page_query.offset, 200);
    let messages = db::list_messages(&state.pool, state.db_kind, &chat_id, limit, offset).await?;
    Ok(Json(messages))
}

async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(scheduler::queue_stats(&state).await?))
}
