use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use dm_pilot::channels::instagram::{sign_body, SIGNATURE_HEADER};
use dm_pilot::config::{Config, MESSAGE_QUEUE, SCHEDULED_QUEUE};
use dm_pilot::db::{self, AutomationRecord, BotRecord};
use dm_pilot::types::Sender;
use dm_pilot::queue;
use dm_pilot::{build_router, worker, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const TOKEN: &str = "test_token_123";
const APP_SECRET: &str = "app-secret";

fn create_test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.database.sqlite_path = temp_dir.path().join("api.db").to_string_lossy().to_string();
    config.auth.token = Some(TOKEN.to_string());
    config.instagram.app_secret = Some(APP_SECRET.to_string());
    config.instagram.verify_token = Some("verify-me".to_string());
    config.instagram.rate_limit_ms = 0;
    config
}

async fn create_test_app_state() -> (AppState, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    let (pool, kind) = dm_pilot::connect(&config).await.unwrap();
    (AppState::new(config, pool, kind), temp_dir)
}

async fn seed_bot(state: &AppState, id: &str) {
    let bot = BotRecord {
        id: id.to_string(),
        tenant_id: "tenant_1".to_string(),
        name: "Shop bot".to_string(),
        instagram_user_id: format!("IG_{id}"),
        access_token_ciphertext: None,
        access_token_iv: None,
        is_active: true,
        created_at: Utc::now(),
    };
    db::insert_bot(&state.pool, state.db_kind, &bot).await.unwrap();
}

fn authed(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("X-DM-Pilot-Token", TOKEN)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    authed(method, uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));
    (status, body)
}

fn schedule_body(bot_id: &str, offset: Duration) -> Value {
    json!({
        "botId": bot_id,
        "recipient": "U1",
        "content": "Flash sale at noon",
        "scheduledAt": (Utc::now() + offset).to_rfc3339(),
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, _dir) = create_test_app_state().await;
    let app = build_router(state);

    let (status, body) = send(&app, Request::builder().uri("/v1/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_auth_required_for_api_routes() {
    let (state, _dir) = create_test_app_state().await;
    let app = build_router(state);

    let (status, _) = send(&app, Request::builder().uri("/v1/chats").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/v1/chats")
        .header("X-DM-Pilot-Token", "nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, wrong).await.0, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, authed("GET", "/v1/chats").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_webhook_verification_handshake() {
    let (state, _dir) = create_test_app_state().await;
    let app = build_router(state);

    let ok = Request::builder()
        .uri("/v1/instagram/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1158201444")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, ok).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(1158201444));

    let bad = Request::builder()
        .uri("/v1/instagram/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, bad).await.0, StatusCode::FORBIDDEN);
}

fn webhook_body() -> Vec<u8> {
    json!({
        "object": "instagram",
        "entry": [{
            "id": "IG_bot_1",
            "time": 1000,
            "messaging": [
                {"sender": {"id": "U1"}, "recipient": {"id": "IG_bot_1"}, "timestamp": 1000, "message": {"mid": "m1", "text": "Hello"}},
                {"sender": {"id": "U2"}, "recipient": {"id": "IG_bot_1"}, "timestamp": 1001, "message": {"mid": "m2"}}
            ]
        }]
    })
    .to_string()
    .into_bytes()
}

fn webhook_request(body: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/instagram/webhook")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn test_webhook_with_valid_signature_enqueues_text_events() {
    let (state, _dir) = create_test_app_state().await;
    let app = build_router(state.clone());

    let body = webhook_body();
    let signature = sign_body(APP_SECRET, &body);
    let (status, response) = send(&app, webhook_request(body, signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ok");

    let counts = queue::counts(&state.pool, state.db_kind, MESSAGE_QUEUE).await.unwrap();
    assert_eq!(counts.waiting, 1);
}

#[tokio::test]
async fn test_webhook_flows_through_worker_into_chat_history() {
    let (state, _dir) = create_test_app_state().await;
    seed_bot(&state, "bot_1").await;
    db::insert_automation(
        &state.pool,
        state.db_kind,
        &AutomationRecord {
            id: "auto_hello".to_string(),
            bot_id: "bot_1".to_string(),
            trigger: "hello".to_string(),
            response: "Hi there!".to_string(),
            is_active: true,
            priority: 0,
            created_at: Utc::now(),
        },
    )
    .await
    .unwrap();
    let app = build_router(state.clone());

    let body = webhook_body();
    let signature = sign_body(APP_SECRET, &body);
    let (status, _) = send(&app, webhook_request(body, signature)).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(worker::run_once(&state, MESSAGE_QUEUE).await.unwrap(), 1);
    let counts = queue::counts(&state.pool, state.db_kind, MESSAGE_QUEUE).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);

    let chat = db::find_chat(&state.pool, state.db_kind, "bot_1", "U1").await.unwrap().unwrap();
    assert!(chat.username.is_none());
    let messages = db::list_messages(&state.pool, state.db_kind, &chat.id, 10, 0).await.unwrap();
    let senders: Vec<_> = messages.iter().map(|m| m.sender).collect();
    assert_eq!(senders, vec![Sender::User, Sender::Bot]);
    assert_eq!(messages[0].external_id.as_deref(), Some("m1"));
    assert_eq!(messages[1].content, "Hi there!");
    assert!(messages[1].external_id.is_none());
}

#[tokio::test]
async fn test_webhook_with_bad_signature_is_rejected() {
    let (state, _dir) = create_test_app_state().await;
    let app = build_router(state.clone());

    let signature = sign_body("someone-else", &webhook_body());
    let (status, response) = send(&app, webhook_request(webhook_body(), signature)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["status"], "error");

    let counts = queue::counts(&state.pool, state.db_kind, MESSAGE_QUEUE).await.unwrap();
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn test_webhook_unsigned_and_unparseable_still_acknowledged() {
    let (state, _dir) = create_test_app_state().await;
    let app = build_router(state.clone());

    let (status, response) = send(&app, webhook_request(webhook_body(), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ok");

    let garbage = b"not json".to_vec();
    let signature = sign_body(APP_SECRET, &garbage);
    let (status, response) = send(&app, webhook_request(garbage, signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "error");
}

#[tokio::test]
async fn test_create_scheduled_message() {
    let (state, _dir) = create_test_app_state().await;
    seed_bot(&state, "bot_1").await;
    let app = build_router(state.clone());

    let (status, body) = send(&app, json_request("POST", "/v1/scheduled-messages", schedule_body("bot_1", Duration::hours(1)))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["botId"], "bot_1");
    assert!(body["jobId"].is_string());

    let counts = queue::counts(&state.pool, state.db_kind, SCHEDULED_QUEUE).await.unwrap();
    assert_eq!(counts.delayed, 1);
}

#[tokio::test]
async fn test_create_scheduled_message_validation() {
    let (state, _dir) = create_test_app_state().await;
    seed_bot(&state, "bot_1").await;
    let app = build_router(state);

    let (status, body) = send(&app, json_request("POST", "/v1/scheduled-messages", schedule_body("bot_1", Duration::minutes(-5)))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Scheduled time must be in the future");

    let (status, body) = send(&app, json_request("POST", "/v1/scheduled-messages", schedule_body("ghost", Duration::hours(1)))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Bot ghost not found");

    let mut empty = schedule_body("bot_1", Duration::hours(1));
    empty["content"] = json!("   ");
    assert_eq!(send(&app, json_request("POST", "/v1/scheduled-messages", empty)).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_scheduled_message() {
    let (state, _dir) = create_test_app_state().await;
    seed_bot(&state, "bot_1").await;
    let app = build_router(state.clone());

    let (_, created) = send(&app, json_request("POST", "/v1/scheduled-messages", schedule_body("bot_1", Duration::hours(1)))).await;
    let id = created["id"].as_str().unwrap().to_string();
    let job_id = created["jobId"].as_str().unwrap().to_string();

    let uri = format!("/v1/scheduled-messages/{id}/cancel");
    let (status, body) = send(&app, authed("POST", &uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "Cancelled by user");
    assert!(queue::get(&state.pool, state.db_kind, &job_id).await.unwrap().is_none());

    let (status, body) = send(&app, authed("POST", &uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Cannot cancel message with status failed");

    let (status, _) = send(&app, authed("POST", "/v1/scheduled-messages/missing/cancel").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_scheduled_messages_with_filters() {
    let (state, _dir) = create_test_app_state().await;
    seed_bot(&state, "bot_1").await;
    seed_bot(&state, "bot_2").await;
    let app = build_router(state);

    for bot in ["bot_1", "bot_1", "bot_2"] {
        let (status, _) = send(&app, json_request("POST", "/v1/scheduled-messages", schedule_body(bot, Duration::hours(1)))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(&app, authed("GET", "/v1/scheduled-messages?botId=bot_1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (_, body) = send(&app, authed("GET", "/v1/scheduled-messages?status=sent").body(Body::empty()).unwrap()).await;
    assert!(body.as_array().unwrap().is_empty());

    let (_, body) = send(&app, authed("GET", "/v1/scheduled-messages?limit=1").body(Body::empty()).unwrap()).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, authed("GET", "/v1/scheduled-messages?status=bogus").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_history_endpoints() {
    let (state, _dir) = create_test_app_state().await;
    seed_bot(&state, "bot_1").await;
    let chat = db::upsert_chat(&state.pool, state.db_kind, "bot_1", "U1", Some("alice"), Utc::now())
        .await
        .unwrap()
        .chat;
    let message = db::MessageRecord::new(&chat.id, "Hello", Sender::User, Some("m1".to_string()), Utc::now());
    db::insert_message(&state.pool, state.db_kind, &message).await.unwrap();
    let app = build_router(state);

    let (status, chats) = send(&app, authed("GET", "/v1/chats?botId=bot_1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chats[0]["externalUserId"], "U1");
    assert_eq!(chats[0]["username"], "alice");

    let (status, found) = send(&app, authed("GET", &format!("/v1/chats/{}", chat.id)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["id"], chat.id.as_str());
    assert_eq!(found["botId"], "bot_1");

    let (status, body) = send(&app, authed("GET", "/v1/chats/unknown").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Chat unknown not found");

    let uri = format!("/v1/chats/{}/messages", chat.id);
    let (status, messages) = send(&app, authed("GET", &uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages[0]["content"], "Hello");
    assert_eq!(messages[0]["sender"], "user");
    assert_eq!(messages[0]["externalId"], "m1");

    let (status, _) = send(&app, authed("GET", "/v1/chats/unknown/messages").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_stats_endpoint() {
    let (state, _dir) = create_test_app_state().await;
    seed_bot(&state, "bot_1").await;
    let app = build_router(state);

    send(&app, json_request("POST", "/v1/scheduled-messages", schedule_body("bot_1", Duration::hours(1)))).await;
    let (status, body) = send(&app, authed("GET", "/v1/queues/stats").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scheduledMessages"]["delayed"], 1);
    assert_eq!(body["messageProcessing"]["waiting"], 0);
}
