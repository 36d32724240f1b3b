use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::InstagramConfig;
use crate::throttle::Throttle;
use crate::types::{WebhookMessageJob, WebhookPayload};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("invalid request to Instagram API: {0}")]
    InvalidRequest(String),
    #[error("Instagram authentication failed, check bot credentials")]
    Authentication,
    #[error("Instagram API rate limit exceeded")]
    RateLimited,
    #[error("Instagram API is currently unavailable")]
    Unavailable,
    #[error("failed to communicate with Instagram API: {0}")]
    Unknown(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::RateLimited | SendError::Unavailable)
    }

    /// Maps a non-success Graph API response to an error kind.
    pub fn from_response(status: StatusCode, body: &Value) -> Self {
        match status.as_u16() {
            401 | 403 => SendError::Authentication,
            429 => SendError::RateLimited,
            500..=599 => SendError::Unavailable,
            400..=499 => SendError::InvalidRequest(
                body.pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("invalid request")
                    .to_string(),
            ),
            other => SendError::Unknown(format!("unexpected status {other}")),
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SendError::Unavailable
        } else {
            SendError::Unknown(err.to_string())
        }
    }
}

/// Rate-limited client for the Instagram messaging endpoint.
#[derive(Debug, Clone)]
pub struct InstagramClient {
    http: Client,
    base_url: String,
    timeout: Duration,
    throttle: Arc<Throttle>,
}

impl InstagramClient {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration, throttle: Arc<Throttle>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            throttle,
        }
    }

    pub fn from_config(http: Client, cfg: &InstagramConfig) -> Self {
        Self::new(
            http,
            cfg.graph_api_url.clone(),
            Duration::from_secs(cfg.request_timeout_secs),
            Arc::new(Throttle::new(Duration::from_millis(cfg.rate_limit_ms))),
        )
    }

    /// Sends a text DM and returns the platform message id.
    pub async fn send_message(&self, recipient_id: &str, text: &str, access_token: &str) -> Result<String, SendError> {
        self.throttle.throttle().await;

        let preview: String = text.chars().take(50).collect();
        debug!(recipient_id, "sending Instagram message: {preview}");

        let resp = self
            .http
            .post(format!("{}/me/messages", self.base_url))
            .query(&[("access_token", access_token)])
            .timeout(self.timeout)
            .json(&json!({
                "recipient": {"id": recipient_id},
                "message": {"text": text},
            }))
            .send()
            .await?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let err = SendError::from_response(status, &body);
            warn!(recipient_id, status = status.as_u16(), "Instagram send failed: {body}");
            return Err(err);
        }

        let message_id = body
            .get("message_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SendError::Unknown("response missing message_id".to_string()))?;
        info!(recipient_id, message_id, "Instagram message sent");
        Ok(message_id.to_string())
    }
}

/// Checks an `x-hub-signature-256` header value against the raw body.
pub fn validate_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_body(app_secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Webhook subscription handshake. Returns the challenge to echo back, or
/// `None` when the request must be refused.
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: Option<&str>,
) -> Option<String> {
    let expected = expected_token.filter(|t| !t.is_empty())?;
    if mode == Some("subscribe") && token == Some(expected) {
        return challenge.map(str::to_string);
    }
    None
}

/// Flattens a webhook body into one job per actionable messaging event.
pub fn extract_message_events(payload: &WebhookPayload) -> Vec<WebhookMessageJob> {
    if payload.object.as_deref() != Some("instagram") {
        warn!(object = ?payload.object, "ignoring webhook for unexpected object");
        return Vec::new();
    }

    let mut jobs = Vec::new();
    for entry in &payload.entry {
        for event in &entry.messaging {
            let sender_id = event.sender.as_ref().and_then(|p| p.id.clone());
            let recipient_id = event.recipient.as_ref().and_then(|p| p.id.clone());
            let text = event.message.as_ref().and_then(|m| m.text.clone());

            let (Some(sender_id), Some(recipient_id), Some(message_text)) = (sender_id, recipient_id, text) else {
                warn!(entry_id = ?entry.id, "skipping incomplete messaging event");
                continue;
            };

            jobs.push(WebhookMessageJob {
                sender_id,
                recipient_id,
                message_text,
                message_id: event.message.as_ref().and_then(|m| m.mid.clone()),
                timestamp: event
                    .timestamp
                    .or(entry.time)
                    .unwrap_or_else(|| Utc::now().timestamp_millis()),
            });
        }
    }
    jobs
}
