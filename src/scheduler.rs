//! Enqueue helpers plus the scheduling and cancellation rules behind the API.

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{MESSAGE_QUEUE, SCHEDULED_QUEUE};
use crate::db::{self, ScheduledMessageRecord};
use crate::queue::{self, JobOptions, QueueCounts};
use crate::types::{InboundMessageJob, JobPayload, ScheduledMessageJob, ScheduledStatus, WebhookMessageJob, CANCELLED_BY_USER};
use crate::ws::{self, WsEvent};
use crate::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(err) => {
                error!("request failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub bot_id: String,
    pub recipient: String,
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub message_processing: QueueCounts,
    pub scheduled_messages: QueueCounts,
}

pub async fn queue_webhook_message(state: &AppState, job: WebhookMessageJob) -> Result<String> {
    let sender_id = job.sender_id.clone();
    let message_id = job.message_id.clone();
    let opts = JobOptions::immediate(state.config.queue.message_retry);
    let job_id = queue::enqueue(&state.pool, state.db_kind, MESSAGE_QUEUE, &JobPayload::WebhookMessage(job), opts).await?;
    info!(job_id = %job_id, sender_id = %sender_id, message_id = ?message_id, "queued webhook message");
    Ok(job_id)
}

pub async fn queue_inbound_message(state: &AppState, job: InboundMessageJob) -> Result<String> {
    let bot_id = job.bot_id.clone();
    let opts = JobOptions::immediate(state.config.queue.message_retry);
    let job_id = queue::enqueue(&state.pool, state.db_kind, MESSAGE_QUEUE, &JobPayload::InboundMessage(job), opts).await?;
    info!(job_id = %job_id, bot_id = %bot_id, "queued inbound message");
    Ok(job_id)
}

pub async fn schedule_message(state: &AppState, req: ScheduleRequest) -> Result<ScheduledMessageRecord, ApiError> {
    if req.recipient.trim().is_empty() || req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("recipient and content are required".to_string()));
    }
    if db::get_bot(&state.pool, state.db_kind, &req.bot_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Bot {} not found", req.bot_id)));
    }

    let now = Utc::now();
    let delay = req.scheduled_at - now;
    if delay <= chrono::Duration::zero() {
        return Err(ApiError::BadRequest("Scheduled time must be in the future".to_string()));
    }

    let mut record = ScheduledMessageRecord {
        id: Uuid::new_v4().to_string(),
        bot_id: req.bot_id,
        recipient: req.recipient,
        content: req.content,
        scheduled_at: req.scheduled_at,
        status: ScheduledStatus::Pending,
        sent_at: None,
        error: None,
        job_id: None,
        created_at: now,
    };
    db::insert_scheduled_message(&state.pool, state.db_kind, &record).await?;

    let payload = JobPayload::ScheduledMessage(ScheduledMessageJob {
        bot_id: record.bot_id.clone(),
        recipient: record.recipient.clone(),
        content: record.content.clone(),
        scheduled_message_id: record.id.clone(),
    });
    let opts = JobOptions::delayed(state.config.queue.scheduled_retry, delay);
    let job_id = match queue::enqueue(&state.pool, state.db_kind, SCHEDULED_QUEUE, &payload, opts).await {
        Ok(job_id) => job_id,
        Err(err) => {
            db::fail_if_pending(&state.pool, state.db_kind, &record.id, "Failed to enqueue").await?;
            return Err(err.into());
        }
    };
    db::set_scheduled_job_id(&state.pool, state.db_kind, &record.id, &job_id).await?;
    record.job_id = Some(job_id);

    info!(
        scheduled_message_id = %record.id,
        bot_id = %record.bot_id,
        scheduled_at = %record.scheduled_at.to_rfc3339(),
        "scheduled message"
    );
    Ok(record)
}

/// Cancels a pending scheduled message and drops its delayed job when it has
/// not started yet. A job that is already running re-checks the row and skips.
pub async fn cancel_scheduled_message(state: &AppState, id: &str) -> Result<ScheduledMessageRecord, ApiError> {
    let Some(row) = db::get_scheduled_message(&state.pool, state.db_kind, id).await? else {
        return Err(ApiError::NotFound(format!("Scheduled message {id} not found")));
    };
    if row.status != ScheduledStatus::Pending {
        return Err(ApiError::BadRequest(format!(
            "Cannot cancel message with status {}",
            row.status.as_str()
        )));
    }
    if !db::fail_if_pending(&state.pool, state.db_kind, id, CANCELLED_BY_USER).await? {
        return Err(ApiError::BadRequest("Scheduled message is no longer pending".to_string()));
    }

    if let Some(job_id) = row.job_id.as_deref() {
        match queue::remove(&state.pool, state.db_kind, job_id).await {
            Ok(true) => info!(scheduled_message_id = %id, job_id, "removed scheduled job"),
            Ok(false) => info!(scheduled_message_id = %id, job_id, "scheduled job already started, it will skip"),
            Err(err) => warn!(scheduled_message_id = %id, job_id, "could not remove scheduled job: {err:#}"),
        }
    }

    ws::publish(
        &state.ws_tx,
        WsEvent::for_bot(
            ws::SCHEDULED_UPDATED,
            &row.bot_id,
            json!({"id": id, "status": ScheduledStatus::Failed, "error": CANCELLED_BY_USER}),
        ),
    );

    db::get_scheduled_message(&state.pool, state.db_kind, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Scheduled message {id} not found")))
}

pub async fn queue_stats(state: &AppState) -> Result<QueueStats> {
    Ok(QueueStats {
        message_processing: queue::counts(&state.pool, state.db_kind, MESSAGE_QUEUE).await?,
        scheduled_messages: queue::counts(&state.pool, state.db_kind, SCHEDULED_QUEUE).await?,
    })
}
