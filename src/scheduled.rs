//! Consumer for the `scheduled-messages` queue.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::db::{self, MessageRecord};
use crate::processor::publish_message;
use crate::types::{ScheduledMessageJob, ScheduledStatus, Sender};
use crate::ws::{self, WsEvent};
use crate::AppState;

/// Where the running job sits in its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    pub attempt: i64,
    pub max_attempts: i64,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledOutcome {
    /// Row gone or no longer pending (cancelled, already sent).
    Skipped,
    Sent { message_id: String },
}

/// Sends one scheduled message.
///
/// A failed attempt leaves the row `pending` with the error recorded and
/// returns the error so the queue retries; the final failed attempt moves the
/// row to `failed`.
pub async fn process_scheduled_message(state: &AppState, job: &ScheduledMessageJob, ctx: JobContext) -> Result<ScheduledOutcome> {
    let Some(row) = db::get_scheduled_message(&state.pool, state.db_kind, &job.scheduled_message_id).await? else {
        warn!(scheduled_message_id = %job.scheduled_message_id, "scheduled message not found, skipping");
        return Ok(ScheduledOutcome::Skipped);
    };
    if row.status != ScheduledStatus::Pending {
        info!(scheduled_message_id = %row.id, status = row.status.as_str(), "scheduled message no longer pending, skipping");
        return Ok(ScheduledOutcome::Skipped);
    }

    let message_id = match send(state, job).await {
        Ok(message_id) => message_id,
        Err(err) => {
            let reason = format!("{err:#}");
            error!(
                scheduled_message_id = %job.scheduled_message_id,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                "scheduled send failed: {reason}"
            );
            if ctx.is_final_attempt() {
                if db::fail_if_pending(&state.pool, state.db_kind, &job.scheduled_message_id, &reason).await? {
                    publish_status(state, job, ScheduledStatus::Failed, Some(&reason));
                }
            } else {
                db::record_scheduled_attempt_error(&state.pool, state.db_kind, &job.scheduled_message_id, &reason).await?;
            }
            return Err(err);
        }
    };

    // Marked before the chat write so a retry after a store error cannot send twice.
    if db::mark_scheduled_sent(&state.pool, state.db_kind, &job.scheduled_message_id, Utc::now()).await? {
        publish_status(state, job, ScheduledStatus::Sent, None);
        info!(scheduled_message_id = %job.scheduled_message_id, message_id = %message_id, "scheduled message sent");
    } else {
        warn!(
            scheduled_message_id = %job.scheduled_message_id,
            message_id = %message_id,
            "scheduled message delivered after it was cancelled, keeping cancelled status"
        );
    }

    let chat = db::upsert_chat(&state.pool, state.db_kind, &job.bot_id, &job.recipient, None, Utc::now())
        .await?
        .chat;
    let record = MessageRecord::new(&chat.id, &job.content, Sender::Bot, Some(message_id.clone()), Utc::now());
    db::insert_message(&state.pool, state.db_kind, &record).await?;
    if let Some(bot) = db::get_bot(&state.pool, state.db_kind, &job.bot_id).await? {
        publish_message(state, &bot, &chat, &record);
    }

    Ok(ScheduledOutcome::Sent { message_id })
}

async fn send(state: &AppState, job: &ScheduledMessageJob) -> Result<String> {
    let bot = db::get_bot(&state.pool, state.db_kind, &job.bot_id)
        .await?
        .ok_or_else(|| anyhow!("Bot {} not found", job.bot_id))?;
    if !bot.is_active {
        return Err(anyhow!("Bot {} is not active", bot.id));
    }
    let token = state
        .credentials
        .access_token(&bot.id)
        .await?
        .ok_or_else(|| anyhow!("Bot {} has no access token", bot.id))?;
    let message_id = state.instagram.send_message(&job.recipient, &job.content, &token).await?;
    Ok(message_id)
}

fn publish_status(state: &AppState, job: &ScheduledMessageJob, status: ScheduledStatus, error: Option<&str>) {
    ws::publish(
        &state.ws_tx,
        WsEvent::for_bot(
            ws::SCHEDULED_UPDATED,
            &job.bot_id,
            json!({"id": job.scheduled_message_id, "status": status, "error": error}),
        ),
    );
}
