//! Consumer for the `message-processing` queue.
//!
//! Persistence errors propagate so the queue retries the job. Delivery errors
//! do not: the bot reply is stored either way, just without an external id.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::db::{self, BotRecord, ChatRecord, MessageRecord};
use crate::matcher;
use crate::types::{InboundMessageJob, Sender, WebhookMessageJob};
use crate::ws::{self, WsEvent};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No active bot owns the recipient; nothing was written.
    NoActiveBot,
    /// The inbound message was already stored and answered by an earlier delivery.
    Duplicate,
    NoMatch,
    Replied { delivered: bool },
}

struct Inbound<'a> {
    sender_id: &'a str,
    username: Option<&'a str>,
    message_id: Option<&'a str>,
    text: &'a str,
    timestamp: i64,
}

pub async fn process_webhook_message(state: &AppState, job: &WebhookMessageJob) -> Result<ProcessOutcome> {
    let Some(bot) = db::find_active_bot_by_instagram_id(&state.pool, state.db_kind, &job.recipient_id).await? else {
        warn!(recipient_id = %job.recipient_id, "no active bot for Instagram account");
        return Ok(ProcessOutcome::NoActiveBot);
    };

    handle_inbound(
        state,
        &bot,
        Inbound {
            sender_id: &job.sender_id,
            username: None,
            message_id: job.message_id.as_deref(),
            text: &job.message_text,
            timestamp: job.timestamp,
        },
    )
    .await
}

pub async fn process_inbound_message(state: &AppState, job: &InboundMessageJob) -> Result<ProcessOutcome> {
    let bot = db::get_bot(&state.pool, state.db_kind, &job.bot_id)
        .await?
        .filter(|bot| bot.is_active);
    let Some(bot) = bot else {
        warn!(bot_id = %job.bot_id, "bot missing or inactive, dropping inbound message");
        return Ok(ProcessOutcome::NoActiveBot);
    };

    handle_inbound(
        state,
        &bot,
        Inbound {
            sender_id: &job.instagram_user_id,
            username: job.instagram_username.as_deref(),
            message_id: job.message_id.as_deref(),
            text: &job.message_text,
            timestamp: job.timestamp,
        },
    )
    .await
}

async fn handle_inbound(state: &AppState, bot: &BotRecord, inbound: Inbound<'_>) -> Result<ProcessOutcome> {
    let received_at = db::millis_to_datetime(inbound.timestamp);
    let upsert = db::upsert_chat(
        &state.pool,
        state.db_kind,
        &bot.id,
        inbound.sender_id,
        inbound.username,
        received_at,
    )
    .await?;
    let chat = upsert.chat;
    if upsert.created {
        info!(bot_id = %bot.id, chat_id = %chat.id, "created chat");
    }

    let message = MessageRecord::new(
        &chat.id,
        inbound.text,
        Sender::User,
        inbound.message_id.map(str::to_string),
        received_at,
    );
    let inbound_id = if db::insert_message(&state.pool, state.db_kind, &message).await? {
        publish_message(state, bot, &chat, &message);
        message.id
    } else {
        // Stored by an earlier attempt. Only finish the reply if that attempt
        // never recorded one.
        let stored = match inbound.message_id {
            Some(external_id) => {
                db::find_message_by_external_id(&state.pool, state.db_kind, &chat.id, external_id).await?
            }
            None => None,
        };
        let Some(stored) = stored else {
            return Err(anyhow!("inbound message {:?} conflicted but cannot be found", inbound.message_id));
        };
        if db::has_reply(&state.pool, state.db_kind, &stored.id).await? {
            info!(chat_id = %chat.id, message_id = ?inbound.message_id, "inbound message already answered, skipping");
            return Ok(ProcessOutcome::Duplicate);
        }
        info!(chat_id = %chat.id, message_id = ?inbound.message_id, "inbound message stored without reply, resuming");
        stored.id
    };

    let Some(automation) = matcher::match_automation(&state.pool, state.db_kind, &bot.id, inbound.text).await? else {
        info!(chat_id = %chat.id, message_id = ?inbound.message_id, "no automation matched");
        return Ok(ProcessOutcome::NoMatch);
    };
    info!(chat_id = %chat.id, automation_id = %automation.id, "automation matched");

    let external_id = deliver_reply(state, bot, &chat.external_user_id, &automation.response).await;
    let delivered = external_id.is_some();
    let reply =
        MessageRecord::new(&chat.id, &automation.response, Sender::Bot, external_id, Utc::now()).in_reply_to(&inbound_id);
    db::insert_message(&state.pool, state.db_kind, &reply).await?;
    publish_message(state, bot, &chat, &reply);

    Ok(ProcessOutcome::Replied { delivered })
}

/// Sends the reply if a credential is available. Any failure yields `None`.
async fn deliver_reply(state: &AppState, bot: &BotRecord, recipient: &str, text: &str) -> Option<String> {
    let token = match state.credentials.access_token(&bot.id).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!(bot_id = %bot.id, "bot has no access token, storing reply without sending");
            return None;
        }
        Err(err) => {
            error!(bot_id = %bot.id, "credential lookup failed: {err:#}");
            return None;
        }
    };

    match state.instagram.send_message(recipient, text, &token).await {
        Ok(message_id) => Some(message_id),
        Err(err) => {
            error!(bot_id = %bot.id, retryable = err.is_retryable(), "automated reply not delivered: {err}");
            None
        }
    }
}

pub(crate) fn publish_message(state: &AppState, bot: &BotRecord, chat: &ChatRecord, message: &MessageRecord) {
    ws::publish(
        &state.ws_tx,
        WsEvent::for_bot(ws::MESSAGE_CREATED, &bot.id, json!({"chatId": chat.id, "message": message})),
    );
    ws::publish(&state.ws_tx, WsEvent::for_bot(ws::CHAT_UPDATED, &bot.id, json!({"chat": chat})));
}
