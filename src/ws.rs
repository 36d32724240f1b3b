use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

pub const MESSAGE_CREATED: &str = "message.created";
pub const CHAT_UPDATED: &str = "chat.updated";
pub const SCHEDULED_UPDATED: &str = "scheduled.updated";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    pub payload: serde_json::Value,
}

impl WsEvent {
    pub fn for_bot(event: &str, bot_id: &str, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            bot_id: Some(bot_id.to_string()),
            payload,
        }
    }
}

/// Broadcasts to connected dashboards. Having no listeners is fine.
pub fn publish(tx: &broadcast::Sender<WsEvent>, event: WsEvent) {
    let _ = tx.send(event);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsCommand {
    #[serde(rename = "connect")]
    Connect { token: Option<String> },
    #[serde(rename = "subscribe")]
    Subscribe {
        events: Option<Vec<String>>,
        #[serde(default, rename = "botIds")]
        bot_ids: Option<Vec<String>>,
    },
    #[serde(rename = "ping")]
    Ping,
}

/// Per-socket filter. `None` on either axis means everything passes.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    events: Option<HashSet<String>>,
    bot_ids: Option<HashSet<String>>,
}

impl Subscription {
    pub fn new(events: Option<Vec<String>>, bot_ids: Option<Vec<String>>) -> Self {
        Self {
            events: events.map(|items| items.into_iter().collect()),
            bot_ids: bot_ids.map(|items| items.into_iter().collect()),
        }
    }

    pub fn matches(&self, evt: &WsEvent) -> bool {
        if let Some(events) = self.events.as_ref() {
            if !events.contains(&evt.event) {
                return false;
            }
        }
        match (self.bot_ids.as_ref(), evt.bot_id.as_ref()) {
            (Some(bots), Some(bot_id)) => bots.contains(bot_id),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

fn send_text(evt: &WsEvent) -> Message {
    Message::Text(serde_json::to_string(evt).unwrap_or_default())
}

pub async fn handle_ws(mut socket: WebSocket, mut rx: broadcast::Receiver<WsEvent>, auth_token: Option<String>) {
    let mut authorized = auth_token.is_none();
    let mut subscription = Subscription::default();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let text = match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) else {
                    continue;
                };
                match cmd {
                    WsCommand::Connect { token } => {
                        if let Some(expected) = auth_token.as_ref() {
                            if token.as_deref() != Some(expected.as_str()) {
                                let _ = socket.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        authorized = true;
                        let ack = WsEvent {
                            event: "presence".to_string(),
                            bot_id: None,
                            payload: serde_json::json!({"status": "connected"}),
                        };
                        let _ = socket.send(send_text(&ack)).await;
                    }
                    WsCommand::Subscribe { events, bot_ids } => {
                        subscription = Subscription::new(events, bot_ids);
                    }
                    WsCommand::Ping => {
                        let health = WsEvent {
                            event: "health".to_string(),
                            bot_id: None,
                            payload: serde_json::json!({"status": "ok"}),
                        };
                        let _ = socket.send(send_text(&health)).await;
                    }
                }
            }
            evt = rx.recv() => {
                match evt {
                    Ok(evt) => {
                        if !authorized || !subscription.matches(&evt) {
                            continue;
                        }
                        if socket.send(send_text(&evt)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "websocket client lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
