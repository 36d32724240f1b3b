use serde::{Deserialize, Serialize};

/// Top-level webhook body delivered by the Instagram platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookPayload {
    pub object: Option<String>,
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookEntry {
    pub id: Option<String>,
    pub time: Option<i64>,
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingEvent {
    pub sender: Option<Participant>,
    pub recipient: Option<Participant>,
    pub timestamp: Option<i64>,
    pub message: Option<EventMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Participant {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMessage {
    pub mid: Option<String>,
    pub text: Option<String>,
}

/// A raw webhook event, bot not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessageJob {
    pub sender_id: String,
    pub recipient_id: String,
    pub message_text: String,
    pub message_id: Option<String>,
    pub timestamp: i64,
}

/// An inbound message whose bot is already known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessageJob {
    pub bot_id: String,
    pub instagram_user_id: String,
    pub instagram_username: Option<String>,
    pub message_id: Option<String>,
    pub message_text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessageJob {
    pub bot_id: String,
    pub recipient: String,
    pub content: String,
    pub scheduled_message_id: String,
}

/// Job body stored in the queue. The `kind` tag is written at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    WebhookMessage(WebhookMessageJob),
    InboundMessage(InboundMessageJob),
    ScheduledMessage(ScheduledMessageJob),
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::WebhookMessage(_) => "webhook_message",
            JobPayload::InboundMessage(_) => "inbound_message",
            JobPayload::ScheduledMessage(_) => "scheduled_message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Sender::User),
            "bot" => Some(Sender::Bot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledStatus {
    Pending,
    Sent,
    Failed,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledStatus::Pending => "pending",
            ScheduledStatus::Sent => "sent",
            ScheduledStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ScheduledStatus::Pending),
            "sent" => Some(ScheduledStatus::Sent),
            "failed" => Some(ScheduledStatus::Failed),
            _ => None,
        }
    }
}

pub const CANCELLED_BY_USER: &str = "Cancelled by user";
