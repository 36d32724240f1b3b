use dm_pilot::types::{
    InboundMessageJob, JobPayload, ScheduledMessageJob, ScheduledStatus, Sender, WebhookMessageJob, WebhookPayload,
};
use serde_json::json;

#[test]
fn test_job_payload_tagged_by_kind() {
    let payload = JobPayload::WebhookMessage(WebhookMessageJob {
        sender_id: "U1".to_string(),
        recipient_id: "BOT1".to_string(),
        message_text: "Hello".to_string(),
        message_id: Some("m1".to_string()),
        timestamp: 1000,
    });
    let value = serde_json::to_value(&payload).unwrap();
    assert_eq!(value["kind"], "webhook_message");
    assert_eq!(value["senderId"], "U1");
    assert_eq!(value["recipientId"], "BOT1");
    assert_eq!(payload.kind(), "webhook_message");
}

#[test]
fn test_job_payload_decodes_by_tag_not_fields() {
    let value = json!({
        "kind": "scheduled_message",
        "botId": "b1",
        "recipient": "U9",
        "content": "Sale starts now",
        "scheduledMessageId": "s1"
    });
    match serde_json::from_value::<JobPayload>(value).unwrap() {
        JobPayload::ScheduledMessage(ScheduledMessageJob { scheduled_message_id, .. }) => {
            assert_eq!(scheduled_message_id, "s1")
        }
        other => panic!("wrong variant: {other:?}"),
    }

    let untagged = json!({"senderId": "U1", "recipientId": "B", "messageText": "x", "timestamp": 1});
    assert!(serde_json::from_value::<JobPayload>(untagged).is_err());
}

#[test]
fn test_inbound_job_optional_username() {
    let job: InboundMessageJob = serde_json::from_value(json!({
        "botId": "b1",
        "instagramUserId": "U1",
        "messageId": "m1",
        "messageText": "hi",
        "timestamp": 5
    }))
    .unwrap();
    assert!(job.instagram_username.is_none());
}

#[test]
fn test_webhook_payload_tolerates_missing_fields() {
    let payload: WebhookPayload = serde_json::from_value(json!({
        "object": "instagram",
        "entry": [{"id": "E1", "messaging": [{"sender": {"id": "U1"}}]}]
    }))
    .unwrap();
    assert_eq!(payload.entry.len(), 1);
    let event = &payload.entry[0].messaging[0];
    assert!(event.recipient.is_none());
    assert!(event.message.is_none());
}

#[test]
fn test_enums_parse() {
    assert_eq!(Sender::parse("bot"), Some(Sender::Bot));
    assert_eq!(Sender::parse("agent"), None);
    assert_eq!(ScheduledStatus::parse("sent"), Some(ScheduledStatus::Sent));
    assert_eq!(ScheduledStatus::Failed.as_str(), "failed");
    assert_eq!(serde_json::to_value(ScheduledStatus::Pending).unwrap(), "pending");
}
