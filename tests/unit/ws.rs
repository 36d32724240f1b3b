use dm_pilot::ws::{publish, Subscription, WsCommand, WsEvent, CHAT_UPDATED, MESSAGE_CREATED, SCHEDULED_UPDATED};
use serde_json::json;
use tokio::sync::broadcast;

#[test]
fn test_ws_event_serializes_bot_id() {
    let event = WsEvent::for_bot(MESSAGE_CREATED, "bot_1", json!({"chatId": "c1"}));
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["event"], "message.created");
    assert_eq!(value["botId"], "bot_1");
    assert_eq!(value["payload"]["chatId"], "c1");
}

#[test]
fn test_ws_command_connect_and_ping() {
    let cmd: WsCommand = serde_json::from_str(r#"{"type":"connect","token":"t"}"#).unwrap();
    assert!(matches!(cmd, WsCommand::Connect { token: Some(t) } if t == "t"));
    let cmd: WsCommand = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
    assert!(matches!(cmd, WsCommand::Ping));
}

#[test]
fn test_ws_command_subscribe_without_bots() {
    let cmd: WsCommand = serde_json::from_str(r#"{"type":"subscribe","events":["chat.updated"]}"#).unwrap();
    match cmd {
        WsCommand::Subscribe { events, bot_ids } => {
            assert_eq!(events.unwrap(), vec![CHAT_UPDATED.to_string()]);
            assert!(bot_ids.is_none());
        }
        _ => panic!("wrong variant"),
    }
}

#[test]
fn test_subscription_bot_filter_drops_unscoped_events() {
    let sub = Subscription::new(None, Some(vec!["bot_1".to_string()]));
    let unscoped = WsEvent {
        event: "health".to_string(),
        bot_id: None,
        payload: json!({}),
    };
    assert!(!sub.matches(&unscoped));
    assert!(sub.matches(&WsEvent::for_bot(SCHEDULED_UPDATED, "bot_1", json!({}))));
}

#[test]
fn test_subscription_combines_filters() {
    let sub = Subscription::new(Some(vec![MESSAGE_CREATED.to_string()]), Some(vec!["bot_1".to_string()]));
    assert!(sub.matches(&WsEvent::for_bot(MESSAGE_CREATED, "bot_1", json!({}))));
    assert!(!sub.matches(&WsEvent::for_bot(CHAT_UPDATED, "bot_1", json!({}))));
    assert!(!sub.matches(&WsEvent::for_bot(MESSAGE_CREATED, "bot_2", json!({}))));
}

#[tokio::test]
async fn test_publish_without_listeners_is_harmless() {
    let (tx, _) = broadcast::channel::<WsEvent>(4);
    publish(&tx, WsEvent::for_bot(CHAT_UPDATED, "bot_1", json!({})));

    let mut rx = tx.subscribe();
    publish(&tx, WsEvent::for_bot(CHAT_UPDATED, "bot_1", json!({"n": 1})));
    let got = rx.recv().await.unwrap();
    assert_eq!(got.payload["n"], 1);
}
