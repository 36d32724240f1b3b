use chrono::{TimeZone, Utc};
use dm_pilot::db::{datetime_to_millis, db_kind_from_url, millis_to_datetime, rewrite_sql, BotRecord, DbKind, MessageRecord};
use dm_pilot::types::Sender;

#[test]
fn test_db_kind_from_url_sqlite() {
    assert_eq!(db_kind_from_url("sqlite://test.db"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("SQLite://test.db"), DbKind::Sqlite);
}

#[test]
fn test_db_kind_from_url_postgres() {
    assert_eq!(db_kind_from_url("postgres://localhost/testdb"), DbKind::Postgres);
    assert_eq!(db_kind_from_url("postgresql://localhost/testdb"), DbKind::Postgres);
}

#[test]
fn test_rewrite_sql_postgres_upsert() {
    let sql = "INSERT INTO chats (id, bot_id) VALUES (?, ?) ON CONFLICT(bot_id) DO NOTHING";
    assert_eq!(
        rewrite_sql(sql, DbKind::Postgres).as_ref(),
        "INSERT INTO chats (id, bot_id) VALUES ($1, $2) ON CONFLICT(bot_id) DO NOTHING"
    );
}

#[test]
fn test_millis_conversion() {
    let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    assert_eq!(millis_to_datetime(datetime_to_millis(dt)), dt);
    assert_eq!(millis_to_datetime(1000).timestamp(), 1);
}

#[test]
fn test_message_record_serializes_camel_case() {
    let msg = MessageRecord::new("chat_1", "Hello", Sender::User, Some("m1".to_string()), Utc::now());
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["chatId"], "chat_1");
    assert_eq!(value["sender"], "user");
    assert_eq!(value["externalId"], "m1");
}

#[test]
fn test_bot_record_never_serializes_credentials() {
    let bot = BotRecord {
        id: "bot_1".to_string(),
        tenant_id: "tenant_1".to_string(),
        name: "Shop".to_string(),
        instagram_user_id: "BOT1".to_string(),
        access_token_ciphertext: Some("deadbeef".to_string()),
        access_token_iv: Some("00ff".to_string()),
        is_active: true,
        created_at: Utc::now(),
    };
    let json = serde_json::to_string(&bot).unwrap();
    assert!(!json.contains("deadbeef"));
    assert!(!json.contains("accessToken"));
    assert!(json.contains("\"instagramUserId\":\"BOT1\""));
}
