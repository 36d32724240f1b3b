use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

use crate::types::{ScheduledStatus, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

/// Instagram-connected automation endpoint. The credential columns are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub instagram_user_id: String,
    #[serde(skip)]
    pub access_token_ciphertext: Option<String>,
    #[serde(skip)]
    pub access_token_iv: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    pub bot_id: String,
    pub external_user_id: String,
    pub username: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub sender: Sender,
    pub external_id: Option<String>,
    /// For bot replies, the inbound message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(chat_id: &str, content: &str, sender: Sender, external_id: Option<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            sender,
            external_id,
            reply_to: None,
            created_at,
        }
    }

    pub fn in_reply_to(mut self, message_id: &str) -> Self {
        self.reply_to = Some(message_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRecord {
    pub id: String,
    pub bot_id: String,
    pub trigger: String,
    pub response: String,
    pub is_active: bool,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessageRecord {
    pub id: String,
    pub bot_id: String,
    pub recipient: String,
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: ScheduledStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of a chat find-or-create.
#[derive(Debug, Clone)]
pub struct ChatUpsert {
    pub chat: ChatRecord,
    pub created: bool,
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn bool_to_i64(value: bool) -> i64 {
    i64::from(value)
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS bots (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            instagram_user_id TEXT NOT NULL,
            access_token_ciphertext TEXT,
            access_token_iv TEXT,
            is_active BIGINT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_bots_instagram ON bots(instagram_user_id, is_active)"#,
        r#"CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
            external_user_id TEXT NOT NULL,
            username TEXT,
            last_message_at BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            UNIQUE(bot_id, external_user_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_chats_bot_recent ON chats(bot_id, last_message_at)"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            sender TEXT NOT NULL,
            external_id TEXT,
            reply_to TEXT,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_reply ON messages(reply_to)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at)"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_external ON messages(chat_id, external_id)"#,
        r#"CREATE TABLE IF NOT EXISTS automations (
            id TEXT PRIMARY KEY,
            bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
            trigger_text TEXT NOT NULL,
            response TEXT NOT NULL,
            is_active BIGINT NOT NULL,
            priority BIGINT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_automations_bot ON automations(bot_id, is_active, priority)"#,
        r#"CREATE TABLE IF NOT EXISTS scheduled_messages (
            id TEXT PRIMARY KEY,
            bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
            recipient TEXT NOT NULL,
            content TEXT NOT NULL,
            scheduled_at BIGINT NOT NULL,
            status TEXT NOT NULL,
            sent_at BIGINT,
            error TEXT,
            job_id TEXT,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_scheduled_bot ON scheduled_messages(bot_id, status, scheduled_at)"#,
        r#"CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts BIGINT NOT NULL,
            max_attempts BIGINT NOT NULL,
            backoff_ms BIGINT NOT NULL,
            run_at BIGINT NOT NULL,
            last_error TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(queue, status, run_at)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

fn bot_from_row(row: &AnyRow) -> Result<BotRecord> {
    Ok(BotRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        instagram_user_id: row.try_get("instagram_user_id")?,
        access_token_ciphertext: row.try_get("access_token_ciphertext")?,
        access_token_iv: row.try_get("access_token_iv")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

fn chat_from_row(row: &AnyRow) -> Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        external_user_id: row.try_get("external_user_id")?,
        username: row.try_get("username")?,
        last_message_at: millis_to_datetime(row.try_get("last_message_at")?),
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

fn message_from_row(row: &AnyRow) -> Result<MessageRecord> {
    let sender: String = row.try_get("sender")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        content: row.try_get("content")?,
        sender: Sender::parse(&sender).ok_or_else(|| anyhow::anyhow!("unknown sender tag: {sender}"))?,
        external_id: row.try_get("external_id")?,
        reply_to: row.try_get("reply_to")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

fn automation_from_row(row: &AnyRow) -> Result<AutomationRecord> {
    Ok(AutomationRecord {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        trigger: row.try_get("trigger_text")?,
        response: row.try_get("response")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        priority: row.try_get("priority")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

fn scheduled_from_row(row: &AnyRow) -> Result<ScheduledMessageRecord> {
    let status: String = row.try_get("status")?;
    let sent_at: Option<i64> = row.try_get("sent_at")?;
    Ok(ScheduledMessageRecord {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        recipient: row.try_get("recipient")?,
        content: row.try_get("content")?,
        scheduled_at: millis_to_datetime(row.try_get("scheduled_at")?),
        status: ScheduledStatus::parse(&status).ok_or_else(|| anyhow::anyhow!("unknown scheduled status: {status}"))?,
        sent_at: sent_at.map(millis_to_datetime),
        error: row.try_get("error")?,
        job_id: row.try_get("job_id")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

const BOT_COLUMNS: &str = "id, tenant_id, name, instagram_user_id, access_token_ciphertext, access_token_iv, is_active, created_at";
const CHAT_COLUMNS: &str = "id, bot_id, external_user_id, username, last_message_at, created_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, content, sender, external_id, reply_to, created_at";
const AUTOMATION_COLUMNS: &str = "id, bot_id, trigger_text, response, is_active, priority, created_at";
const SCHEDULED_COLUMNS: &str = "id, bot_id, recipient, content, scheduled_at, status, sent_at, error, job_id, created_at";

pub async fn insert_bot(pool: &AnyPool, kind: DbKind, record: &BotRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO bots (id, tenant_id, name, instagram_user_id, access_token_ciphertext, access_token_iv, is_active, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.name)
        .bind(&record.instagram_user_id)
        .bind(record.access_token_ciphertext.as_deref())
        .bind(record.access_token_iv.as_deref())
        .bind(bool_to_i64(record.is_active))
        .bind(datetime_to_millis(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_bot_active(pool: &AnyPool, kind: DbKind, bot_id: &str, active: bool) -> Result<()> {
    let sql = rewrite_sql("UPDATE bots SET is_active = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(bool_to_i64(active))
        .bind(bot_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_bot(pool: &AnyPool, kind: DbKind, bot_id: &str) -> Result<Option<BotRecord>> {
    let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(bot_id).fetch_optional(pool).await?;
    row.as_ref().map(bot_from_row).transpose()
}

/// Oldest active bot bound to the given Instagram account id.
pub async fn find_active_bot_by_instagram_id(pool: &AnyPool, kind: DbKind, instagram_user_id: &str) -> Result<Option<BotRecord>> {
    let sql = format!(
        "SELECT {BOT_COLUMNS} FROM bots WHERE instagram_user_id = ? AND is_active = 1 ORDER BY created_at ASC LIMIT 1"
    );
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(instagram_user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(bot_from_row).transpose()
}

pub async fn insert_automation(pool: &AnyPool, kind: DbKind, record: &AutomationRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO automations (id, bot_id, trigger_text, response, is_active, priority, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.bot_id)
        .bind(&record.trigger)
        .bind(&record.response)
        .bind(bool_to_i64(record.is_active))
        .bind(record.priority)
        .bind(datetime_to_millis(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Active automations for a bot, highest priority first, oldest first among equals.
pub async fn list_active_automations(pool: &AnyPool, kind: DbKind, bot_id: &str) -> Result<Vec<AutomationRecord>> {
    let sql = format!(
        "SELECT {AUTOMATION_COLUMNS} FROM automations WHERE bot_id = ? AND is_active = 1 ORDER BY priority DESC, created_at ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).bind(bot_id).fetch_all(pool).await?;
    rows.iter().map(automation_from_row).collect()
}

/// Find-or-create the chat for `(bot_id, external_user_id)` in one statement.
///
/// `last_message_at` only moves forward and `username` is only overwritten by a
/// known value, so replays and out-of-order events leave the row consistent.
pub async fn upsert_chat(
    pool: &AnyPool,
    kind: DbKind,
    bot_id: &str,
    external_user_id: &str,
    username: Option<&str>,
    at: DateTime<Utc>,
) -> Result<ChatUpsert> {
    let candidate_id = Uuid::new_v4().to_string();
    let at_ms = datetime_to_millis(at);
    let sql = rewrite_sql(
        r#"INSERT INTO chats (id, bot_id, external_user_id, username, last_message_at, created_at)
           VALUES (?, ?, ?, ?, ?, ?)
           ON CONFLICT(bot_id, external_user_id) DO UPDATE SET
               last_message_at = CASE WHEN excluded.last_message_at > chats.last_message_at
                   THEN excluded.last_message_at ELSE chats.last_message_at END,
               username = COALESCE(excluded.username, chats.username)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&candidate_id)
        .bind(bot_id)
        .bind(external_user_id)
        .bind(username)
        .bind(at_ms)
        .bind(datetime_to_millis(Utc::now()))
        .execute(pool)
        .await?;

    let chat = find_chat(pool, kind, bot_id, external_user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("chat for bot {bot_id} / user {external_user_id} vanished after upsert"))?;
    let created = chat.id == candidate_id;
    Ok(ChatUpsert { chat, created })
}

pub async fn find_chat(pool: &AnyPool, kind: DbKind, bot_id: &str, external_user_id: &str) -> Result<Option<ChatRecord>> {
    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE bot_id = ? AND external_user_id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(bot_id)
        .bind(external_user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(chat_from_row).transpose()
}

pub async fn get_chat(pool: &AnyPool, kind: DbKind, chat_id: &str) -> Result<Option<ChatRecord>> {
    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(chat_id).fetch_optional(pool).await?;
    row.as_ref().map(chat_from_row).transpose()
}

pub async fn list_chats(pool: &AnyPool, kind: DbKind, bot_id: Option<&str>, limit: i64, offset: i64) -> Result<Vec<ChatRecord>> {
    let filter = if bot_id.is_some() { "WHERE bot_id = ? " } else { "" };
    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats {filter}ORDER BY last_message_at DESC LIMIT ? OFFSET ?");
    let sql = rewrite_sql(&sql, kind);
    let mut query = sqlx::query(sql.as_ref());
    if let Some(bot_id) = bot_id {
        query = query.bind(bot_id);
    }
    let rows = query.bind(limit).bind(offset).fetch_all(pool).await?;
    rows.iter().map(chat_from_row).collect()
}

/// Appends a message. Returns `false` when a message with the same
/// `(chat_id, external_id)` already exists and nothing was written.
pub async fn insert_message(pool: &AnyPool, kind: DbKind, record: &MessageRecord) -> Result<bool> {
    let sql = rewrite_sql(
        r#"INSERT INTO messages (id, chat_id, content, sender, external_id, reply_to, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.chat_id)
        .bind(&record.content)
        .bind(record.sender.as_str())
        .bind(record.external_id.as_deref())
        .bind(record.reply_to.as_deref())
        .bind(datetime_to_millis(record.created_at))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn find_message_by_external_id(
    pool: &AnyPool,
    kind: DbKind,
    chat_id: &str,
    external_id: &str,
) -> Result<Option<MessageRecord>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? AND external_id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(chat_id)
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

/// Whether a bot reply to `message_id` has been recorded.
pub async fn has_reply(pool: &AnyPool, kind: DbKind, message_id: &str) -> Result<bool> {
    let sql = rewrite_sql("SELECT COUNT(1) AS n FROM messages WHERE reply_to = ?", kind);
    let n: i64 = sqlx::query(sql.as_ref())
        .bind(message_id)
        .fetch_one(pool)
        .await?
        .try_get("n")?;
    Ok(n > 0)
}

pub async fn list_messages(pool: &AnyPool, kind: DbKind, chat_id: &str, limit: i64, offset: i64) -> Result<Vec<MessageRecord>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? ORDER BY created_at ASC LIMIT ? OFFSET ?");
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(chat_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(message_from_row).collect()
}

pub async fn insert_scheduled_message(pool: &AnyPool, kind: DbKind, record: &ScheduledMessageRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO scheduled_messages (id, bot_id, recipient, content, scheduled_at, status, sent_at, error, job_id, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.bot_id)
        .bind(&record.recipient)
        .bind(&record.content)
        .bind(datetime_to_millis(record.scheduled_at))
        .bind(record.status.as_str())
        .bind(record.sent_at.map(datetime_to_millis))
        .bind(record.error.as_deref())
        .bind(record.job_id.as_deref())
        .bind(datetime_to_millis(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_scheduled_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<ScheduledMessageRecord>> {
    let sql = format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(scheduled_from_row).transpose()
}

pub async fn set_scheduled_job_id(pool: &AnyPool, kind: DbKind, id: &str, job_id: &str) -> Result<()> {
    let sql = rewrite_sql("UPDATE scheduled_messages SET job_id = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref()).bind(job_id).bind(id).execute(pool).await?;
    Ok(())
}

/// Transitions a `pending` row to `sent`. Returns `false` if it was cancelled
/// or otherwise settled in the meantime.
pub async fn mark_scheduled_sent(pool: &AnyPool, kind: DbKind, id: &str, sent_at: DateTime<Utc>) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE scheduled_messages SET status = 'sent', sent_at = ?, error = NULL WHERE id = ? AND status = 'pending'",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(sent_at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Keeps the row `pending` but remembers the latest attempt's error.
pub async fn record_scheduled_attempt_error(pool: &AnyPool, kind: DbKind, id: &str, error: &str) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE scheduled_messages SET error = ? WHERE id = ? AND status = 'pending'",
        kind,
    );
    sqlx::query(sql.as_ref()).bind(error).bind(id).execute(pool).await?;
    Ok(())
}

/// Transitions a `pending` row to `failed` with the given reason. Returns
/// `false` if the row was no longer pending.
pub async fn fail_if_pending(pool: &AnyPool, kind: DbKind, id: &str, reason: &str) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE scheduled_messages SET status = 'failed', error = ? WHERE id = ? AND status = 'pending'",
        kind,
    );
    let result = sqlx::query(sql.as_ref()).bind(reason).bind(id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_scheduled_messages(
    pool: &AnyPool,
    kind: DbKind,
    bot_id: Option<&str>,
    status: Option<ScheduledStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<ScheduledMessageRecord>> {
    let mut clauses = Vec::new();
    if bot_id.is_some() {
        clauses.push("bot_id = ?");
    }
    if status.is_some() {
        clauses.push("status = ?");
    }
    let filter = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {} ", clauses.join(" AND "))
    };
    let sql = format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages {filter}ORDER BY scheduled_at DESC LIMIT ? OFFSET ?");
    let sql = rewrite_sql(&sql, kind);
    let mut query = sqlx::query(sql.as_ref());
    if let Some(bot_id) = bot_id {
        query = query.bind(bot_id);
    }
    if let Some(status) = status {
        query = query.bind(status.as_str());
    }
    let rows = query.bind(limit).bind(offset).fetch_all(pool).await?;
    rows.iter().map(scheduled_from_row).collect()
}
