//! SQL-backed durable job queue.
//!
//! Jobs move `waiting -> active -> completed`, or back to `waiting` with an
//! exponential delay after a failed attempt, or to `failed` once the attempt
//! budget is spent. Claiming is a guarded update so two workers never hold the
//! same job at once.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::db::{datetime_to_millis, millis_to_datetime, rewrite_sql, DbKind};
use crate::types::JobPayload;

const KEEP_COMPLETED: i64 = 100;
const KEEP_FAILED: i64 = 50;
const MAX_BACKOFF_EXPONENT: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobStatus::Waiting),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub delay: Duration,
    pub attempts: i64,
    pub backoff_ms: i64,
}

impl JobOptions {
    pub fn immediate(policy: RetryPolicy) -> Self {
        Self {
            delay: Duration::zero(),
            attempts: policy.attempts.max(1),
            backoff_ms: policy.backoff_ms.max(0),
        }
    }

    pub fn delayed(policy: RetryPolicy, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::immediate(policy)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Attempts started so far, including the one in flight.
    pub attempts: i64,
    pub max_attempts: i64,
    pub backoff_ms: i64,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { run_at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`.
pub fn compute_backoff(base_ms: i64, attempt: i64) -> Duration {
    let exponent = (attempt.max(1) - 1).min(MAX_BACKOFF_EXPONENT);
    Duration::milliseconds(base_ms.max(0).saturating_mul(1_i64 << exponent))
}

const JOB_COLUMNS: &str =
    "id, queue, kind, payload, status, attempts, max_attempts, backoff_ms, run_at, last_error, created_at";

fn job_from_row(row: &AnyRow) -> Result<JobRecord> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        payload: serde_json::from_str(&payload)?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow::anyhow!("unknown job status: {status}"))?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        backoff_ms: row.try_get("backoff_ms")?,
        run_at: millis_to_datetime(row.try_get("run_at")?),
        last_error: row.try_get("last_error")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

pub async fn enqueue(pool: &AnyPool, kind: DbKind, queue: &str, payload: &JobPayload, opts: JobOptions) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let sql = rewrite_sql(
        r#"INSERT INTO jobs (id, queue, kind, payload, status, attempts, max_attempts, backoff_ms, run_at, last_error, created_at, updated_at)
           VALUES (?, ?, ?, ?, 'waiting', 0, ?, ?, ?, NULL, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&id)
        .bind(queue)
        .bind(payload.kind())
        .bind(serde_json::to_string(payload)?)
        .bind(opts.attempts)
        .bind(opts.backoff_ms)
        .bind(datetime_to_millis(now + opts.delay))
        .bind(datetime_to_millis(now))
        .bind(datetime_to_millis(now))
        .execute(pool)
        .await?;
    Ok(id)
}

/// Claims up to `limit` due jobs. Jobs another worker claimed first are skipped.
pub async fn claim(pool: &AnyPool, kind: DbKind, queue: &str, now: DateTime<Utc>, limit: i64) -> Result<Vec<JobRecord>> {
    let now_ms = datetime_to_millis(now);
    let select = format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ? AND status = 'waiting' AND run_at <= ? ORDER BY run_at ASC, created_at ASC LIMIT ?"
    );
    let select = rewrite_sql(&select, kind);
    let rows = sqlx::query(select.as_ref())
        .bind(queue)
        .bind(now_ms)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let update = rewrite_sql(
        "UPDATE jobs SET status = 'active', attempts = attempts + 1, updated_at = ? WHERE id = ? AND status = 'waiting'",
        kind,
    );
    let mut claimed = Vec::new();
    for row in rows {
        let mut job = match job_from_row(&row) {
            Ok(job) => job,
            Err(err) => {
                let id: String = row.try_get("id")?;
                tracing::error!(job_id = %id, "undecodable job, dead-lettering: {err:#}");
                dead_letter(pool, kind, &id, &format!("undecodable job: {err}")).await?;
                continue;
            }
        };
        let result = sqlx::query(update.as_ref())
            .bind(now_ms)
            .bind(&job.id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 1 {
            job.status = JobStatus::Active;
            job.attempts += 1;
            claimed.push(job);
        }
    }
    Ok(claimed)
}

pub async fn complete(pool: &AnyPool, kind: DbKind, job: &JobRecord) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE jobs SET status = 'completed', last_error = NULL, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(Utc::now()))
        .bind(&job.id)
        .execute(pool)
        .await?;
    prune(pool, kind, &job.queue, JobStatus::Completed, KEEP_COMPLETED).await
}

/// Records a failed attempt and either schedules the retry or dead-letters the job.
pub async fn fail(pool: &AnyPool, kind: DbKind, job: &JobRecord, error: &str) -> Result<FailOutcome> {
    if job.is_final_attempt() {
        dead_letter(pool, kind, &job.id, error).await?;
        prune(pool, kind, &job.queue, JobStatus::Failed, KEEP_FAILED).await?;
        return Ok(FailOutcome::DeadLettered);
    }

    let now = Utc::now();
    let run_at = now + compute_backoff(job.backoff_ms, job.attempts);
    let sql = rewrite_sql(
        "UPDATE jobs SET status = 'waiting', run_at = ?, last_error = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(run_at))
        .bind(error)
        .bind(datetime_to_millis(now))
        .bind(&job.id)
        .execute(pool)
        .await?;
    Ok(FailOutcome::Retrying { run_at })
}

async fn dead_letter(pool: &AnyPool, kind: DbKind, id: &str, error: &str) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE jobs SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(error)
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<JobRecord>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Deletes a job that has not started yet. Returns `false` if it is already
/// running, finished, or gone.
pub async fn remove(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool> {
    let sql = rewrite_sql("DELETE FROM jobs WHERE id = ? AND status = 'waiting'", kind);
    let result = sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Puts `active` jobs untouched since `stalled_before` back in line. Their
/// worker is assumed dead; the attempt it started still counts.
pub async fn recover_stalled(pool: &AnyPool, kind: DbKind, queue: &str, stalled_before: DateTime<Utc>) -> Result<u64> {
    let sql = rewrite_sql(
        "UPDATE jobs SET status = 'waiting', updated_at = ? WHERE queue = ? AND status = 'active' AND updated_at < ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(Utc::now()))
        .bind(queue)
        .bind(datetime_to_millis(stalled_before))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn counts(pool: &AnyPool, kind: DbKind, queue: &str) -> Result<QueueCounts> {
    let sql = rewrite_sql("SELECT status, COUNT(1) AS n FROM jobs WHERE queue = ? GROUP BY status", kind);
    let rows = sqlx::query(sql.as_ref()).bind(queue).fetch_all(pool).await?;
    let mut by_status = HashMap::new();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        by_status.insert(status, n);
    }

    let delayed_sql = rewrite_sql(
        "SELECT COUNT(1) AS n FROM jobs WHERE queue = ? AND status = 'waiting' AND run_at > ?",
        kind,
    );
    let delayed: i64 = sqlx::query(delayed_sql.as_ref())
        .bind(queue)
        .bind(datetime_to_millis(Utc::now()))
        .fetch_one(pool)
        .await?
        .try_get("n")?;

    let get = |status: JobStatus| by_status.get(status.as_str()).copied().unwrap_or(0);
    Ok(QueueCounts {
        waiting: get(JobStatus::Waiting) - delayed,
        active: get(JobStatus::Active),
        completed: get(JobStatus::Completed),
        failed: get(JobStatus::Failed),
        delayed,
    })
}

async fn prune(pool: &AnyPool, kind: DbKind, queue: &str, status: JobStatus, keep: i64) -> Result<()> {
    let sql = rewrite_sql(
        r#"DELETE FROM jobs WHERE queue = ? AND status = ? AND id NOT IN (
               SELECT id FROM jobs WHERE queue = ? AND status = ? ORDER BY updated_at DESC LIMIT ?
           )"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(queue)
        .bind(status.as_str())
        .bind(queue)
        .bind(status.as_str())
        .bind(keep)
        .execute(pool)
        .await?;
    Ok(())
}
