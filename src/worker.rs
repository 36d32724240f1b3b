use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{MESSAGE_QUEUE, SCHEDULED_QUEUE};
use crate::queue::{self, FailOutcome, JobRecord};
use crate::scheduled::{self, JobContext};
use crate::types::JobPayload;
use crate::{processor, AppState};

/// Spawns the configured number of consumers for both queues. They exit once
/// `shutdown` flips to `true`.
pub fn spawn_workers(state: AppState, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let plan = [
        (MESSAGE_QUEUE, state.config.queue.message_workers),
        (SCHEDULED_QUEUE, state.config.queue.scheduled_workers),
    ];
    for (queue_name, count) in plan {
        for worker_id in 0..count.max(1) {
            handles.push(tokio::spawn(run_worker(state.clone(), queue_name, worker_id, shutdown.clone())));
        }
    }
    handles
}

pub async fn run_worker(state: AppState, queue_name: &'static str, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
    info!(queue = queue_name, worker_id, "worker started");
    let poll = std::time::Duration::from_millis(state.config.queue.poll_interval_ms.max(10));

    while !*shutdown.borrow() {
        if worker_id == 0 {
            let cutoff = Utc::now() - Duration::seconds(state.config.queue.stall_timeout_secs);
            match queue::recover_stalled(&state.pool, state.db_kind, queue_name, cutoff).await {
                Ok(0) => {}
                Ok(n) => warn!(queue = queue_name, recovered = n, "requeued stalled jobs"),
                Err(err) => error!(queue = queue_name, "stall recovery failed: {err:#}"),
            }
        }

        let processed = match run_once(&state, queue_name).await {
            Ok(n) => n,
            Err(err) => {
                error!(queue = queue_name, worker_id, "claim failed: {err:#}");
                0
            }
        };
        if processed > 0 {
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = sleep(poll) => {}
        }
    }
    info!(queue = queue_name, worker_id, "worker stopped");
}

/// Claims one batch from `queue_name` and runs it. Returns how many jobs ran.
pub async fn run_once(state: &AppState, queue_name: &str) -> Result<usize> {
    let batch = queue::claim(&state.pool, state.db_kind, queue_name, Utc::now(), state.config.queue.batch_size).await?;
    let count = batch.len();
    for job in batch {
        settle(state, &job, dispatch(state, &job).await).await;
    }
    Ok(count)
}

pub async fn dispatch(state: &AppState, job: &JobRecord) -> Result<()> {
    match &job.payload {
        JobPayload::WebhookMessage(data) => {
            let outcome = processor::process_webhook_message(state, data).await?;
            debug!(job_id = %job.id, ?outcome, "webhook message processed");
        }
        JobPayload::InboundMessage(data) => {
            let outcome = processor::process_inbound_message(state, data).await?;
            debug!(job_id = %job.id, ?outcome, "inbound message processed");
        }
        JobPayload::ScheduledMessage(data) => {
            let ctx = JobContext {
                attempt: job.attempts,
                max_attempts: job.max_attempts,
            };
            let outcome = scheduled::process_scheduled_message(state, data, ctx).await?;
            debug!(job_id = %job.id, ?outcome, "scheduled message processed");
        }
    }
    Ok(())
}

async fn settle(state: &AppState, job: &JobRecord, result: Result<()>) {
    match result {
        Ok(()) => {
            if let Err(err) = queue::complete(&state.pool, state.db_kind, job).await {
                error!(job_id = %job.id, "failed to mark job completed: {err:#}");
            }
        }
        Err(err) => {
            let reason = format!("{err:#}");
            match queue::fail(&state.pool, state.db_kind, job, &reason).await {
                Ok(FailOutcome::Retrying { run_at }) => warn!(
                    job_id = %job.id,
                    kind = job.payload.kind(),
                    attempt = job.attempts,
                    retry_at = %run_at.to_rfc3339(),
                    "job failed, will retry: {reason}"
                ),
                Ok(FailOutcome::DeadLettered) => error!(
                    job_id = %job.id,
                    kind = job.payload.kind(),
                    attempts = job.attempts,
                    "job failed permanently: {reason}"
                ),
                Err(db_err) => error!(job_id = %job.id, "failed to record job failure: {db_err:#}"),
            }
        }
    }
}
