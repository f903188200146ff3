//! The submission worker: drives `submit` jobs to the owning IMAP worker.
//!
//! Each job references a durable message blob under `iaq:{account}`; the
//! blob outlives the job until it reaches a terminal state, so a lost job
//! never loses the message. Permanent upstream rejections are discarded,
//! transient ones ride the queue's backoff schedule, and terminal
//! failures inform the user through a `messageFailed` notification.

use std::time::Duration;

use event_core::{Event, EventKind};
use imap_client::QueuedMessage;
use kv_store::Store;
use queue_engine::{
    FailOutcome, Job, JobOptions, LeaseToken, QueueEngine, QueueError, SubmitPayload, run_promoter,
};
use supervisor::{AccountRequest, AccountResponse, SupervisorHandle, WorkerContext};

/// Attempt budget for the `messageFailed` notification itself.
const FAILURE_NOTIFY_ATTEMPTS: u32 = 10;

/// Base backoff of the `messageFailed` notification.
const FAILURE_NOTIFY_BACKOFF: Duration = Duration::from_secs(5);

/// Worker construction params.
#[derive(Clone)]
pub struct Params {
    /// Backing store.
    pub store: Store,

    /// The submission queue this worker consumes.
    pub submit_queue: QueueEngine,

    /// The notification queue for `messageSent`/`messageFailed` events.
    pub notify_queue: QueueEngine,

    /// Idle poll interval between empty reservations.
    pub poll_interval: Duration,

    /// Delayed-to-pending promoter period.
    pub promoter_interval: Duration,
}

/// Run a submission worker until shutdown.
///
/// Store failures are fatal: the loop returns and the supervisor
/// restarts the worker; in-flight reservations come back via lease
/// expiry.
pub async fn run(mut ctx: WorkerContext, params: Params) {
    ctx.supervisor.ready(&ctx.worker_id).await;
    tracing::info!(worker = %ctx.worker_id, "submission worker ready");

    tokio::spawn(run_promoter(
        params.submit_queue.clone(),
        params.promoter_interval,
        ctx.shutdown.clone(),
    ));

    let result = consume(&mut ctx, &params).await;
    if let Err(err) = result {
        tracing::error!(worker = %ctx.worker_id, %err, "submission worker store failure");
    }
}

/// The consumption loop.
async fn consume(ctx: &mut WorkerContext, params: &Params) -> Result<(), QueueError> {
    loop {
        if *ctx.shutdown.borrow() {
            return Ok(());
        }

        let Some(reserved) = params.submit_queue.reserve(&ctx.worker_id).await? else {
            tokio::select! {
                _ = tokio::time::sleep(params.poll_interval) => {}
                _ = ctx.shutdown.changed() => {}
            }
            continue;
        };

        handle_job(params, &ctx.supervisor, reserved.job, reserved.lease).await?;
    }
}

/// Process one reserved submission job end to end.
async fn handle_job(
    params: &Params,
    supervisor: &SupervisorHandle,
    job: Job,
    lease: LeaseToken,
) -> Result<(), QueueError> {
    let payload: SubmitPayload = match job.payload_json() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(job_id = %job.id, %err, "undecodable submit payload");
            params
                .submit_queue
                .discard(&lease, &format!("undecodable payload: {err}"))
                .await?;
            return Ok(());
        }
    };

    // A missing blob means the account (or the queued message) was
    // deleted under the job; drop it silently.
    let blob =
        queue_engine::load_message_blob(&params.store, &payload.account, &payload.queue_id)
            .await?;
    let Some(blob) = blob else {
        tracing::debug!(
            job_id = %job.id,
            account = %payload.account,
            queue_id = %payload.queue_id,
            "message blob gone, dropping job"
        );
        params
            .submit_queue
            .ack(&lease, Some("blob-missing".to_string()))
            .await?;
        return Ok(());
    };

    let message: QueuedMessage = match rmp_serde::from_slice(&blob) {
        Ok(message) => message,
        Err(err) => {
            tracing::error!(job_id = %job.id, %err, "undecodable message blob");
            params
                .submit_queue
                .discard(&lease, &format!("undecodable blob: {err}"))
                .await?;
            finish_terminal(params, supervisor, &payload, "undecodable blob").await?;
            return Ok(());
        }
    };

    params.submit_queue.progress(&lease, "processing").await?;

    let result = supervisor
        .account_call(
            &payload.account,
            AccountRequest::SubmitMessage {
                raw: message.raw,
                envelope: message.envelope,
            },
        )
        .await;

    match result {
        Ok(response) => {
            params.submit_queue.progress(&lease, "submitted").await?;

            let receipt = match response {
                AccountResponse::Submitted(receipt) => Some(receipt),
                _ => None,
            };
            emit(
                params,
                supervisor,
                &payload.account,
                EventKind::MessageSent,
                serde_json::json!({
                    "queueId": payload.queue_id,
                    "messageId": payload.message_id,
                    "response": receipt.map(|r| r.response),
                }),
            )
            .await?;

            queue_engine::delete_message_blob(&params.store, &payload.account, &payload.queue_id)
                .await?;
            params.submit_queue.ack(&lease, None).await?;
            supervisor.metric("submissions_sent", 1).await;
        }
        Err(error) if is_permanent(&error) => {
            tracing::warn!(
                job_id = %job.id,
                account = %payload.account,
                %error,
                "permanent submission rejection"
            );
            params.submit_queue.discard(&lease, &error.to_string()).await?;
            finish_terminal(params, supervisor, &payload, &error.to_string()).await?;
        }
        Err(error) => {
            let outcome = params
                .submit_queue
                .fail(&lease, &error.to_string(), true)
                .await?;
            if outcome == FailOutcome::Terminal {
                finish_terminal(params, supervisor, &payload, &error.to_string()).await?;
            }
        }
    }

    Ok(())
}

/// Terminal-failure bookkeeping: drop the blob, tell the user.
async fn finish_terminal(
    params: &Params,
    supervisor: &SupervisorHandle,
    payload: &SubmitPayload,
    error: &str,
) -> Result<(), QueueError> {
    queue_engine::delete_message_blob(&params.store, &payload.account, &payload.queue_id).await?;
    emit(
        params,
        supervisor,
        &payload.account,
        EventKind::MessageFailed,
        serde_json::json!({
            "queueId": payload.queue_id,
            "messageId": payload.message_id,
            "error": error,
        }),
    )
    .await?;
    supervisor.metric("submissions_failed", 1).await;
    Ok(())
}

/// Enqueue a notification event.
async fn emit(
    params: &Params,
    supervisor: &SupervisorHandle,
    account: &str,
    kind: EventKind,
    data: serde_json::Value,
) -> Result<(), QueueError> {
    let event = Event::new(account, kind, data);
    let payload = match serde_json::to_vec(&event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(%err, "event encode failed");
            return Ok(());
        }
    };
    params
        .notify_queue
        .enqueue(
            payload,
            JobOptions {
                attempts: FAILURE_NOTIFY_ATTEMPTS,
                backoff_base: FAILURE_NOTIFY_BACKOFF,
                ..Default::default()
            },
        )
        .await?;
    supervisor.metric("events_emitted", 1).await;
    Ok(())
}

/// Whether a submission error warrants a discard instead of a retry.
///
/// 5xx means the upstream rejected the message for good. Transport-level
/// failures, a momentarily unowned account (503) and RPC timeouts (504)
/// stay on the retry schedule.
fn is_permanent(error: &imap_client::OpError) -> bool {
    if matches!(error.code.as_str(), "ETRANSPORT" | "ENOHANDLER" | "Timeout") {
        return false;
    }
    error.status_code >= 500
}
