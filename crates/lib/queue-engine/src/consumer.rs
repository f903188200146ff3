//! Queue consumer and scheduler loops.

use std::future::Future;
use std::time::Duration;

use crate::{FailOutcome, Job, JobOutcome, QueueEngine, QueueError};

/// Run the delayed-to-pending promoter until shutdown.
///
/// Store failures are fatal; the supervisor restarts the worker and
/// reservations resume through lease expiry.
pub async fn run_promoter(
    engine: QueueEngine,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), QueueError> {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                engine.promote_due().await?;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Run a consumer loop over a queue until shutdown.
///
/// The handler's verdict drives the queue: `Complete` acks, `Retry` goes
/// through the backoff schedule, `Discard` terminal-fails immediately.
/// `on_terminal` runs exactly when a job reaches terminal failure, with
/// the job and its final error.
pub async fn run_consumer<Handle, HandleFut, OnTerminal, OnTerminalFut>(
    engine: QueueEngine,
    worker_id: &str,
    poll_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    mut handle: Handle,
    mut on_terminal: OnTerminal,
) -> Result<(), QueueError>
where
    Handle: FnMut(Job) -> HandleFut,
    HandleFut: Future<Output = JobOutcome>,
    OnTerminal: FnMut(Job, String) -> OnTerminalFut,
    OnTerminalFut: Future<Output = ()>,
{
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let reserved = match engine.reserve(worker_id).await? {
            Some(reserved) => reserved,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        let job = reserved.job.clone();
        let outcome = handle(reserved.job).await;

        match outcome {
            JobOutcome::Complete(progress) => {
                if let Err(err) = engine.ack(&reserved.lease, progress).await {
                    handle_disposition_error(err)?;
                }
            }
            JobOutcome::Retry(error) => {
                match engine.fail(&reserved.lease, &error, true).await {
                    Ok(FailOutcome::Terminal) => on_terminal(job, error).await,
                    Ok(FailOutcome::Retried { .. }) => {}
                    Err(err) => handle_disposition_error(err)?,
                }
            }
            JobOutcome::Discard(error) => {
                match engine.discard(&reserved.lease, &error).await {
                    Ok(()) => on_terminal(job, error).await,
                    Err(err) => handle_disposition_error(err)?,
                }
            }
        }
    }
}

/// Swallow lease races, propagate everything else.
///
/// A stale lease means the job outlived our reservation and was handed to
/// another worker; the other worker owns the disposition now.
fn handle_disposition_error(err: QueueError) -> Result<(), QueueError> {
    match err {
        QueueError::StaleLease { job_id } => {
            tracing::warn!(%job_id, "lease expired mid-handling, dropping disposition");
            Ok(())
        }
        QueueError::UnknownJob { job_id } => {
            tracing::warn!(%job_id, "job vanished mid-handling, dropping disposition");
            Ok(())
        }
        other => Err(other),
    }
}
