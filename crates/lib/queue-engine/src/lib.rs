//! Durable at-least-once job queue over the key-value store.
//!
//! Each logical queue keeps a pending sorted set (scored by visibility
//! time), a delayed sorted set, an active lease table and bounded
//! completed/failed retention lists under `bull:{queue}:*`. Reservations
//! carry unique lease ids; a lease that expires without an ack or fail
//! makes the job visible again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use kv_store::{Store, Txn};

mod consumer;
mod job;
mod payload;


pub use consumer::{run_consumer, run_promoter};
pub use job::{
    FailOutcome, Job, JobOptions, JobOutcome, JobStatus, LeaseToken, QueueName, ReservedJob,
};
pub use payload::{SubmitPayload, delete_message_blob, load_message_blob, store_message_blob};

/// Errors returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Store access error.
    #[error("store: {0}")]
    Store(#[from] kv_store::StoreError),

    /// Job record encode error.
    #[error("job encode: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// Job record decode error.
    #[error("job decode: {0}")]
    Decode(#[source] rmp_serde::decode::Error),

    /// The lease does not match the current reservation of the job.
    #[error("stale lease for job {job_id}")]
    StaleLease {
        /// The job the caller believed it held.
        job_id: String,
    },

    /// The job no longer exists.
    #[error("unknown job {job_id}")]
    UnknownJob {
        /// The missing job id.
        job_id: String,
    },
}

/// A live reservation lease, persisted in the active table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct LeaseRecord {
    /// Unique lease id.
    lease_id: String,

    /// Reserving worker id.
    worker_id: String,

    /// When the lease expires, unix milliseconds.
    expires_at: i64,
}

/// Counts of jobs per lifecycle stage, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    /// Jobs in the pending set.
    pub pending: usize,

    /// Jobs in the delayed set.
    pub delayed: usize,

    /// Jobs under a live lease.
    pub active: usize,

    /// Retained completed jobs.
    pub completed: usize,

    /// Retained failed jobs.
    pub failed: usize,
}

/// Queue engine params.
#[derive(Debug, Clone)]
pub struct Params {
    /// Reservation lease duration.
    pub lease: Duration,

    /// Retention bound for completed and failed entries; `0` retains none.
    pub queue_keep: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            queue_keep: 100,
        }
    }
}

/// Handle to one logical queue.
#[derive(Debug, Clone)]
pub struct QueueEngine {
    /// Backing store.
    store: Store,

    /// Queue name.
    queue: QueueName,

    /// Reservation lease duration.
    lease: Duration,

    /// Retention bound, shared across clones so settings changes apply
    /// everywhere at once.
    queue_keep: Arc<AtomicU32>,
}

impl QueueEngine {
    /// Open a queue over the given store.
    pub fn new(store: Store, queue: QueueName, params: Params) -> Self {
        Self {
            store,
            queue,
            lease: params.lease,
            queue_keep: Arc::new(AtomicU32::new(params.queue_keep)),
        }
    }

    /// The queue this engine drives.
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Update the retention bound at runtime.
    pub fn set_queue_keep(&self, keep: u32) {
        self.queue_keep.store(keep, Ordering::Relaxed);
    }

    /// Key of a queue bookkeeping structure.
    fn key(&self, part: &str) -> String {
        format!("bull:{}:{part}", self.queue)
    }

    /// Member string for the pending/delayed sets.
    ///
    /// Higher priority sorts first; the monotonic id keeps FIFO order
    /// within a priority class.
    fn member(priority: u16, id: &str) -> String {
        format!("{:05}:{id}", u32::from(u16::MAX - priority))
    }

    /// Job id carried inside a set member.
    fn member_id(member: &str) -> &str {
        member.split_once(':').map(|(_, id)| id).unwrap_or(member)
    }

    /// Enqueue a payload; returns the new job id.
    ///
    /// The write is durable before this returns. With a `dedupe_key`, a
    /// previously enqueued job under the same key that is not currently
    /// active is replaced.
    pub async fn enqueue(
        &self,
        payload: Vec<u8>,
        opts: JobOptions,
    ) -> Result<String, QueueError> {
        let jobs_key = self.key("jobs");
        let pending_key = self.key("pending");
        let delayed_key = self.key("delayed");
        let id_key = self.key("id");
        let dedupe_key = self.key("dedupe");
        let queue = self.queue;

        let result = self
            .store
            .with_txn(move |txn| -> Result<String, QueueError> {
                if let Some(dedupe) = &opts.dedupe_key {
                    replace_deduped(txn, &jobs_key, &pending_key, &delayed_key, &dedupe_key, dedupe)?;
                }

                let id = format!("{:016}", txn.incr(&id_key));
                let now = txn.now_ms();
                let next_visible_at = now + opts.delay.as_millis() as i64;

                let job = Job {
                    id: id.clone(),
                    queue,
                    payload,
                    attempts_made: 0,
                    max_attempts: opts.attempts.max(1),
                    backoff_base_ms: opts.backoff_base.as_millis() as u64,
                    next_visible_at,
                    status: JobStatus::Pending,
                    priority: opts.priority,
                    progress: None,
                    last_error: None,
                    created_at: now,
                    finished_at: None,
                };

                write_job(txn, &jobs_key, &job)?;

                let member = Self::member(opts.priority, &id);
                if opts.delay.is_zero() {
                    txn.zset_add(&pending_key, &member, next_visible_at);
                } else {
                    txn.zset_add(&delayed_key, &member, next_visible_at);
                }
                if let Some(dedupe) = &opts.dedupe_key {
                    txn.hash_set(&dedupe_key, dedupe, id.clone().into_bytes());
                }

                Ok(id)
            })
            .await??;

        tracing::debug!(queue = %self.queue, job_id = %result, "enqueued job");
        Ok(result)
    }

    /// Atomically reserve the highest-priority visible job, if any.
    ///
    /// Expired leases are reclaimed first so jobs lost to a dead worker
    /// come back through here.
    pub async fn reserve(&self, worker_id: &str) -> Result<Option<ReservedJob>, QueueError> {
        let jobs_key = self.key("jobs");
        let pending_key = self.key("pending");
        let active_key = self.key("active");
        let lease_ms = self.lease.as_millis() as i64;
        let worker_id = worker_id.to_string();

        self.store
            .with_txn(move |txn| -> Result<Option<ReservedJob>, QueueError> {
                reclaim_expired_leases(txn, &jobs_key, &pending_key, &active_key)?;

                let now = txn.now_ms();
                let Some((member, _)) = txn.zset_pop_min_at_most(&pending_key, now) else {
                    return Ok(None);
                };
                let id = Self::member_id(&member).to_string();

                let mut job = read_job(txn, &jobs_key, &id)?;
                job.status = JobStatus::Active;
                write_job(txn, &jobs_key, &job)?;

                let lease = LeaseRecord {
                    lease_id: uuid::Uuid::new_v4().simple().to_string(),
                    worker_id,
                    expires_at: now + lease_ms,
                };
                let encoded = rmp_serde::to_vec_named(&lease).map_err(QueueError::Encode)?;
                txn.hash_set(&active_key, &id, encoded);

                Ok(Some(ReservedJob {
                    lease: LeaseToken {
                        job_id: id,
                        lease_id: lease.lease_id,
                    },
                    job,
                }))
            })
            .await?
    }

    /// Record a progress marker on an active job.
    pub async fn progress(&self, token: &LeaseToken, progress: &str) -> Result<(), QueueError> {
        let jobs_key = self.key("jobs");
        let active_key = self.key("active");
        let held = token.clone();
        let progress = progress.to_string();

        self.store
            .with_txn(move |txn| -> Result<(), QueueError> {
                verify_lease(txn, &active_key, &held)?;
                let mut job = read_job(txn, &jobs_key, &held.job_id)?;
                job.progress = Some(progress);
                write_job(txn, &jobs_key, &job)
            })
            .await?
    }

    /// Complete a reserved job.
    pub async fn ack(
        &self,
        token: &LeaseToken,
        progress: Option<String>,
    ) -> Result<(), QueueError> {
        let jobs_key = self.key("jobs");
        let active_key = self.key("active");
        let completed_key = self.key("completed");
        let keep = self.queue_keep.load(Ordering::Relaxed);
        let held = token.clone();

        self.store
            .with_txn(move |txn| -> Result<(), QueueError> {
                verify_lease(txn, &active_key, &held)?;
                txn.hash_del(&active_key, &[held.job_id.as_str()]);

                let mut job = read_job(txn, &jobs_key, &held.job_id)?;
                job.status = JobStatus::Completed;
                if progress.is_some() {
                    job.progress = progress;
                }
                job.finished_at = Some(txn.now_ms());

                retain_terminal(txn, &jobs_key, &completed_key, job, keep)
            })
            .await??;

        tracing::debug!(queue = %self.queue, job_id = %token.job_id, "job completed");
        Ok(())
    }

    /// Fail a reserved job.
    ///
    /// With `retry` and attempts remaining the job is rescheduled with an
    /// exponential delay; otherwise it terminal-fails and the caller is
    /// told so it can run its terminal handling.
    pub async fn fail(
        &self,
        token: &LeaseToken,
        error: &str,
        retry: bool,
    ) -> Result<FailOutcome, QueueError> {
        let jobs_key = self.key("jobs");
        let active_key = self.key("active");
        let delayed_key = self.key("delayed");
        let failed_key = self.key("failed");
        let keep = self.queue_keep.load(Ordering::Relaxed);
        let held = token.clone();
        let error = error.to_string();

        let outcome = self
            .store
            .with_txn(move |txn| -> Result<FailOutcome, QueueError> {
                verify_lease(txn, &active_key, &held)?;
                txn.hash_del(&active_key, &[held.job_id.as_str()]);

                let mut job = read_job(txn, &jobs_key, &held.job_id)?;
                let backoff = exp_backoff::Policy {
                    base: Duration::from_millis(job.backoff_base_ms),
                    max: None,
                };
                let delay = backoff.delay_for(job.attempts_made);
                job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
                job.last_error = Some(error);

                if retry && job.attempts_made < job.max_attempts {
                    let next_visible_at = txn.now_ms() + delay.as_millis() as i64;
                    job.status = JobStatus::Pending;
                    job.next_visible_at = next_visible_at;
                    let member = Self::member(job.priority, &job.id);
                    txn.zset_add(&delayed_key, &member, next_visible_at);
                    write_job(txn, &jobs_key, &job)?;
                    return Ok(FailOutcome::Retried { next_visible_at });
                }

                job.status = JobStatus::Failed;
                job.finished_at = Some(txn.now_ms());
                retain_terminal(txn, &jobs_key, &failed_key, job, keep)?;
                Ok(FailOutcome::Terminal)
            })
            .await??;

        match outcome {
            FailOutcome::Retried { next_visible_at } => {
                tracing::debug!(
                    queue = %self.queue,
                    job_id = %token.job_id,
                    next_visible_at,
                    "job failed, retry scheduled"
                );
            }
            FailOutcome::Terminal => {
                tracing::warn!(queue = %self.queue, job_id = %token.job_id, "job terminally failed");
            }
        }
        Ok(outcome)
    }

    /// Terminal-fail a reserved job regardless of remaining attempts.
    pub async fn discard(&self, token: &LeaseToken, error: &str) -> Result<(), QueueError> {
        let jobs_key = self.key("jobs");
        let active_key = self.key("active");
        let failed_key = self.key("failed");
        let keep = self.queue_keep.load(Ordering::Relaxed);
        let held = token.clone();
        let error = error.to_string();

        self.store
            .with_txn(move |txn| -> Result<(), QueueError> {
                verify_lease(txn, &active_key, &held)?;
                txn.hash_del(&active_key, &[held.job_id.as_str()]);

                let mut job = read_job(txn, &jobs_key, &held.job_id)?;
                job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
                job.status = JobStatus::Failed;
                job.last_error = Some(error);
                job.finished_at = Some(txn.now_ms());
                retain_terminal(txn, &jobs_key, &failed_key, job, keep)
            })
            .await??;

        tracing::warn!(queue = %self.queue, job_id = %token.job_id, "job discarded");
        Ok(())
    }

    /// Promote due delayed jobs into the pending set and reclaim expired
    /// leases. Runs from the periodic scheduler.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let jobs_key = self.key("jobs");
        let pending_key = self.key("pending");
        let delayed_key = self.key("delayed");
        let active_key = self.key("active");

        self.store
            .with_txn(move |txn| -> Result<usize, QueueError> {
                let reclaimed =
                    reclaim_expired_leases(txn, &jobs_key, &pending_key, &active_key)?;

                let now = txn.now_ms();
                let due = txn.zset_range_at_most(&delayed_key, now);
                for (member, score) in &due {
                    txn.zset_remove(&delayed_key, member);
                    txn.zset_add(&pending_key, member, *score);
                }
                Ok(reclaimed + due.len())
            })
            .await?
    }

    /// Load a job record by id.
    pub async fn job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let jobs_key = self.key("jobs");
        let id = id.to_string();
        self.store
            .with_txn(move |txn| -> Result<Option<Job>, QueueError> {
                match txn.hash_get(&jobs_key, &id) {
                    Some(raw) => Ok(Some(
                        rmp_serde::from_slice(&raw).map_err(QueueError::Decode)?,
                    )),
                    None => Ok(None),
                }
            })
            .await?
    }

    /// Per-stage job counts.
    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let pending_key = self.key("pending");
        let delayed_key = self.key("delayed");
        let active_key = self.key("active");
        let completed_key = self.key("completed");
        let failed_key = self.key("failed");

        self.store
            .with_txn(move |txn| -> Result<QueueCounts, QueueError> {
                Ok(QueueCounts {
                    pending: txn.zset_len(&pending_key),
                    delayed: txn.zset_len(&delayed_key),
                    active: txn.hash_get_all(&active_key).len(),
                    completed: txn.list_len(&completed_key),
                    failed: txn.list_len(&failed_key),
                })
            })
            .await?
    }
}

/// Read a job record or report it missing.
fn read_job(txn: &mut Txn<'_>, jobs_key: &str, id: &str) -> Result<Job, QueueError> {
    let raw = txn.hash_get(jobs_key, id).ok_or_else(|| QueueError::UnknownJob {
        job_id: id.to_string(),
    })?;
    rmp_serde::from_slice(&raw).map_err(QueueError::Decode)
}

/// Write a job record.
fn write_job(txn: &mut Txn<'_>, jobs_key: &str, job: &Job) -> Result<(), QueueError> {
    let encoded = rmp_serde::to_vec_named(job).map_err(QueueError::Encode)?;
    txn.hash_set(jobs_key, &job.id, encoded);
    Ok(())
}

/// Check that the caller still holds the reservation.
fn verify_lease(
    txn: &mut Txn<'_>,
    active_key: &str,
    token: &LeaseToken,
) -> Result<(), QueueError> {
    let stale = || QueueError::StaleLease {
        job_id: token.job_id.clone(),
    };
    let raw = txn.hash_get(active_key, &token.job_id).ok_or_else(stale)?;
    let lease: LeaseRecord = rmp_serde::from_slice(&raw).map_err(QueueError::Decode)?;
    if lease.lease_id != token.lease_id {
        return Err(stale());
    }
    Ok(())
}

/// Move jobs whose lease expired back into the pending set.
fn reclaim_expired_leases(
    txn: &mut Txn<'_>,
    jobs_key: &str,
    pending_key: &str,
    active_key: &str,
) -> Result<usize, QueueError> {
    let now = txn.now_ms();
    let active = txn.hash_get_all(active_key);
    let mut reclaimed = 0;

    for (id, raw) in active {
        let lease: LeaseRecord = rmp_serde::from_slice(&raw).map_err(QueueError::Decode)?;
        if lease.expires_at > now {
            continue;
        }

        txn.hash_del(active_key, &[id.as_str()]);
        let mut job = read_job(txn, jobs_key, &id)?;
        job.status = JobStatus::Pending;
        job.next_visible_at = now;
        let member = QueueEngine::member(job.priority, &job.id);
        txn.zset_add(pending_key, &member, now);
        write_job(txn, jobs_key, &job)?;

        tracing::warn!(job_id = %id, worker_id = %lease.worker_id, "reclaimed expired lease");
        reclaimed += 1;
    }

    Ok(reclaimed)
}

/// Retain a terminal job per the keep bound, trimming overflow records.
fn retain_terminal(
    txn: &mut Txn<'_>,
    jobs_key: &str,
    retention_key: &str,
    job: Job,
    keep: u32,
) -> Result<(), QueueError> {
    if keep == 0 {
        txn.hash_del(jobs_key, &[job.id.as_str()]);
        return Ok(());
    }

    write_job(txn, jobs_key, &job)?;
    txn.list_push_front(retention_key, job.id.clone().into_bytes());
    while txn.list_len(retention_key) > keep as usize {
        if let Some(dropped) = txn.list_pop_back(retention_key) {
            let dropped_id = String::from_utf8_lossy(&dropped).into_owned();
            txn.hash_del(jobs_key, &[dropped_id.as_str()]);
        }
    }
    Ok(())
}

/// Drop a previously deduped job that has not started running.
fn replace_deduped(
    txn: &mut Txn<'_>,
    jobs_key: &str,
    pending_key: &str,
    delayed_key: &str,
    dedupe_key: &str,
    dedupe: &str,
) -> Result<(), QueueError> {
    let Some(raw) = txn.hash_get(dedupe_key, dedupe) else {
        return Ok(());
    };
    let prior_id = String::from_utf8_lossy(&raw).into_owned();
    let Some(raw_job) = txn.hash_get(jobs_key, &prior_id) else {
        return Ok(());
    };
    let prior: Job = rmp_serde::from_slice(&raw_job).map_err(QueueError::Decode)?;
    if prior.status != JobStatus::Pending {
        return Ok(());
    }

    let member = QueueEngine::member(prior.priority, &prior.id);
    txn.zset_remove(pending_key, &member);
    txn.zset_remove(delayed_key, &member);
    txn.hash_del(jobs_key, &[prior_id.as_str()]);
    Ok(())
}
