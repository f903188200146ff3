//! Job records and handler verdicts.

use std::time::Duration;

/// A logical queue name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// Outbound message submission.
    Submit,

    /// Webhook notification delivery.
    Notify,
}

impl QueueName {
    /// The queue's wire name, also used in its key namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Notify => "notify",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options applied when enqueueing a job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Maximum delivery attempts before the job terminal-fails.
    pub attempts: u32,

    /// Base delay of the exponential retry backoff.
    pub backoff_base: Duration,

    /// Initial visibility delay.
    pub delay: Duration,

    /// Priority; higher reserves first among visible jobs.
    pub priority: u16,

    /// Replacement key: an existing non-active job enqueued with the same
    /// key is dropped before this one is added.
    pub dedupe_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(1),
            delay: Duration::ZERO,
            priority: 0,
            dedupe_key: None,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Visible or scheduled for pickup.
    Pending,

    /// Reserved under a live lease.
    Active,

    /// Finished successfully.
    Completed,

    /// Terminally failed.
    Failed,
}

/// A persisted queue job.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Job {
    /// Monotonic job id, zero-padded for stable ordering.
    pub id: String,

    /// Owning queue.
    pub queue: QueueName,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Attempts made so far.
    pub attempts_made: u32,

    /// Attempt bound.
    pub max_attempts: u32,

    /// Base delay of the retry backoff, milliseconds.
    pub backoff_base_ms: u64,

    /// When the job becomes visible for reservation, unix milliseconds.
    pub next_visible_at: i64,

    /// Lifecycle status.
    pub status: JobStatus,

    /// Priority; higher reserves first.
    pub priority: u16,

    /// Free-form progress marker updated by the consumer.
    pub progress: Option<String>,

    /// Last recorded handler error.
    pub last_error: Option<String>,

    /// Creation time, unix milliseconds.
    pub created_at: i64,

    /// Terminal time, unix milliseconds.
    pub finished_at: Option<i64>,
}

impl Job {
    /// Decode the payload as JSON.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// A reservation handle proving lease ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    /// Reserved job id.
    pub job_id: String,

    /// Unique lease id minted at reservation time.
    pub lease_id: String,
}

/// A reserved job with its lease.
#[derive(Debug, Clone)]
pub struct ReservedJob {
    /// The job snapshot at reservation time.
    pub job: Job,

    /// The lease protecting this reservation.
    pub lease: LeaseToken,
}

/// Verdict returned by a job handler.
///
/// The queue engine acts on the variant; handlers never drive retry by
/// raising errors.
#[derive(Debug)]
pub enum JobOutcome {
    /// The job completed; retain with this final progress marker.
    Complete(Option<String>),

    /// The job failed but may be retried on the backoff schedule.
    Retry(String),

    /// The job failed permanently; no further attempts regardless of budget.
    Discard(String),
}

/// What happened to a job inside [`fail`](crate::QueueEngine::fail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// A retry was scheduled for the given visibility time.
    Retried {
        /// When the retry becomes visible, unix milliseconds.
        next_visible_at: i64,
    },

    /// The job is terminal; no retries remain.
    Terminal,
}
