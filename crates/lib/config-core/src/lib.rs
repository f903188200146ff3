//! Engine bringup configuration from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of IMAP worker tasks.
const DEFAULT_IMAP_WORKERS: usize = 4;

/// Default number of notification worker tasks.
const DEFAULT_NOTIFY_WORKERS: usize = 1;

/// Default number of submission worker tasks.
const DEFAULT_SUBMIT_WORKERS: usize = 1;

/// Default cross-worker RPC timeout in seconds.
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;

/// Default queue reservation lease in milliseconds.
const DEFAULT_QUEUE_LEASE_MS: u64 = 60_000;

/// Default metrics retention in days.
const DEFAULT_METRICS_RETENTION_DAYS: u32 = 7;

/// Fully-resolved engine bringup configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Key prefix applied to all persisted state.
    pub kv_prefix: String,

    /// Snapshot path for the state store; `None` keeps state in memory.
    pub state_path: Option<PathBuf>,

    /// Number of IMAP worker tasks.
    pub imap_workers: usize,

    /// Number of notification worker tasks.
    pub notify_workers: usize,

    /// Number of submission worker tasks.
    pub submit_workers: usize,

    /// Optional secret that encrypts stored credentials.
    pub encryption_secret: Option<String>,

    /// Optional service secret for webhook signatures; generated and
    /// persisted on first start when absent.
    pub service_secret: Option<String>,

    /// Cross-worker RPC timeout.
    pub rpc_timeout: Duration,

    /// Queue reservation lease.
    pub queue_lease: Duration,

    /// Metrics retention in days.
    pub metrics_retention_days: u32,
}

/// Errors returned while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum FromEnvError {
    /// An environment variable failed to parse.
    #[error("environment variable {name}: {message}")]
    Var {
        /// Variable name.
        name: &'static str,

        /// Parse failure description.
        message: String,
    },
}

/// Read an optional variable, mapping parse failures to [`FromEnvError`].
fn maybe<T>(name: &'static str) -> Result<Option<T>, FromEnvError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    envfury::maybe(name).map_err(|err| FromEnvError::Var {
        name,
        message: err.to_string(),
    })
}

impl EngineConfig {
    /// Resolve the configuration from `MAILSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, FromEnvError> {
        Ok(Self {
            kv_prefix: maybe("MAILSYNC_KV_PREFIX")?.unwrap_or_default(),
            state_path: maybe("MAILSYNC_STATE_PATH")?,
            imap_workers: maybe("MAILSYNC_IMAP_WORKERS")?.unwrap_or(DEFAULT_IMAP_WORKERS),
            notify_workers: maybe("MAILSYNC_NOTIFY_WORKERS")?.unwrap_or(DEFAULT_NOTIFY_WORKERS),
            submit_workers: maybe("MAILSYNC_SUBMIT_WORKERS")?.unwrap_or(DEFAULT_SUBMIT_WORKERS),
            encryption_secret: maybe("MAILSYNC_ENCRYPTION_SECRET")?,
            service_secret: maybe("MAILSYNC_SERVICE_SECRET")?,
            rpc_timeout: Duration::from_secs(
                maybe("MAILSYNC_RPC_TIMEOUT_SECS")?.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS),
            ),
            queue_lease: Duration::from_millis(
                maybe("MAILSYNC_QUEUE_LEASE_MS")?.unwrap_or(DEFAULT_QUEUE_LEASE_MS),
            ),
            metrics_retention_days: maybe("MAILSYNC_METRICS_RETENTION_DAYS")?
                .unwrap_or(DEFAULT_METRICS_RETENTION_DAYS),
        })
    }
}
