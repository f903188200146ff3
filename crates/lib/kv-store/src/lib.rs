//! Single-node key-value store adapter.
//!
//! All durable engine state goes through this crate: hashes, sorted sets,
//! lists, sets, scalar keys with expiry, counters and pub/sub channels.
//! Mutations run inside a transaction that holds the store lock, and the
//! whole state is snapshotted to disk (MessagePack, atomic rename) when a
//! snapshot path is configured.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

mod state;

#[cfg(test)]
mod tests;

pub use state::Txn;

/// Raw value bytes stored under a key or field.
pub type Bytes = Vec<u8>;

/// Capacity of a single pub/sub channel buffer.
const CHANNEL_CAPACITY: usize = 1024;

/// Store open params.
#[derive(Debug, Clone, Default)]
pub struct Params {
    /// Prefix applied to every key.
    pub prefix: String,

    /// Snapshot file path; `None` keeps the store in memory only.
    pub snapshot_path: Option<PathBuf>,
}

/// Errors returned while opening a store.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// Snapshot file read error.
    #[error("snapshot read: {0}")]
    Read(#[source] std::io::Error),

    /// Snapshot decode error.
    #[error("snapshot decode: {0}")]
    Decode(#[source] rmp_serde::decode::Error),
}

/// Errors returned by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Snapshot encode error.
    #[error("snapshot encode: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// Snapshot write error.
    #[error("snapshot write: {0}")]
    Write(#[source] std::io::Error),
}

/// Shared store internals.
struct Shared {
    /// The data state, guarded for transactional access.
    state: tokio::sync::Mutex<state::State>,

    /// Key prefix.
    prefix: String,

    /// Snapshot file path, if durability is enabled.
    snapshot_path: Option<PathBuf>,

    /// Pub/sub channels keyed by channel name.
    channels: std::sync::Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

/// Handle to a single-node key-value store.
#[derive(Clone)]
pub struct Store {
    /// Shared internals.
    shared: Arc<Shared>,
}

impl Store {
    /// Open a store, loading the snapshot when one exists at the configured path.
    pub async fn open(params: Params) -> Result<Self, OpenError> {
        let Params {
            prefix,
            snapshot_path,
        } = params;

        let state = match &snapshot_path {
            Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => {
                let buf = tokio::fs::read(path).await.map_err(OpenError::Read)?;
                rmp_serde::from_slice(&buf).map_err(OpenError::Decode)?
            }
            _ => state::State::default(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                state: tokio::sync::Mutex::new(state),
                prefix,
                snapshot_path,
                channels: std::sync::Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Open an in-memory store with no prefix.
    pub async fn in_memory() -> Self {
        Self::open(Params::default())
            .await
            .unwrap_or_else(|_| unreachable!("in-memory open cannot fail"))
    }

    /// Apply the configured prefix to a key.
    pub fn prefixed(&self, key: &str) -> String {
        if self.shared.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.shared.prefix)
        }
    }

    /// Run a transaction against the store state.
    ///
    /// The closure runs under the store lock; every operation inside it is
    /// atomic with respect to other callers. The snapshot is persisted after
    /// the closure returns.
    pub async fn with_txn<R>(&self, f: impl FnOnce(&mut Txn<'_>) -> R) -> Result<R, StoreError> {
        let mut state = self.shared.state.lock().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let result = {
            let mut txn = Txn::new(&mut state, now_ms, &self.shared.prefix);
            f(&mut txn)
        };
        self.persist(&state).await?;
        Ok(result)
    }

    /// Write the snapshot to disk when a path is configured.
    async fn persist(&self, state: &state::State) -> Result<(), StoreError> {
        let Some(path) = &self.shared.snapshot_path else {
            return Ok(());
        };
        let buf = rmp_serde::to_vec_named(state).map_err(StoreError::Encode)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &buf)
            .await
            .map_err(StoreError::Write)?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(StoreError::Write)?;
        Ok(())
    }

    /// Publish a payload on a pub/sub channel.
    ///
    /// Messages are delivered to current subscribers only; there is no
    /// durability for pub/sub.
    pub fn publish(&self, channel: &str, payload: Bytes) {
        let channels = self
            .shared
            .channels
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if let Some(sender) = channels.get(channel) {
            // Errors mean no live subscribers.
            let _ = sender.send(payload);
        }
    }

    /// Subscribe to a pub/sub channel.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        let mut channels = self
            .shared
            .channels
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Set a hash field.
    pub async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        let value = value.into();
        self.with_txn(|txn| txn.hash_set(key, field, value)).await
    }

    /// Set multiple hash fields at once.
    pub async fn hash_set_multi(
        &self,
        key: &str,
        entries: Vec<(String, Bytes)>,
    ) -> Result<(), StoreError> {
        self.with_txn(|txn| {
            for (field, value) in entries {
                txn.hash_set(key, &field, value);
            }
        })
        .await
    }

    /// Read a hash field.
    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError> {
        self.with_txn(|txn| txn.hash_get(key, field)).await
    }

    /// Read all fields of a hash.
    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>, StoreError> {
        self.with_txn(|txn| txn.hash_get_all(key)).await
    }

    /// Delete hash fields; returns the number of fields removed.
    pub async fn hash_del(&self, key: &str, fields: &[&str]) -> Result<usize, StoreError> {
        self.with_txn(|txn| txn.hash_del(key, fields)).await
    }

    /// Increment a numeric hash field.
    pub async fn hash_incr_by(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        self.with_txn(|txn| txn.hash_incr_by(key, field, delta))
            .await
    }

    /// Add a member to a set; returns whether the member was new.
    pub async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_txn(|txn| txn.set_add(key, member)).await
    }

    /// Remove a member from a set; returns whether it was present.
    pub async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_txn(|txn| txn.set_remove(key, member)).await
    }

    /// List the members of a set in lexicographic order.
    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_txn(|txn| txn.set_members(key)).await
    }

    /// Push an entry to the front of a list and trim it to `max_len`.
    pub async fn list_push_capped(
        &self,
        key: &str,
        value: Bytes,
        max_len: usize,
    ) -> Result<(), StoreError> {
        self.with_txn(|txn| txn.list_push_capped(key, value, max_len))
            .await
    }

    /// Read a whole list, front first.
    pub async fn list_range(&self, key: &str) -> Result<Vec<Bytes>, StoreError> {
        self.with_txn(|txn| txn.list_range(key)).await
    }

    /// Increment a monotonic counter and return the new value.
    pub async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        self.with_txn(|txn| txn.incr(key)).await
    }

    /// Delete a key of any kind; returns whether anything was removed.
    pub async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        self.with_txn(|txn| txn.delete_key(key)).await
    }

    /// Set an absolute expiry (unix milliseconds) on a key.
    pub async fn expire_at(&self, key: &str, at_ms: i64) -> Result<(), StoreError> {
        self.with_txn(|txn| txn.expire_at(key, at_ms)).await
    }

    /// List every live key with its kind, for diagnostics.
    pub async fn scan_keys(&self) -> Result<Vec<(String, &'static str)>, StoreError> {
        self.with_txn(|txn| txn.scan_keys()).await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("prefix", &self.shared.prefix)
            .field("snapshot_path", &self.shared.snapshot_path)
            .finish_non_exhaustive()
    }
}
