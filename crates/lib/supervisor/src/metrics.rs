//! Metric counters persisted to the store.
//!
//! Counters land in daily hashes `stats:{counter}:{YYYYMMDD}` with a
//! minute-resolution subfield, expiring after the retention window.
//! Durations are recorded as count/sum/bucket counters in the same
//! scheme.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kv_store::Store;

/// Key of the set naming every live counter.
const KEYS_KEY: &str = "stats:keys";

/// Histogram bucket bounds in milliseconds.
const DURATION_BUCKETS_MS: &[u64] = &[50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

/// Metric recording handle.
///
/// Constructed once and passed into component constructors; nothing in
/// the engine reaches for a global metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Backing store.
    store: Store,

    /// Retention window in days.
    retention_days: u32,

    /// In-process totals since start.
    totals: Mutex<HashMap<String, i64>>,
}

impl Metrics {
    /// Build a metrics handle.
    pub fn new(store: Store, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
            totals: Mutex::new(HashMap::new()),
        }
    }

    /// Increment a counter.
    pub async fn increment(&self, counter: &str, delta: i64) {
        {
            let mut totals = self.totals.lock().unwrap_or_else(|err| err.into_inner());
            *totals.entry(counter.to_string()).or_insert(0) += delta;
        }

        let now = chrono::Utc::now();
        let key = format!("stats:{counter}:{}", now.format("%Y%m%d"));
        let field = now.format("%H%M").to_string();
        let expires_at =
            now.timestamp_millis() + i64::from(self.retention_days + 1) * 24 * 3600 * 1000;

        let result = self
            .store
            .with_txn(|txn| {
                txn.hash_incr_by(&key, &field, delta);
                txn.expire_at(&key, expires_at);
                txn.set_add(KEYS_KEY, counter);
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(counter, %err, "metric write failed");
        }
    }

    /// Record a request duration into the histogram counters.
    pub async fn observe_duration(&self, name: &str, duration: Duration) {
        let millis = duration.as_millis() as u64;
        self.increment(&format!("{name}_count"), 1).await;
        self.increment(&format!("{name}_sum_ms"), millis as i64).await;
        for bound in DURATION_BUCKETS_MS {
            if millis <= *bound {
                self.increment(&format!("{name}_le_{bound}"), 1).await;
                break;
            }
        }
    }

    /// In-process total of a counter since start.
    pub fn total(&self, counter: &str) -> i64 {
        let totals = self.totals.lock().unwrap_or_else(|err| err.into_inner());
        totals.get(counter).copied().unwrap_or(0)
    }
}
