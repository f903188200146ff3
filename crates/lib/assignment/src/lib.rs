//! Account-to-worker assignment state.
//!
//! Each account is owned by at most one worker at any instant. Owners are
//! chosen by rendezvous (highest-random-weight) hashing over the live
//! worker set, so a worker joining or leaving only moves the accounts
//! whose top-ranked worker changed. Reconnect storms are damped with a
//! growing per-account cooling delay.
//!
//! This crate is pure state: the supervisor owns an instance, feeds it
//! membership changes and drains planned assignments to issue the RPCs.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use sha2::{Digest as _, Sha256};


/// Maximum retained disconnect timestamps per account.
const RECONNECT_HISTORY_LEN: usize = 10;

/// Disconnect gap at or above which the damping delay resets, ms.
const RECONNECT_RESET_MS: i64 = 60_000;

/// Damping delay clamp, ms.
const RECONNECT_MAX_DELAY_MS: u64 = 60_000;

/// First non-zero damping delay, ms.
const RECONNECT_SEED_DELAY_MS: u64 = 1_000;

/// Where an account currently stands with the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentStatus {
    /// Waiting for a worker.
    Unassigned,

    /// Waiting out a reconnect-damping delay.
    Cooling {
        /// When the delay elapses, unix milliseconds.
        until: i64,
    },

    /// Owned by a worker.
    Owned {
        /// The owning worker.
        worker: String,
    },

    /// Not tracked at all.
    Unknown,
}

/// A planned account-to-worker assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAssignment {
    /// The account to assign.
    pub account: String,

    /// The worker chosen by rendezvous hashing.
    pub worker: String,
}

/// Per-account reconnect damping record.
#[derive(Debug, Default)]
struct ReconnectTracking {
    /// Recent disconnect timestamps, oldest first.
    disconnects: VecDeque<i64>,

    /// The delay applied after the most recent disconnect, ms.
    last_delay_ms: u64,

    /// Cooling deadline, unix milliseconds.
    cooling_until: Option<i64>,
}

/// Assignment controller state.
#[derive(Debug, Default)]
pub struct Assignments {
    /// Accounts waiting for a worker.
    unassigned: BTreeSet<String>,

    /// Account to owning worker.
    assigned: HashMap<String, String>,

    /// Worker to owned accounts.
    worker_assigned: BTreeMap<String, BTreeSet<String>>,

    /// Workers accepting assignments.
    available_workers: BTreeSet<String>,

    /// Reconnect damping per account.
    reconnect: HashMap<String, ReconnectTracking>,
}

impl Assignments {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new or re-registered account as waiting.
    pub fn add_account(&mut self, account: &str) {
        if !self.assigned.contains_key(account) {
            self.unassigned.insert(account.to_string());
        }
    }

    /// Drop an account from all tracking.
    ///
    /// Returns the worker that owned it, if any, so the caller can tell
    /// that worker to close the connection.
    pub fn remove_account(&mut self, account: &str) -> Option<String> {
        self.unassigned.remove(account);
        self.reconnect.remove(account);
        let worker = self.assigned.remove(account)?;
        if let Some(owned) = self.worker_assigned.get_mut(&worker) {
            owned.remove(account);
        }
        Some(worker)
    }

    /// Mark a worker as accepting assignments.
    pub fn worker_ready(&mut self, worker: &str) {
        self.available_workers.insert(worker.to_string());
        self.worker_assigned.entry(worker.to_string()).or_default();
    }

    /// Remove a worker, releasing every account it owned.
    ///
    /// Each released account goes back to the waiting set with a damping
    /// delay applied; the returned list lets the caller publish the
    /// `disconnected` state for them.
    pub fn worker_gone(&mut self, worker: &str, now_ms: i64) -> Vec<String> {
        self.available_workers.remove(worker);
        let owned = self.worker_assigned.remove(worker).unwrap_or_default();

        let mut released = Vec::new();
        for account in owned {
            self.assigned.remove(&account);
            self.unassigned.insert(account.clone());
            self.register_disconnect(&account, now_ms);
            released.push(account);
        }
        released
    }

    /// Release one account back to the waiting set with damping applied.
    ///
    /// Used when a connection drops while its worker stays alive. Returns
    /// the damping delay in milliseconds.
    pub fn release_account(&mut self, account: &str, now_ms: i64) -> u64 {
        if let Some(worker) = self.assigned.remove(account)
            && let Some(owned) = self.worker_assigned.get_mut(&worker)
        {
            owned.remove(account);
        }
        self.unassigned.insert(account.to_string());
        self.register_disconnect(account, now_ms)
    }

    /// Record a disconnect and compute the damping delay.
    ///
    /// A gap of at least a minute since the previous disconnect resets
    /// the delay to zero; tighter loops grow it by half each time, capped
    /// at a minute.
    fn register_disconnect(&mut self, account: &str, now_ms: i64) -> u64 {
        let tracking = self.reconnect.entry(account.to_string()).or_default();

        let prev_disconnect = tracking.disconnects.back().copied();
        tracking.disconnects.push_back(now_ms);
        while tracking.disconnects.len() > RECONNECT_HISTORY_LEN {
            tracking.disconnects.pop_front();
        }

        let delay_ms = match prev_disconnect {
            None => 0,
            Some(prev) if now_ms - prev >= RECONNECT_RESET_MS => 0,
            Some(_) => (tracking.last_delay_ms * 3)
                .div_ceil(2)
                .max(RECONNECT_SEED_DELAY_MS)
                .min(RECONNECT_MAX_DELAY_MS),
        };

        tracking.last_delay_ms = delay_ms;
        tracking.cooling_until = (delay_ms > 0).then(|| now_ms + delay_ms as i64);

        if delay_ms > 0 {
            tracing::debug!(account, delay_ms, "damping reconnect");
        }
        delay_ms
    }

    /// Plan assignments for every eligible waiting account.
    ///
    /// Accounts still cooling are skipped; with no available workers the
    /// plan is empty and every account stays waiting. Planned accounts
    /// move to their owner immediately, so the caller must issue the
    /// corresponding assign messages.
    pub fn plan(&mut self, now_ms: i64) -> Vec<PlannedAssignment> {
        if self.available_workers.is_empty() {
            return Vec::new();
        }

        let mut planned = Vec::new();
        let eligible: Vec<String> = self
            .unassigned
            .iter()
            .filter(|account| !self.is_cooling(account, now_ms))
            .cloned()
            .collect();

        for account in eligible {
            let Some(worker) = rendezvous_owner(self.available_workers.iter(), &account) else {
                break;
            };
            let worker = worker.to_string();

            self.unassigned.remove(&account);
            self.assigned.insert(account.clone(), worker.clone());
            self.worker_assigned
                .entry(worker.clone())
                .or_default()
                .insert(account.clone());

            planned.push(PlannedAssignment { account, worker });
        }
        planned
    }

    /// Whether an account is inside its damping delay.
    fn is_cooling(&self, account: &str, now_ms: i64) -> bool {
        self.reconnect
            .get(account)
            .and_then(|tracking| tracking.cooling_until)
            .is_some_and(|until| until > now_ms)
    }

    /// The earliest moment a cooling account becomes eligible again.
    pub fn next_wake(&self, now_ms: i64) -> Option<i64> {
        self.reconnect
            .values()
            .filter_map(|tracking| tracking.cooling_until)
            .filter(|until| *until > now_ms)
            .min()
    }

    /// Where an account currently stands.
    pub fn status(&self, account: &str, now_ms: i64) -> AssignmentStatus {
        if let Some(worker) = self.assigned.get(account) {
            return AssignmentStatus::Owned {
                worker: worker.clone(),
            };
        }
        if self.unassigned.contains(account) {
            if let Some(until) = self
                .reconnect
                .get(account)
                .and_then(|tracking| tracking.cooling_until)
                && until > now_ms
            {
                return AssignmentStatus::Cooling { until };
            }
            return AssignmentStatus::Unassigned;
        }
        AssignmentStatus::Unknown
    }

    /// The worker owning an account, if any.
    pub fn owner(&self, account: &str) -> Option<&str> {
        self.assigned.get(account).map(String::as_str)
    }

    /// Accounts owned by a worker.
    pub fn owned_by(&self, worker: &str) -> Vec<String> {
        self.worker_assigned
            .get(worker)
            .map(|owned| owned.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of accounts waiting for a worker.
    pub fn unassigned_len(&self) -> usize {
        self.unassigned.len()
    }
}

/// Rendezvous score of a worker for an account.
fn rendezvous_score(worker: &str, account: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(worker.as_bytes());
    hasher.update([0u8]);
    hasher.update(account.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Pick the rendezvous owner for an account among the given workers.
///
/// Highest score wins; equal scores break toward the lexicographically
/// smallest worker id for determinism.
pub fn rendezvous_owner<'a>(
    workers: impl IntoIterator<Item = &'a String>,
    account: &str,
) -> Option<&'a str> {
    let mut best: Option<(&'a str, u64)> = None;
    for worker in workers {
        let score = rendezvous_score(worker, account);
        best = match best {
            None => Some((worker, score)),
            Some((best_worker, best_score)) => {
                if score > best_score || (score == best_score && worker.as_str() < best_worker) {
                    Some((worker, score))
                } else {
                    Some((best_worker, best_score))
                }
            }
        };
    }
    best.map(|(worker, _)| worker)
}
