//! Store data state and transactional access.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::Bytes;

/// The complete data state of a store.
///
/// Every collection lives in its own namespace keyed by the full key, the
/// way a single-node KV server keeps separate data types. Expiries apply
/// to whole keys regardless of kind and are purged lazily.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct State {
    /// Hashes: key -> field -> value.
    hashes: HashMap<String, HashMap<String, Bytes>>,

    /// Lists: key -> entries, front first.
    lists: HashMap<String, VecDeque<Bytes>>,

    /// Sets: key -> members.
    sets: HashMap<String, BTreeSet<String>>,

    /// Sorted sets: key -> member -> score.
    zsets: HashMap<String, BTreeMap<String, i64>>,

    /// Monotonic counters: key -> last issued value.
    counters: HashMap<String, u64>,

    /// Key expiries as unix milliseconds.
    expires: HashMap<String, i64>,
}

/// A transaction over the store state.
///
/// Holds the store lock for its whole lifetime; operations inside one
/// transaction are atomic with respect to all other store access.
pub struct Txn<'a> {
    /// The locked state.
    state: &'a mut State,

    /// Wall clock at transaction start, unix milliseconds.
    now_ms: i64,

    /// Key prefix applied to every key.
    prefix: &'a str,
}

impl<'a> Txn<'a> {
    /// Wrap locked state into a transaction.
    pub(crate) fn new(state: &'a mut State, now_ms: i64, prefix: &'a str) -> Self {
        Self {
            state,
            now_ms,
            prefix,
        }
    }

    /// Wall clock at transaction start, unix milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Apply the configured prefix to a key.
    fn k(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }

    /// Drop the key from every namespace if its expiry has passed.
    fn purge_expired(&mut self, full_key: &str) {
        let expired = matches!(self.state.expires.get(full_key), Some(at) if *at <= self.now_ms);
        if expired {
            self.remove_everywhere(full_key);
        }
    }

    /// Remove a key from every namespace.
    fn remove_everywhere(&mut self, full_key: &str) -> bool {
        let mut removed = false;
        removed |= self.state.hashes.remove(full_key).is_some();
        removed |= self.state.lists.remove(full_key).is_some();
        removed |= self.state.sets.remove(full_key).is_some();
        removed |= self.state.zsets.remove(full_key).is_some();
        removed |= self.state.counters.remove(full_key).is_some();
        self.state.expires.remove(full_key);
        removed
    }

    /// Set a hash field.
    pub fn hash_set(&mut self, key: &str, field: &str, value: impl Into<Bytes>) {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state
            .hashes
            .entry(key)
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// Read a hash field.
    pub fn hash_get(&mut self, key: &str, field: &str) -> Option<Bytes> {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state.hashes.get(&key)?.get(field).cloned()
    }

    /// Read all fields of a hash.
    pub fn hash_get_all(&mut self, key: &str) -> HashMap<String, Bytes> {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state.hashes.get(&key).cloned().unwrap_or_default()
    }

    /// Delete hash fields; returns the number of fields removed.
    pub fn hash_del(&mut self, key: &str, fields: &[&str]) -> usize {
        let key = self.k(key);
        self.purge_expired(&key);
        let Some(hash) = self.state.hashes.get_mut(&key) else {
            return 0;
        };
        let mut removed = 0;
        for field in fields {
            if hash.remove(*field).is_some() {
                removed += 1;
            }
        }
        if hash.is_empty() {
            self.state.hashes.remove(&key);
        }
        removed
    }

    /// Increment a numeric hash field stored as a decimal string.
    pub fn hash_incr_by(&mut self, key: &str, field: &str, delta: i64) -> i64 {
        let key = self.k(key);
        self.purge_expired(&key);
        let hash = self.state.hashes.entry(key).or_default();
        let current = hash
            .get(field)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string().into_bytes());
        next
    }

    /// Add a member to a set; returns whether the member was new.
    pub fn set_add(&mut self, key: &str, member: &str) -> bool {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state
            .sets
            .entry(key)
            .or_default()
            .insert(member.to_string())
    }

    /// Remove a member from a set; returns whether it was present.
    pub fn set_remove(&mut self, key: &str, member: &str) -> bool {
        let key = self.k(key);
        self.purge_expired(&key);
        let Some(set) = self.state.sets.get_mut(&key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.state.sets.remove(&key);
        }
        removed
    }

    /// Whether a set contains a member.
    pub fn set_contains(&mut self, key: &str, member: &str) -> bool {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state
            .sets
            .get(&key)
            .is_some_and(|set| set.contains(member))
    }

    /// List the members of a set in lexicographic order.
    pub fn set_members(&mut self, key: &str) -> Vec<String> {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state
            .sets
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push an entry to the front of a list and trim it to `max_len`.
    pub fn list_push_capped(&mut self, key: &str, value: Bytes, max_len: usize) {
        let key = self.k(key);
        self.purge_expired(&key);
        let list = self.state.lists.entry(key.clone()).or_default();
        list.push_front(value);
        list.truncate(max_len);
        if list.is_empty() {
            self.state.lists.remove(&key);
        }
    }

    /// Push an entry to the front of a list.
    pub fn list_push_front(&mut self, key: &str, value: Bytes) {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state.lists.entry(key).or_default().push_front(value);
    }

    /// Pop the oldest entry off the back of a list.
    pub fn list_pop_back(&mut self, key: &str) -> Option<Bytes> {
        let key = self.k(key);
        self.purge_expired(&key);
        let list = self.state.lists.get_mut(&key)?;
        let value = list.pop_back();
        if list.is_empty() {
            self.state.lists.remove(&key);
        }
        value
    }

    /// Number of entries in a list.
    pub fn list_len(&mut self, key: &str) -> usize {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state.lists.get(&key).map(VecDeque::len).unwrap_or(0)
    }

    /// Read a whole list, front first.
    pub fn list_range(&mut self, key: &str) -> Vec<Bytes> {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state
            .lists
            .get(&key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Add or update a sorted-set member with the given score.
    pub fn zset_add(&mut self, key: &str, member: &str, score: i64) {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state
            .zsets
            .entry(key)
            .or_default()
            .insert(member.to_string(), score);
    }

    /// Remove a sorted-set member; returns whether it was present.
    pub fn zset_remove(&mut self, key: &str, member: &str) -> bool {
        let key = self.k(key);
        self.purge_expired(&key);
        let Some(zset) = self.state.zsets.get_mut(&key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.state.zsets.remove(&key);
        }
        removed
    }

    /// Pop the lowest-scored member whose score is at most `max_score`.
    ///
    /// Ties break on lexicographic member order.
    pub fn zset_pop_min_at_most(&mut self, key: &str, max_score: i64) -> Option<(String, i64)> {
        let key = self.k(key);
        self.purge_expired(&key);
        let zset = self.state.zsets.get_mut(&key)?;
        let best = zset
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .min_by(|(m_a, s_a), (m_b, s_b)| s_a.cmp(s_b).then_with(|| m_a.cmp(m_b)))
            .map(|(member, score)| (member.clone(), *score))?;
        zset.remove(&best.0);
        if zset.is_empty() {
            self.state.zsets.remove(&key);
        }
        Some(best)
    }

    /// List members whose score is at most `max_score`, lowest first.
    pub fn zset_range_at_most(&mut self, key: &str, max_score: i64) -> Vec<(String, i64)> {
        let key = self.k(key);
        self.purge_expired(&key);
        let Some(zset) = self.state.zsets.get(&key) else {
            return Vec::new();
        };
        let mut entries: Vec<_> = zset
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        entries.sort_by(|(m_a, s_a), (m_b, s_b)| s_a.cmp(s_b).then_with(|| m_a.cmp(m_b)));
        entries
    }

    /// Number of members in a sorted set.
    pub fn zset_len(&mut self, key: &str) -> usize {
        let key = self.k(key);
        self.purge_expired(&key);
        self.state.zsets.get(&key).map(BTreeMap::len).unwrap_or(0)
    }

    /// All members of a sorted set with scores, lowest first.
    pub fn zset_entries(&mut self, key: &str) -> Vec<(String, i64)> {
        self.zset_range_at_most(key, i64::MAX)
    }

    /// Increment a monotonic counter and return the new value.
    pub fn incr(&mut self, key: &str) -> u64 {
        let key = self.k(key);
        let counter = self.state.counters.entry(key).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Delete a key of any kind; returns whether anything was removed.
    pub fn delete_key(&mut self, key: &str) -> bool {
        let key = self.k(key);
        self.remove_everywhere(&key)
    }

    /// Set an absolute expiry (unix milliseconds) on a key.
    pub fn expire_at(&mut self, key: &str, at_ms: i64) {
        let key = self.k(key);
        self.state.expires.insert(key, at_ms);
    }

    /// List every live key with its kind, for diagnostics.
    pub fn scan_keys(&mut self) -> Vec<(String, &'static str)> {
        let expired: Vec<String> = self
            .state
            .expires
            .iter()
            .filter(|(_, at)| **at <= self.now_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove_everywhere(&key);
        }

        let mut keys = Vec::new();
        keys.extend(self.state.hashes.keys().map(|k| (k.clone(), "hash")));
        keys.extend(self.state.lists.keys().map(|k| (k.clone(), "list")));
        keys.extend(self.state.sets.keys().map(|k| (k.clone(), "set")));
        keys.extend(self.state.zsets.keys().map(|k| (k.clone(), "zset")));
        keys.extend(self.state.counters.keys().map(|k| (k.clone(), "counter")));
        keys.sort();
        keys
    }
}
