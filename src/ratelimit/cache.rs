//! Local cache of keys known to be over their limit.
//!
//! A denied key stays denied until its window resets, so remembering the
//! reset time lets later checks skip the store entirely. Entries are never
//! persisted and expire lazily: the limiter deletes a stale entry when it
//! reads one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Concurrent map from a blocked cache key to its unblock time.
#[derive(Debug, Default)]
pub struct BlockCache {
    entries: DashMap<String, DateTime<Utc>>,
}

impl BlockCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache key for a rate limit key and window.
    pub fn cache_key(key: &str, window_ms: i64) -> String {
        format!("{}:{}", key, window_ms)
    }

    /// Get the unblock time for a key, expired or not.
    pub fn get(&self, cache_key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(cache_key).map(|entry| *entry.value())
    }

    /// Record that a key is blocked until `unblock_at`. Last write wins.
    pub fn set(&self, cache_key: String, unblock_at: DateTime<Utc>) {
        self.entries.insert(cache_key, unblock_at);
    }

    /// Forget a key.
    pub fn delete(&self, cache_key: &str) {
        self.entries.remove(cache_key);
    }

    /// Drop every entry whose unblock time is at or before `now`.
    ///
    /// Returns how many entries were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, unblock_at| now < *unblock_at);
        before.saturating_sub(self.entries.len())
    }

    /// Get the number of cached keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
