//! Counter store trait and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StoreResult;

/// Storage for per-window counters.
///
/// Rows are identified by `(key, window_start)`, where `window_start` is an
/// epoch millisecond aligned to a window boundary. Implementations must make
/// `increment_and_peek` atomic on their own: the limiter takes no locks
/// around it, and several limiter processes may share one store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Create the backing structure if it does not exist yet.
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// Add `n` to the row for `(key, window_start)` and read the row for
    /// `(key, prev_window_start)` in the same atomic unit.
    ///
    /// Returns `(current_count, prev_count)`; a missing previous row
    /// counts as 0.
    async fn increment_and_peek(
        &self,
        key: &str,
        window_start: i64,
        prev_window_start: i64,
        n: i64,
    ) -> StoreResult<(i64, i64)>;

    /// Delete every row with `window_start < cutoff`.
    ///
    /// Returns the number of rows removed.
    async fn delete_older_than(&self, cutoff: i64) -> StoreResult<u64>;
}

/// Process-local counter store.
///
/// A single mutex makes the increment and the peek one atomic step. Counts
/// live only as long as the process, which is acceptable for rate limiting.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    rows: Mutex<HashMap<(String, i64), i64>>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the count for a row without modifying it.
    pub fn count(&self, key: &str, window_start: i64) -> Option<i64> {
        self.rows.lock().get(&(key.to_string(), window_start)).copied()
    }

    /// Get the number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Check if the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn increment_and_peek(
        &self,
        key: &str,
        window_start: i64,
        prev_window_start: i64,
        n: i64,
    ) -> StoreResult<(i64, i64)> {
        let mut rows = self.rows.lock();

        let prev = rows
            .get(&(key.to_string(), prev_window_start))
            .copied()
            .unwrap_or(0);

        let current = rows.entry((key.to_string(), window_start)).or_insert(0);
        *current = current.saturating_add(n);

        Ok((*current, prev))
    }

    async fn delete_older_than(&self, cutoff: i64) -> StoreResult<u64> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|(_, window_start), _| *window_start >= cutoff);
        let deleted = (before - rows.len()) as u64;

        debug!(cutoff = cutoff, deleted = deleted, "Deleted in-memory rate limit rows");
        Ok(deleted)
    }
}
