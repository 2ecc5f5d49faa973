//! Store doubles for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::store::{CounterStore, MemoryCounterStore};
use crate::error::{StoreError, StoreResult};

/// A memory store that counts the calls made to it.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: MemoryCounterStore,
    increments: AtomicUsize,
    deletes: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryCounterStore {
        &self.inner
    }

    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for CountingStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        self.inner.ensure_schema().await
    }

    async fn increment_and_peek(
        &self,
        key: &str,
        window_start: i64,
        prev_window_start: i64,
        n: i64,
    ) -> StoreResult<(i64, i64)> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        self.inner
            .increment_and_peek(key, window_start, prev_window_start, n)
            .await
    }

    async fn delete_older_than(&self, cutoff: i64) -> StoreResult<u64> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_older_than(cutoff).await
    }
}

/// A memory store whose operations can be switched to fail.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: CountingStore,
    schema: AtomicBool,
    increments: AtomicBool,
    deletes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_schema(&self, fail: bool) {
        self.schema.store(fail, Ordering::SeqCst);
    }

    pub fn fail_increments(&self, fail: bool) {
        self.increments.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.deletes.store(fail, Ordering::SeqCst);
    }

    pub fn delete_calls(&self) -> usize {
        self.inner.deletes()
    }
}

#[async_trait]
impl CounterStore for FailingStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        if self.schema.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("schema creation refused".to_string()));
        }
        self.inner.ensure_schema().await
    }

    async fn increment_and_peek(
        &self,
        key: &str,
        window_start: i64,
        prev_window_start: i64,
        n: i64,
    ) -> StoreResult<(i64, i64)> {
        if self.increments.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner
            .increment_and_peek(key, window_start, prev_window_start, n)
            .await
    }

    async fn delete_older_than(&self, cutoff: i64) -> StoreResult<u64> {
        if self.deletes.load(Ordering::SeqCst) {
            // Still counted so tests can see the attempt.
            self.inner.deletes.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.delete_older_than(cutoff).await
    }
}
