//! Removal of expired counter rows.
//!
//! Counter rows are never updated once their window has passed, so they can
//! be dropped in bulk by age. The background loop keeps two cleanup
//! intervals of history, which leaves the previous window available for
//! interpolation right after a pass.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::field::{display, Empty};
use tracing::{debug, error, info, instrument, Span};

use super::limiter::Limiter;
use crate::error::{Result, TallyError};

/// Lifecycle of the background cleanup loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupState {
    /// `start_cleanup` has not been called
    NotStarted,
    /// The loop is running
    Running,
    /// The loop exited after its shutdown signal fired
    Stopped,
}

/// The cleanup task, once spawned.
pub(super) enum CleanerSlot {
    NotStarted,
    Started {
        handle: JoinHandle<()>,
        done: watch::Receiver<bool>,
    },
}

impl Limiter {
    /// Delete counter rows whose window started more than `older_than` ago.
    ///
    /// Returns the number of rows removed.
    #[instrument(
        name = "ratelimit.cleanup",
        skip_all,
        fields(
            older_than_ms = older_than.as_millis() as u64,
            rows_deleted = Empty,
            error = Empty,
        )
    )]
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64> {
        let span = Span::current();

        let older_than_ms = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self
            .inner
            .clock
            .now()
            .timestamp_millis()
            .saturating_sub(older_than_ms);

        let rows_deleted = match self.inner.store.delete_older_than(cutoff).await {
            Ok(rows) => rows,
            Err(e) => {
                span.record("error", display(&e));
                return Err(TallyError::Cleanup(e));
            }
        };

        span.record("rows_deleted", rows_deleted);
        info!(
            rows_deleted = rows_deleted,
            older_than = ?older_than,
            "Rate limit cleanup completed"
        );

        Ok(rows_deleted)
    }

    /// Start the background cleanup loop.
    ///
    /// Only the first call starts a loop; later calls do nothing, even after
    /// that loop has stopped. The loop runs a pass every cleanup interval
    /// and exits when `shutdown` resolves. Must be called from within a
    /// Tokio runtime.
    pub fn start_cleanup<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.inner.cleaner.lock();
        if let CleanerSlot::Started { .. } = *slot {
            debug!("Rate limit cleanup loop already started");
            return;
        }

        let (done_tx, done_rx) = watch::channel(false);
        let limiter = self.clone();
        let handle = tokio::spawn(async move {
            limiter.run_cleanup_loop(shutdown).await;
            let _ = done_tx.send(true);
        });

        *slot = CleanerSlot::Started {
            handle,
            done: done_rx,
        };
    }

    /// Get the state of the background cleanup loop.
    pub fn cleanup_state(&self) -> CleanupState {
        match &*self.inner.cleaner.lock() {
            CleanerSlot::NotStarted => CleanupState::NotStarted,
            CleanerSlot::Started { handle, done } => {
                if *done.borrow() || handle.is_finished() {
                    CleanupState::Stopped
                } else {
                    CleanupState::Running
                }
            }
        }
    }

    /// Wait until the background cleanup loop has exited.
    ///
    /// Returns immediately if it was never started.
    pub async fn wait_cleanup_stopped(&self) {
        let done = match &*self.inner.cleaner.lock() {
            CleanerSlot::NotStarted => return,
            CleanerSlot::Started { done, .. } => done.clone(),
        };

        let mut done = done;
        // A dropped sender means the task is gone as well.
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    async fn run_cleanup_loop<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.inner.cleanup_interval;
        info!(interval = ?period, "Starting rate limit cleanup loop");

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping rate limit cleanup loop");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup(period.saturating_mul(2)).await {
                        error!(error = %e, "Rate limit cleanup failed");
                    }

                    let purged = self.inner.cache.purge_expired(self.inner.clock.now());
                    if purged > 0 {
                        debug!(purged = purged, "Purged expired blocked keys");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::limiter::{LimiterOptions, Rate};
    use crate::ratelimit::store::MemoryCounterStore;
    use crate::ratelimit::testing::{CountingStore, FailingStore};
    use chrono::DateTime;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    const T0: i64 = 1_700_000_000_000;
    const MINUTE: Duration = Duration::from_secs(60);

    fn shutdown_pair() -> (oneshot::Sender<()>, impl Future<Output = ()> + Send + 'static) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
        })
    }

    async fn seeded_limiter(
        store: Arc<dyn crate::ratelimit::CounterStore>,
        clock: Arc<ManualClock>,
        interval: Duration,
    ) -> Limiter {
        Limiter::with_options(
            store,
            LimiterOptions::default()
                .with_clock(clock)
                .with_cleanup_interval(interval),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_cleanup_zero_deletes_every_row() {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let limiter = seeded_limiter(store.clone(), clock.clone(), MINUTE).await;

        let rate = Rate::per_second(100);
        for key in ["a", "b", "c"] {
            limiter.allow(key, rate).await.unwrap();
        }
        clock.advance(Duration::from_millis(1_500));
        limiter.allow("a", rate).await.unwrap();
        assert_eq!(store.len(), 4);

        clock.advance(Duration::from_millis(1));
        let deleted = limiter.cleanup(Duration::ZERO).await.unwrap();

        assert_eq!(deleted, 4);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_rows() {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let limiter = seeded_limiter(store.clone(), clock.clone(), MINUTE).await;

        let rate = Rate::per_second(100);
        for _ in 0..5 {
            limiter.allow("k", rate).await.unwrap();
            clock.advance(Duration::from_secs(10));
        }

        // Now T0 + 50s; rows at T0, +10s ... +40s; cutoff T0 + 25s.
        let deleted = limiter.cleanup(Duration::from_secs(25)).await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(store.count("k", T0 + 30_000), Some(1));
        assert_eq!(store.count("k", T0 + 40_000), Some(1));
    }

    #[tokio::test]
    async fn test_cleanup_error_is_wrapped() {
        let store = Arc::new(FailingStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let limiter = seeded_limiter(store.clone(), clock, MINUTE).await;
        store.fail_deletes(true);

        let err = limiter.cleanup(MINUTE).await.unwrap_err();
        assert!(matches!(err, TallyError::Cleanup(_)));
        assert!(err.to_string().starts_with("cannot cleanup rate limits"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_deletes_rows_older_than_two_intervals() {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0 - 300_000));
        let limiter = seeded_limiter(store.clone(), clock.clone(), MINUTE).await;

        let rate = Rate::per_second(100);
        for _ in 0..4 {
            limiter.allow("k", rate).await.unwrap();
            clock.advance(Duration::from_secs(100));
        }
        // Rows at T0-300s, -200s, -100s, T0; the clock now reads T0+100s.
        clock.set(DateTime::from_timestamp_millis(T0).unwrap());

        let (tx, shutdown) = shutdown_pair();
        limiter.start_cleanup(shutdown);
        assert_eq!(limiter.cleanup_state(), CleanupState::Running);

        // Nothing happens before the first full interval.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.len(), 4);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.len(), 2);
        assert!(store.count("k", T0 - 100_000).is_some());
        assert!(store.count("k", T0).is_some());

        tx.send(()).unwrap();
        limiter.wait_cleanup_stopped().await;
        assert_eq!(limiter.cleanup_state(), CleanupState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_cleanup_is_idempotent() {
        let store = Arc::new(CountingStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let limiter = seeded_limiter(store.clone(), clock, MINUTE).await;
        assert_eq!(limiter.cleanup_state(), CleanupState::NotStarted);

        let (first_tx, first) = shutdown_pair();
        let (_second_tx, second) = shutdown_pair();
        limiter.start_cleanup(first);
        limiter.clone().start_cleanup(second);

        tokio::time::sleep(Duration::from_secs(150)).await;
        // One loop, two ticks.
        assert_eq!(store.deletes(), 2);

        first_tx.send(()).unwrap();
        limiter.wait_cleanup_stopped().await;
        assert_eq!(limiter.cleanup_state(), CleanupState::Stopped);

        // A stopped loop is not restarted.
        let (_third_tx, third) = shutdown_pair();
        limiter.start_cleanup(third);
        assert_eq!(limiter.cleanup_state(), CleanupState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_does_not_stop_loop() {
        let store = Arc::new(FailingStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let limiter = seeded_limiter(store.clone(), clock, MINUTE).await;
        store.fail_deletes(true);

        let (tx, shutdown) = shutdown_pair();
        limiter.start_cleanup(shutdown);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.delete_calls(), 1);
        assert_eq!(limiter.cleanup_state(), CleanupState::Running);

        store.fail_deletes(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.delete_calls(), 2);

        tx.send(()).unwrap();
        limiter.wait_cleanup_stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_purges_expired_cache_entries() {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let limiter = seeded_limiter(store, clock.clone(), MINUTE).await;

        let rate = Rate::per_second(1);
        limiter.allow("k", rate).await.unwrap();
        limiter.allow("k", rate).await.unwrap();
        assert_eq!(limiter.cache().len(), 1);

        clock.advance(Duration::from_secs(5));
        let (tx, shutdown) = shutdown_pair();
        limiter.start_cleanup(shutdown);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(limiter.cache().is_empty());

        tx.send(()).unwrap();
        limiter.wait_cleanup_stopped().await;
    }

    #[tokio::test]
    async fn test_wait_returns_when_never_started() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = Limiter::new(store).await.unwrap();

        limiter.wait_cleanup_stopped().await;
        assert_eq!(limiter.cleanup_state(), CleanupState::NotStarted);
    }
}
