//! Core rate limiter implementation.
//!
//! The limiter uses the sliding window counter algorithm: it counts hits in
//! fixed windows and interpolates between the current and the previous
//! window based on how far into the current window "now" is. This avoids
//! the burst a plain fixed window allows at its boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{display, Empty};
use tracing::{debug, instrument, trace, warn, Span};

use super::cache::BlockCache;
use super::cleaner::CleanerSlot;
use super::store::CounterStore;
use super::window::{window_millis, WindowBounds};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TallyError};
use crate::metrics::{LimiterMetrics, MetricsRegistry};

/// Default interval between background cleanup passes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A rate limit policy: at most `limit` hits per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    /// Maximum number of hits allowed within the window
    pub limit: u64,
    /// Length of the window
    pub window: Duration,
}

impl Rate {
    /// Create a new rate.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// `limit` hits per second.
    pub fn per_second(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    /// `limit` hits per minute.
    pub fn per_minute(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// `limit` hits per hour.
    pub fn per_hour(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateResult {
    /// Whether the hits may proceed
    pub allowed: bool,
    /// The limit that was applied
    pub limit: u64,
    /// Hits left in the current window
    pub remaining: u64,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
}

impl RateResult {
    /// Time until the window resets, zero if it already has.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Conventional rate limit response headers.
    ///
    /// `Retry-After` is only present for denied results and is rounded up
    /// to whole seconds.
    pub fn headers(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];

        if !self.allowed {
            let wait = self.retry_after(now);
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            headers.push(("Retry-After", secs.to_string()));
        }

        headers
    }
}

/// Construction options for a [`Limiter`].
#[derive(Clone)]
pub struct LimiterOptions {
    /// Interval between background cleanup passes
    pub cleanup_interval: Duration,
    registry: Option<Arc<MetricsRegistry>>,
    clock: Arc<dyn Clock>,
    cache: Option<Arc<BlockCache>>,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            registry: None,
            clock: Arc::new(SystemClock::new()),
            cache: None,
        }
    }
}

impl std::fmt::Debug for LimiterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterOptions")
            .field("cleanup_interval", &self.cleanup_interval)
            .field("registry", &self.registry.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl LimiterOptions {
    /// Set the interval between background cleanup passes.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Register the limiter metrics in `registry`.
    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a shared block cache instead of a private one.
    pub fn with_cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// A sliding window rate limiter over a shared counter store.
///
/// Cloning is cheap and every clone shares the same cache, metrics and
/// cleanup loop.
#[derive(Clone)]
pub struct Limiter {
    pub(super) inner: Arc<LimiterInner>,
}

pub(super) struct LimiterInner {
    pub(super) store: Arc<dyn CounterStore>,
    pub(super) cache: Arc<BlockCache>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) metrics: LimiterMetrics,
    pub(super) cleanup_interval: Duration,
    pub(super) cleaner: Mutex<CleanerSlot>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("cleanup_interval", &self.inner.cleanup_interval)
            .field("blocked_keys", &self.inner.cache.len())
            .field("cleanup_state", &self.cleanup_state())
            .finish()
    }
}

impl Limiter {
    /// Create a limiter with default options.
    ///
    /// Creates the backing table if it does not exist.
    pub async fn new(store: Arc<dyn CounterStore>) -> Result<Self> {
        Self::with_options(store, LimiterOptions::default()).await
    }

    /// Create a limiter with the given options.
    ///
    /// Creates the backing table if it does not exist; failing to do so
    /// fails construction.
    pub async fn with_options(store: Arc<dyn CounterStore>, options: LimiterOptions) -> Result<Self> {
        if options.cleanup_interval.is_zero() {
            return Err(TallyError::Config(
                "cleanup interval must be greater than 0".to_string(),
            ));
        }

        let metrics = match &options.registry {
            Some(registry) => LimiterMetrics::register(registry).unwrap_or_else(|e| {
                warn!(error = %e, "Cannot register rate limit metrics, using detached instruments");
                LimiterMetrics::detached()
            }),
            None => LimiterMetrics::detached(),
        };

        store.ensure_schema().await.map_err(TallyError::Schema)?;

        debug!(
            cleanup_interval = ?options.cleanup_interval,
            "Rate limiter initialized"
        );

        Ok(Self {
            inner: Arc::new(LimiterInner {
                store,
                cache: options.cache.unwrap_or_default(),
                clock: options.clock,
                metrics,
                cleanup_interval: options.cleanup_interval,
                cleaner: Mutex::new(CleanerSlot::NotStarted),
            }),
        })
    }

    /// Check whether a single hit is allowed for `key`.
    pub async fn allow(&self, key: &str, rate: Rate) -> Result<RateResult> {
        self.allow_n(key, rate, 1).await
    }

    /// Check whether `n` hits are allowed for `key`, counting them.
    ///
    /// Hits are added to the stored count before the decision is made, so
    /// denied hits count toward the window too. Dropping the returned
    /// future abandons the store call.
    #[instrument(
        name = "ratelimit.allow_n",
        skip_all,
        fields(
            key = %key,
            limit = rate.limit,
            window_ms = rate.window.as_millis() as u64,
            n = n,
            allowed = Empty,
            cache_hit = Empty,
            current_count = Empty,
            prev_count = Empty,
            effective_count = Empty,
            remaining = Empty,
            error = Empty,
        )
    )]
    pub async fn allow_n(&self, key: &str, rate: Rate, n: u64) -> Result<RateResult> {
        let started = Instant::now();
        let (limit, window_ms, hits) = validate(&rate, n)?;
        let span = Span::current();

        let now = self.inner.clock.now();
        let bounds = WindowBounds::for_instant(now, window_ms);

        // Fast path: keys known to be blocked never reach the store.
        let cache_key = BlockCache::cache_key(key, window_ms);
        if let Some(unblock_at) = self.inner.cache.get(&cache_key) {
            if now < unblock_at {
                self.inner.metrics.record_cache_hit();
                span.record("allowed", false);
                span.record("cache_hit", true);
                trace!(key = %key, unblock_at = %unblock_at, "Blocked key served from cache");

                self.inner.metrics.record_check(false, started.elapsed());
                return Ok(RateResult {
                    allowed: false,
                    limit: rate.limit,
                    remaining: 0,
                    reset_at: unblock_at,
                });
            }
            self.inner.cache.delete(&cache_key);
        }

        let (current, prev) = match self
            .inner
            .store
            .increment_and_peek(key, bounds.start_ms, bounds.prev_start_ms, hits)
            .await
        {
            Ok(counts) => counts,
            Err(e) => {
                span.record("error", display(&e));
                return Err(TallyError::Check(e));
            }
        };

        let effective = bounds.effective_count(current, prev);
        let allowed = effective <= limit;
        let remaining = limit.saturating_sub(effective).max(0) as u64;
        let reset_at = bounds.reset_at();

        if !allowed {
            self.inner.cache.set(cache_key, reset_at);
            debug!(
                key = %key,
                effective_count = effective,
                limit = limit,
                "Rate limit exceeded"
            );
        }

        span.record("allowed", allowed);
        span.record("cache_hit", false);
        span.record("current_count", current);
        span.record("prev_count", prev);
        span.record("effective_count", effective);
        span.record("remaining", remaining);

        self.inner.metrics.record_check(allowed, started.elapsed());

        Ok(RateResult {
            allowed,
            limit: rate.limit,
            remaining,
            reset_at,
        })
    }

    /// Get the interval between background cleanup passes.
    pub fn cleanup_interval(&self) -> Duration {
        self.inner.cleanup_interval
    }

    /// Get the block cache.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.inner.cache
    }

    /// Get the metric instruments.
    pub fn metrics(&self) -> &LimiterMetrics {
        &self.inner.metrics
    }

    /// Get the counter store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.inner.store
    }

    /// Get the current time as seen by the limiter.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }
}

/// Check a rate and hit count, returning `(limit, window_ms, n)` in store
/// units.
fn validate(rate: &Rate, n: u64) -> Result<(i64, i64, i64)> {
    let limit = i64::try_from(rate.limit)
        .ok()
        .filter(|limit| *limit >= 1)
        .ok_or_else(|| TallyError::InvalidRate(format!("limit must be at least 1, got {}", rate.limit)))?;

    let window_ms = window_millis(rate.window).ok_or_else(|| {
        TallyError::InvalidRate(format!(
            "window must be at least 1ms, got {:?}",
            rate.window
        ))
    })?;

    let hits = i64::try_from(n)
        .ok()
        .filter(|hits| *hits >= 1)
        .ok_or_else(|| TallyError::InvalidRate(format!("n must be at least 1, got {}", n)))?;

    Ok((limit, window_ms, hits))
}
