//! Window boundary arithmetic for the sliding window counter.
//!
//! Windows are aligned to the Unix epoch in milliseconds, so any two
//! limiters that agree on the time agree on window identity without talking
//! to each other.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Convert a window duration to whole milliseconds.
///
/// Returns `None` for windows shorter than one millisecond or too large to
/// represent as epoch milliseconds.
pub fn window_millis(window: Duration) -> Option<i64> {
    let ms = i64::try_from(window.as_millis()).ok()?;
    (ms > 0).then_some(ms)
}

/// Boundaries of the window containing a reference instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    /// Start of the current window (epoch ms)
    pub start_ms: i64,
    /// Start of the previous window (epoch ms)
    pub prev_start_ms: i64,
    /// When the current window ends (epoch ms)
    pub reset_at_ms: i64,
    /// Time elapsed since `start_ms`
    pub elapsed_ms: i64,
    /// Window length
    pub window_ms: i64,
}

impl WindowBounds {
    /// Compute the boundaries for `now_ms` with a window of `window_ms`.
    ///
    /// `window_ms` must be positive; see [`window_millis`].
    pub fn at(now_ms: i64, window_ms: i64) -> Self {
        debug_assert!(window_ms > 0, "window must be positive");
        let window_ms = window_ms.max(1);

        let start_ms = now_ms.div_euclid(window_ms) * window_ms;

        Self {
            start_ms,
            prev_start_ms: start_ms.saturating_sub(window_ms),
            reset_at_ms: start_ms.saturating_add(window_ms),
            elapsed_ms: now_ms - start_ms,
            window_ms,
        }
    }

    /// Compute the boundaries for a wall-clock instant.
    pub fn for_instant(now: DateTime<Utc>, window_ms: i64) -> Self {
        Self::at(now.timestamp_millis(), window_ms)
    }

    /// Share of the previous window still inside the sliding window.
    ///
    /// 1.0 exactly at the window start, approaching 0.0 at its end.
    pub fn weight(&self) -> f64 {
        (self.window_ms - self.elapsed_ms) as f64 / self.window_ms as f64
    }

    /// Interpolated count used for the admission decision.
    pub fn effective_count(&self, current: i64, prev: i64) -> i64 {
        current.saturating_add((prev as f64 * self.weight()).floor() as i64)
    }

    /// The reset time as a timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.reset_at_ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
