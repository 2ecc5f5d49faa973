//! Rate limiting logic and state management.

mod cache;
mod cleaner;
mod limiter;
mod postgres;
mod store;
mod window;

#[cfg(test)]
mod testing;

pub use cache::BlockCache;
pub use cleaner::CleanupState;
pub use limiter::{Limiter, LimiterOptions, Rate, RateResult, DEFAULT_CLEANUP_INTERVAL};
pub use postgres::{validate_table_name, PgCounterStore, DEFAULT_TABLE};
pub use store::{CounterStore, MemoryCounterStore};
pub use window::{window_millis, WindowBounds};
