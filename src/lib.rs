//! Tally - Persistent Sliding Window Rate Limiter
//!
//! This crate decides whether the next N units of work for a key may
//! proceed, using the sliding window counter algorithm. Counters live in a
//! shared store (an UNLOGGED PostgreSQL table in production) so several
//! processes can enforce one limit, and keys already known to be over their
//! limit are answered from a local cache without touching the store.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally::ratelimit::{Limiter, PgCounterStore, Rate};
//!
//! # async fn run(pool: sqlx::PgPool) -> tally::error::Result<()> {
//! let limiter = Limiter::new(Arc::new(PgCounterStore::new(pool))).await?;
//! limiter.start_cleanup(async { let _ = tokio::signal::ctrl_c().await; });
//!
//! let result = limiter.allow("user:123", Rate::per_minute(100)).await?;
//! if !result.allowed {
//!     // reject until result.reset_at
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
