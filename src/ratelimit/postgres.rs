//! PostgreSQL counter store.
//!
//! Counters live in an UNLOGGED table. UNLOGGED tables skip the write-ahead
//! log, so writes are much cheaper and the table is truncated after a crash.
//! Losing rate limit state on crash only resets counts to zero.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use super::store::CounterStore;
use crate::config::DatabaseConfig;
use crate::error::{Result, StoreError, StoreResult, TallyError};

/// Default table holding the counters.
pub const DEFAULT_TABLE: &str = "rate_limits";

/// Counter store backed by a PostgreSQL table.
///
/// Statements are rendered once at construction; sqlx prepares and caches
/// them per connection on first use.
#[derive(Debug, Clone)]
pub struct PgCounterStore {
    pool: PgPool,
    table: String,
    create_table_sql: String,
    create_index_sql: String,
    increment_sql: String,
    delete_sql: String,
}

impl PgCounterStore {
    /// Create a store using the default `rate_limits` table.
    pub fn new(pool: PgPool) -> Self {
        Self::build(pool, DEFAULT_TABLE.to_string())
    }

    /// Create a store using a custom table name.
    ///
    /// The name must be a plain SQL identifier since it is spliced into
    /// statements.
    pub fn with_table(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self::build(pool, table.to_string()))
    }

    /// Open a connection pool from configuration and wrap it.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            max_connections = config.max_connections,
            table = %config.table,
            "Creating database connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| TallyError::Connect(StoreError::Database(e)))?;

        Self::with_table(pool, &config.table)
    }

    fn build(pool: PgPool, table: String) -> Self {
        let create_table_sql = format!(
            r#"
            CREATE UNLOGGED TABLE IF NOT EXISTS {table} (
                key           TEXT NOT NULL,
                window_start  BIGINT NOT NULL,
                count         BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (key, window_start)
            )
            "#
        );
        let create_index_sql = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_cleanup ON {table} (window_start)"
        );
        let increment_sql = format!(
            r#"
            INSERT INTO {table} (key, window_start, count)
            VALUES ($1, $2, $3)
            ON CONFLICT (key, window_start)
            DO UPDATE SET count = {table}.count + EXCLUDED.count
            RETURNING
                count,
                COALESCE(
                    (SELECT prev.count FROM {table} prev
                     WHERE prev.key = $1 AND prev.window_start = $4),
                    0
                ) AS prev_count
            "#
        );
        let delete_sql = format!("DELETE FROM {table} WHERE window_start < $1");

        Self {
            pool,
            table,
            create_table_sql,
            create_index_sql,
            increment_sql,
            delete_sql,
        }
    }

    /// Get the table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(&self.create_table_sql)
            .execute(&self.pool)
            .await?;
        sqlx::query(&self.create_index_sql)
            .execute(&self.pool)
            .await?;

        debug!(table = %self.table, "Rate limit table ready");
        Ok(())
    }

    async fn increment_and_peek(
        &self,
        key: &str,
        window_start: i64,
        prev_window_start: i64,
        n: i64,
    ) -> StoreResult<(i64, i64)> {
        let row = sqlx::query_as::<_, (i64, i64)>(&self.increment_sql)
            .bind(key)
            .bind(window_start)
            .bind(n)
            .bind(prev_window_start)
            .fetch_one(&self.pool)
            .await?;

        Ok(row)
    }

    async fn delete_older_than(&self, cutoff: i64) -> StoreResult<u64> {
        let deleted = sqlx::query(&self.delete_sql)
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }
}

/// Check that a table name is a plain, unquoted PostgreSQL identifier.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    // Leave room for the "idx_" prefix and "_cleanup" suffix of the index name.
    if !valid_start || !valid_rest || table.len() > 50 {
        return Err(TallyError::Config(format!(
            "invalid table name {:?}: expected [A-Za-z_][A-Za-z0-9_]*, at most 50 characters",
            table
        )));
    }

    Ok(())
}
