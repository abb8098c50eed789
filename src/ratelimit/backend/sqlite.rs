//! Durable counter storage on SQLite.
//!
//! Events are stored one row per hit with an explicit expiry so cleanup can
//! run off an index. Every read-modify-write happens inside one transaction.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::{refill, take_token, Acquisition, BucketState, RateLimitBackend};
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rate_limit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        ts REAL NOT NULL,
        expires_at REAL NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_rate_limit_events_key_ts ON rate_limit_events (key, ts)",
    "CREATE INDEX IF NOT EXISTS idx_rate_limit_events_expires_at ON rate_limit_events (expires_at)",
    "CREATE TABLE IF NOT EXISTS rate_limit_buckets (
        key TEXT PRIMARY KEY,
        tokens REAL NOT NULL,
        last_refill REAL NOT NULL,
        capacity REAL NOT NULL,
        refill_rate REAL NOT NULL
    )",
];

/// Counter storage backed by a SQLite database.
pub struct SqliteBackend {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// `sqlite::memory:` URLs get a single long-lived connection so every
    /// query sees the same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().connect_with(options).await?
        };

        info!(url = %url, "Connected to SQLite rate limit store");
        Self::from_pool(pool).await
    }

    /// Fresh private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Use an existing pool; applies the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let backend = Self {
            pool,
            clock: system_clock(),
        };
        backend.migrate().await?;
        Ok(backend)
    }

    /// Replace the clock used for timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Create tables and indexes if they don't exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    async fn get_usage(&self, key: &str, window_size: u64) -> Result<u64> {
        let cutoff = self.now() - window_size as f64;
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_events WHERE key = ?1 AND ts > ?2")
                .bind(key)
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn increment(&self, key: &str, window_size: u64, amount: u64) -> Result<u64> {
        let now = self.now();
        let cutoff = now - window_size as f64;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM rate_limit_events WHERE key = ?1 AND ts <= ?2")
            .bind(key)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        for _ in 0..amount {
            sqlx::query("INSERT INTO rate_limit_events (key, ts, expires_at) VALUES (?1, ?2, ?3)")
                .bind(key)
                .bind(now)
                .bind(now + window_size as f64)
                .execute(&mut *tx)
                .await?;
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_events WHERE key = ?1")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count as u64)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let events = sqlx::query("DELETE FROM rate_limit_events WHERE key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let buckets = sqlx::query("DELETE FROM rate_limit_buckets WHERE key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(events + buckets > 0)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = self.now();
        let events = sqlx::query("DELETE FROM rate_limit_events WHERE expires_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let buckets = sqlx::query(
            "DELETE FROM rate_limit_buckets
             WHERE tokens + (?1 - last_refill) * refill_rate >= capacity",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        debug!(events, buckets, "Cleaned up expired SQLite rate limit rows");
        Ok(events + buckets)
    }

    async fn try_acquire(
        &self,
        key: &str,
        window_size: u64,
        limit: u64,
        amount: u64,
    ) -> Result<Acquisition> {
        let now = self.now();
        let cutoff = now - window_size as f64;
        let mut tx = self.pool.begin().await?;

        // The purge takes the write lock before the count is read.
        sqlx::query("DELETE FROM rate_limit_events WHERE key = ?1 AND ts <= ?2")
            .bind(key)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_events WHERE key = ?1")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        let count = count as u64;

        if count + amount > limit {
            tx.commit().await?;
            return Ok(Acquisition {
                allowed: false,
                count,
            });
        }

        for _ in 0..amount {
            sqlx::query("INSERT INTO rate_limit_events (key, ts, expires_at) VALUES (?1, ?2, ?3)")
                .bind(key)
                .bind(now)
                .bind(now + window_size as f64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(Acquisition {
            allowed: true,
            count: count + amount,
        })
    }

    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
    ) -> Result<BucketState> {
        let now = self.now();
        let capacity = capacity as f64;
        let mut tx = self.pool.begin().await?;

        // Write before reading so the write lock is held for the whole
        // read-modify-write.
        sqlx::query(
            "INSERT INTO rate_limit_buckets (key, tokens, last_refill, capacity, refill_rate)
             VALUES (?1, ?2, ?3, ?2, ?4)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(capacity)
        .bind(now)
        .bind(refill_per_sec)
        .execute(&mut *tx)
        .await?;

        let (tokens, last_refill): (f64, f64) =
            sqlx::query_as("SELECT tokens, last_refill FROM rate_limit_buckets WHERE key = ?1")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

        let state = take_token(
            refill(tokens, last_refill, now, capacity, refill_per_sec),
            refill_per_sec,
        );

        sqlx::query(
            "UPDATE rate_limit_buckets
             SET tokens = ?2, last_refill = ?3, capacity = ?4, refill_rate = ?5
             WHERE key = ?1",
        )
        .bind(key)
        .bind(state.tokens)
        .bind(now)
        .bind(capacity)
        .bind(refill_per_sec)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(state)
    }

    async fn peek_tokens(&self, key: &str, capacity: u64, refill_per_sec: f64) -> Result<f64> {
        let now = self.now();
        let capacity = capacity as f64;
        let row: Option<(f64, f64)> =
            sqlx::query_as("SELECT tokens, last_refill FROM rate_limit_buckets WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map_or(capacity, |(tokens, last_refill)| {
            refill(tokens, last_refill, now, capacity, refill_per_sec)
        }))
    }
}
