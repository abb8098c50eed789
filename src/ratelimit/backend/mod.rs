//! Counter storage for rate limiting.
//!
//! A backend owns all counter state. Limiters and the manager only refer to
//! state by key. Every implementation must make `increment`, `try_acquire`
//! and `consume_token` atomic per key: that atomicity is what keeps
//! concurrent callers from exceeding a limit.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;
mod sqlite;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryBackend;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisBackend;
pub use sqlite::SqliteBackend;

/// Outcome of a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// Whether the events were recorded
    pub allowed: bool,
    /// Events in the window after the call
    pub count: u64,
}

/// Token bucket state after a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Whether a token was taken
    pub allowed: bool,
    /// Tokens left in the bucket
    pub tokens: f64,
}

/// Trait for rate limit counter storage.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Current time according to this backend's clock (unix seconds).
    fn now(&self) -> f64;

    /// Count events for `key` within the trailing `window_size` seconds.
    async fn get_usage(&self, key: &str, window_size: u64) -> Result<u64>;

    /// Record `amount` events at the current time and return the new count.
    ///
    /// Entries older than `window_size` are purged in the same operation.
    async fn increment(&self, key: &str, window_size: u64, amount: u64) -> Result<u64>;

    /// Drop all state held for `key`. Returns whether anything was removed.
    async fn reset(&self, key: &str) -> Result<bool>;

    /// Remove stale keys. Returns how many entries were removed.
    async fn cleanup_expired(&self) -> Result<u64>;

    /// Record `amount` events only if the window stays within `limit`.
    ///
    /// The default implementation is a read followed by a write and is not
    /// atomic; backends override it with a single indivisible operation.
    async fn try_acquire(
        &self,
        key: &str,
        window_size: u64,
        limit: u64,
        amount: u64,
    ) -> Result<Acquisition> {
        let count = self.get_usage(key, window_size).await?;
        if count + amount > limit {
            return Ok(Acquisition {
                allowed: false,
                count,
            });
        }
        let count = self.increment(key, window_size, amount).await?;
        Ok(Acquisition {
            allowed: true,
            count,
        })
    }

    /// Refill the token bucket for `key` and try to take one token.
    ///
    /// A bucket seen for the first time starts full.
    async fn consume_token(&self, key: &str, capacity: u64, refill_per_sec: f64)
        -> Result<BucketState>;

    /// Tokens currently in the bucket for `key`, refilled to now, without
    /// taking any. A missing bucket reads as full.
    async fn peek_tokens(&self, key: &str, capacity: u64, refill_per_sec: f64) -> Result<f64>;
}

/// Tokens in a bucket after refilling from `last_refill` to `now`.
pub(crate) fn refill(tokens: f64, last_refill: f64, now: f64, capacity: f64, rate: f64) -> f64 {
    let elapsed = (now - last_refill).max(0.0);
    (tokens + elapsed * rate).min(capacity)
}

/// Unix timestamps held in `f64` are only exact to a fraction of a
/// microsecond, so a refill can come up short by that much time.
pub(crate) const CLOCK_SLACK_SECS: f64 = 1e-6;
const MIN_TOKEN_SLACK: f64 = 1e-9;

/// How far below one token a bucket may be and still yield a token.
pub(crate) fn token_slack(refill_per_sec: f64) -> f64 {
    (refill_per_sec * CLOCK_SLACK_SECS).max(MIN_TOKEN_SLACK)
}

/// Take one token if available.
pub(crate) fn take_token(tokens: f64, refill_per_sec: f64) -> BucketState {
    if tokens >= 1.0 - token_slack(refill_per_sec) {
        BucketState {
            allowed: true,
            tokens: (tokens - 1.0).max(0.0),
        }
    } else {
        BucketState {
            allowed: false,
            tokens,
        }
    }
}
