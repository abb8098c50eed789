//! Shared counter storage on Redis for multi-process deployments.
//!
//! Sliding windows are sorted sets scored by timestamp; token buckets are
//! hashes. Every key carries a TTL, so Redis expires idle state on its own and
//! `cleanup_expired` has nothing to do.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{info, trace};
use uuid::Uuid;

use super::{refill, token_slack, Acquisition, BucketState, RateLimitBackend};
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;

/// Default prefix for every key this backend writes.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// Trim the window, then add members only if the limit allows it.
///
/// KEYS[1] = window key
/// ARGV = cutoff, now, limit, amount, ttl, member prefix
const ACQUIRE_SCRIPT: &str = r#"
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
    local count = redis.call('ZCARD', KEYS[1])
    local limit = tonumber(ARGV[3])
    local amount = tonumber(ARGV[4])
    if count + amount > limit then
        return {0, count}
    end
    for i = 1, amount do
        redis.call('ZADD', KEYS[1], ARGV[2], ARGV[6] .. ':' .. i)
    end
    redis.call('EXPIRE', KEYS[1], ARGV[5])
    return {1, count + amount}
"#;

/// Refill the bucket and take one token.
///
/// KEYS[1] = bucket key
/// ARGV = capacity, refill rate, now, ttl, token slack
/// Tokens are returned as a string so Lua doesn't truncate them to an integer.
const TOKEN_SCRIPT: &str = r#"
    local capacity = tonumber(ARGV[1])
    local rate = tonumber(ARGV[2])
    local now = tonumber(ARGV[3])
    local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens'))
    local last = tonumber(redis.call('HGET', KEYS[1], 'last_refill'))
    if tokens == nil or last == nil then
        tokens = capacity
        last = now
    end
    tokens = math.min(capacity, tokens + math.max(0, now - last) * rate)
    local allowed = 0
    if tokens >= 1 - tonumber(ARGV[5]) then
        tokens = math.max(0, tokens - 1)
        allowed = 1
    end
    redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(now))
    redis.call('EXPIRE', KEYS[1], ARGV[4])
    return {allowed, tostring(tokens)}
"#;

/// Counter storage shared through Redis.
pub struct RedisBackend {
    conn: ConnectionManager,
    clock: SharedClock,
    prefix: String,
}

impl RedisBackend {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis rate limit store");
        Ok(Self {
            conn,
            clock: system_clock(),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    /// Replace the clock used for timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Namespace every key under `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}bucket:{}", self.prefix, key)
    }
}

/// TTL for a window key, one second past the window.
fn window_ttl(window_size: u64) -> i64 {
    i64::try_from(window_size).unwrap_or(i64::MAX - 1) + 1
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    async fn get_usage(&self, key: &str, window_size: u64) -> Result<u64> {
        let cutoff = self.now() - window_size as f64;
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(self.window_key(key))
            .arg(format!("({}", cutoff))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn increment(&self, key: &str, window_size: u64, amount: u64) -> Result<u64> {
        let now = self.now();
        let cutoff = now - window_size as f64;
        let window_key = self.window_key(key);
        let member = Uuid::new_v4();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&window_key)
            .arg("-inf")
            .arg(cutoff)
            .ignore();
        for i in 0..amount {
            pipe.cmd("ZADD")
                .arg(&window_key)
                .arg(now)
                .arg(format!("{}:{}", member, i))
                .ignore();
        }
        pipe.cmd("ZCARD").arg(&window_key);
        pipe.cmd("EXPIRE")
            .arg(&window_key)
            .arg(window_ttl(window_size))
            .ignore();

        let mut conn = self.conn.clone();
        let (count,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(self.window_key(key))
            .arg(self.bucket_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        trace!("Redis expires rate limit keys natively; nothing to clean up");
        Ok(0)
    }

    async fn try_acquire(
        &self,
        key: &str,
        window_size: u64,
        limit: u64,
        amount: u64,
    ) -> Result<Acquisition> {
        let now = self.now();
        let mut conn = self.conn.clone();
        let (allowed, count): (i64, u64) = Script::new(ACQUIRE_SCRIPT)
            .key(self.window_key(key))
            .arg(now - window_size as f64)
            .arg(now)
            .arg(limit)
            .arg(amount)
            .arg(window_ttl(window_size))
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(Acquisition {
            allowed: allowed == 1,
            count,
        })
    }

    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
    ) -> Result<BucketState> {
        // Long enough for an empty bucket to refill completely.
        let ttl = if refill_per_sec > 0.0 {
            (capacity as f64 / refill_per_sec).ceil() as i64 + 1
        } else {
            1
        };

        let mut conn = self.conn.clone();
        let (allowed, tokens): (i64, String) = Script::new(TOKEN_SCRIPT)
            .key(self.bucket_key(key))
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(self.now())
            .arg(ttl)
            .arg(token_slack(refill_per_sec))
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketState {
            allowed: allowed == 1,
            tokens: tokens.parse().unwrap_or(0.0),
        })
    }

    async fn peek_tokens(&self, key: &str, capacity: u64, refill_per_sec: f64) -> Result<f64> {
        let mut conn = self.conn.clone();
        let (tokens, last_refill): (Option<f64>, Option<f64>) = redis::cmd("HMGET")
            .arg(self.bucket_key(key))
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await?;

        let capacity = capacity as f64;
        Ok(match (tokens, last_refill) {
            (Some(tokens), Some(last)) => refill(tokens, last, self.now(), capacity, refill_per_sec),
            _ => capacity,
        })
    }
}
