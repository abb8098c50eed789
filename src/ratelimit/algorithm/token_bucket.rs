//! Token bucket limiter.
//!
//! The bucket holds up to `limit` tokens and refills continuously at
//! `limit / period` tokens per second. Bursts up to the full bucket are
//! allowed while the long-run rate stays at the configured average.

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::limiter::{FailurePolicy, Limiter, SharedBackend};
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::{Algorithm, RateLimitRule};

pub struct TokenBucketLimiter {
    backend: SharedBackend,
    policy: FailurePolicy,
}

impl TokenBucketLimiter {
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_policy(backend, FailurePolicy::default())
    }

    pub fn with_policy(backend: SharedBackend, policy: FailurePolicy) -> Self {
        Self { backend, policy }
    }
}

/// Tokens regenerated per second.
fn refill_rate(rule: &RateLimitRule) -> f64 {
    rule.limit as f64 / rule.period as f64
}

/// Whole seconds until one token regenerates.
fn token_interval(rule: &RateLimitRule) -> u64 {
    if rule.limit == 0 {
        return rule.period;
    }
    ((rule.period as f64 / rule.limit as f64).ceil() as u64).max(1)
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn evaluate(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult> {
        let rate = refill_rate(rule);
        let now = self.backend.now();

        let bucket = self.backend.consume_token(key, rule.limit, rate).await?;

        let remaining = (bucket.tokens.floor() as u64).min(rule.limit);
        let usage = rule.limit - remaining;
        // Time until the bucket is full again
        let reset_at = if rate > 0.0 {
            now + (rule.limit as f64 - bucket.tokens).max(0.0) / rate
        } else {
            now + rule.period as f64
        };

        if bucket.allowed {
            Ok(RateLimitResult::allow(&rule.name, rule.limit, usage, reset_at))
        } else {
            Ok(RateLimitResult::reject(
                &rule.name,
                rule.limit,
                usage,
                reset_at,
                token_interval(rule),
            ))
        }
    }
}
