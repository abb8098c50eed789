//! Sliding window limiter.
//!
//! Counts individual events in the trailing `period` seconds, so no trailing
//! window ever holds more than `limit` accepted requests.

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::limiter::{FailurePolicy, Limiter, SharedBackend};
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::{Algorithm, RateLimitRule};

pub struct SlidingWindowLimiter {
    backend: SharedBackend,
    policy: FailurePolicy,
}

impl SlidingWindowLimiter {
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_policy(backend, FailurePolicy::default())
    }

    pub fn with_policy(backend: SharedBackend, policy: FailurePolicy) -> Self {
        Self { backend, policy }
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn evaluate(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult> {
        let now = self.backend.now();
        let reset_at = now + rule.period as f64;

        let acquired = self
            .backend
            .try_acquire(key, rule.period, rule.limit, 1)
            .await?;

        if acquired.allowed {
            Ok(RateLimitResult::allow(&rule.name, rule.limit, acquired.count, reset_at))
        } else {
            Ok(RateLimitResult::reject(
                &rule.name,
                rule.limit,
                acquired.count,
                reset_at,
                rule.period,
            ))
        }
    }
}
