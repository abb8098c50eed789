//! Fixed window limiter.
//!
//! Windows are aligned to multiples of `period` since the unix epoch. Each
//! window gets its own counter key, so usage drops to zero at the boundary.

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::limiter::{FailurePolicy, Limiter, SharedBackend};
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::{Algorithm, RateLimitRule};

pub struct FixedWindowLimiter {
    backend: SharedBackend,
    policy: FailurePolicy,
}

impl FixedWindowLimiter {
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_policy(backend, FailurePolicy::default())
    }

    pub fn with_policy(backend: SharedBackend, policy: FailurePolicy) -> Self {
        Self { backend, policy }
    }
}

/// Start of the window containing `now`.
fn window_start(now: f64, period: u64) -> u64 {
    let period = period.max(1);
    (now.max(0.0) as u64 / period) * period
}

/// Counter key for the window of `key` containing `now`.
pub fn fixed_window_key(key: &str, now: f64, period: u64) -> String {
    format!("{}:{}", key, window_start(now, period))
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn evaluate(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult> {
        let now = self.backend.now();
        let start = window_start(now, rule.period);
        let reset_at = (start + rule.period) as f64;
        let window_key = fixed_window_key(key, now, rule.period);

        let acquired = self
            .backend
            .try_acquire(&window_key, rule.period, rule.limit, 1)
            .await?;

        if acquired.allowed {
            Ok(RateLimitResult::allow(&rule.name, rule.limit, acquired.count, reset_at))
        } else {
            let retry_after = ((reset_at - now).ceil() as u64).max(1);
            Ok(RateLimitResult::reject(
                &rule.name,
                rule.limit,
                acquired.count,
                reset_at,
                retry_after,
            ))
        }
    }
}
