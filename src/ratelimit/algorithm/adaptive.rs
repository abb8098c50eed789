//! Adaptive limiter.
//!
//! Wraps the sliding window limiter and scales the limit by how busy the key
//! has been over a history window ten periods long. Quiet callers get 20%
//! more headroom; callers that have been running near the limit get 20% less.

use async_trait::async_trait;
use tracing::trace;

use super::SlidingWindowLimiter;
use crate::error::Result;
use crate::ratelimit::limiter::{FailurePolicy, Limiter, SharedBackend};
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::{Algorithm, RateLimitRule};

/// Number of periods covered by the history window.
pub const HISTORY_PERIODS: u64 = 10;
/// Below this utilization the limit is raised.
const LOW_UTILIZATION: f64 = 0.5;
/// Above this utilization the limit is lowered.
const HIGH_UTILIZATION: f64 = 0.9;
const RAISE_FACTOR: f64 = 1.2;
const LOWER_FACTOR: f64 = 0.8;

pub struct AdaptiveRateLimiter {
    inner: SlidingWindowLimiter,
    backend: SharedBackend,
    policy: FailurePolicy,
}

impl AdaptiveRateLimiter {
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_policy(backend, FailurePolicy::default())
    }

    pub fn with_policy(backend: SharedBackend, policy: FailurePolicy) -> Self {
        Self {
            inner: SlidingWindowLimiter::with_policy(backend.clone(), policy),
            backend,
            policy,
        }
    }
}

/// Counter key holding the check history for `key`.
pub fn history_key(key: &str) -> String {
    format!("history:{}", key)
}

/// Limit to apply given the number of checks seen over the history window.
///
/// Utilization is the per-period average of the history compared to `limit`.
pub fn effective_limit(limit: u64, history: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    let average = history as f64 / HISTORY_PERIODS as f64;
    let utilization = average / limit as f64;

    if utilization < LOW_UTILIZATION {
        (limit as f64 * RAISE_FACTOR).round() as u64
    } else if utilization > HIGH_UTILIZATION {
        ((limit as f64 * LOWER_FACTOR).round() as u64).max(1)
    } else {
        limit
    }
}

#[async_trait]
impl Limiter for AdaptiveRateLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Adaptive
    }

    fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn evaluate(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult> {
        let history_key = history_key(key);
        let history_window = rule.period.saturating_mul(HISTORY_PERIODS);

        let history = self.backend.get_usage(&history_key, history_window).await?;
        let limit = effective_limit(rule.limit, history);
        if limit != rule.limit {
            trace!(
                key = %key,
                rule = %rule.name,
                history = history,
                configured = rule.limit,
                effective = limit,
                "Adjusted rate limit"
            );
        }

        let result = self.inner.evaluate(key, &rule.with_limit(limit)).await?;

        // Every check counts toward history, accepted or not.
        self.backend.increment(&history_key, history_window, 1).await?;
        Ok(result)
    }
}
