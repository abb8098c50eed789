//! Limiter trait shared by all algorithms, and backend failure handling.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::backend::RateLimitBackend;
use super::result::RateLimitResult;
use super::rules::{Algorithm, RateLimitRule};
use crate::error::{RateLimitError, Result};

/// Shared handle to a counter backend.
pub type SharedBackend = Arc<dyn RateLimitBackend>;

/// What a limiter returns when its backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the request and log a warning
    #[default]
    Open,
    /// Reject the request as if the limit were exhausted
    Closed,
    /// Return the backend error to the caller
    Propagate,
}

impl FailurePolicy {
    /// Turn a backend error into a decision according to this policy.
    pub fn resolve(
        &self,
        rule: &RateLimitRule,
        backend: &str,
        now: f64,
        err: RateLimitError,
    ) -> Result<RateLimitResult> {
        let reset_at = now + rule.period as f64;
        match self {
            FailurePolicy::Open => {
                warn!(
                    rule = %rule.name,
                    backend = backend,
                    error = %err,
                    "Rate limit backend unavailable, allowing request"
                );
                Ok(RateLimitResult::allow(&rule.name, rule.limit, 0, reset_at))
            }
            FailurePolicy::Closed => {
                warn!(
                    rule = %rule.name,
                    backend = backend,
                    error = %err,
                    "Rate limit backend unavailable, rejecting request"
                );
                Ok(RateLimitResult::reject(
                    &rule.name,
                    rule.limit,
                    rule.limit,
                    reset_at,
                    rule.period,
                ))
            }
            FailurePolicy::Propagate => {
                error!(rule = %rule.name, backend = backend, error = %err, "Rate limit backend error");
                Err(err)
            }
        }
    }
}

/// A rate limiting algorithm bound to a counter backend.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// The algorithm this limiter implements.
    fn algorithm(&self) -> Algorithm;

    /// The backend holding this limiter's counters.
    fn backend(&self) -> &SharedBackend;

    /// How backend errors are handled by [`Limiter::check_limit`].
    fn failure_policy(&self) -> FailurePolicy;

    /// Decide on one request; backend errors are returned as-is.
    async fn evaluate(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult>;

    /// Decide on one request, resolving backend errors through the failure policy.
    async fn check_limit(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult> {
        trace!(
            key = %key,
            rule = %rule.name,
            algorithm = ?self.algorithm(),
            "Checking rate limit"
        );

        match self.evaluate(key, rule).await {
            Ok(result) => {
                if !result.allowed {
                    debug!(
                        key = %key,
                        rule = %rule.name,
                        usage = result.current_usage,
                        limit = result.total_limit,
                        "Rate limit exceeded"
                    );
                }
                Ok(result)
            }
            Err(err) if err.is_backend() => {
                let backend = self.backend();
                self.failure_policy()
                    .resolve(rule, backend.name(), backend.now(), err)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> RateLimitRule {
        RateLimitRule::new("api", 10, 60)
    }

    fn backend_error() -> RateLimitError {
        RateLimitError::backend("redis", "connection refused")
    }

    #[test]
    fn test_fail_open_allows() {
        let result = FailurePolicy::Open
            .resolve(&rule(), "redis", 0.0, backend_error())
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 10);
    }

    #[test]
    fn test_fail_closed_rejects() {
        let result = FailurePolicy::Closed
            .resolve(&rule(), "redis", 0.0, backend_error())
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(60));
    }

    #[test]
    fn test_propagate_returns_error() {
        let result = FailurePolicy::Propagate.resolve(&rule(), "redis", 0.0, backend_error());
        assert!(matches!(result, Err(RateLimitError::Backend { .. })));
    }

    #[test]
    fn test_default_policy_is_open() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Open);
    }
}
