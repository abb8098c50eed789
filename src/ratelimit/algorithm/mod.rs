//! Rate limiting algorithms.

mod adaptive;
mod fixed_window;
mod sliding_window;
mod token_bucket;

use std::sync::Arc;

pub use adaptive::{effective_limit, history_key, AdaptiveRateLimiter};
pub use fixed_window::{fixed_window_key, FixedWindowLimiter};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use super::limiter::{FailurePolicy, Limiter, SharedBackend};
use super::rules::Algorithm;

/// Build the limiter for `algorithm` on top of `backend`.
pub fn build_limiter(
    algorithm: Algorithm,
    backend: SharedBackend,
    policy: FailurePolicy,
) -> Arc<dyn Limiter> {
    match algorithm {
        Algorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::with_policy(backend, policy)),
        Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::with_policy(backend, policy)),
        Algorithm::FixedWindow => Arc::new(FixedWindowLimiter::with_policy(backend, policy)),
        Algorithm::Adaptive => Arc::new(AdaptiveRateLimiter::with_policy(backend, policy)),
    }
}
