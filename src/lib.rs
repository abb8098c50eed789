//! Ratekeeper - request-scoped rate limiting
//!
//! Evaluates inbound requests against a prioritized set of rate limit rules.
//! Rules are scoped to an IP, user, user type, endpoint, API key or the whole
//! service, and are enforced with sliding window, fixed window, token bucket
//! or adaptive limiters on top of pluggable counter storage (in-memory,
//! SQLite or Redis).

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod response;

pub use error::{RateLimitError, Result};
pub use ratelimit::{
    Outcome, RateLimitManager, RateLimitResult, RateLimitRule, RequestContext,
};
