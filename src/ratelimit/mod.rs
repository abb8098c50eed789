//! Rate limiting rules, algorithms and counter storage.

pub mod algorithm;
pub mod backend;
mod context;
mod limiter;
mod manager;
mod result;
mod rules;
#[cfg(test)]
mod testing;

pub use backend::{Acquisition, BucketState, MemoryBackend, RateLimitBackend, SqliteBackend};
#[cfg(feature = "redis-backend")]
pub use backend::RedisBackend;
pub use context::RequestContext;
pub use limiter::{FailurePolicy, Limiter, SharedBackend};
pub use manager::{RateLimitManager, RateLimitManagerBuilder, UsageSnapshot};
pub use result::{Outcome, RateLimitResult, BLACKLIST_RETRY_AFTER, BLACKLIST_RULE};
pub use rules::{
    default_rules, sort_by_priority, Action, Algorithm, RateLimitRule, RuleSet, Scope,
    DEFAULT_PRIORITY,
};
