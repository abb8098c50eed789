//! Per-evaluation rate limit outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_datetime;

/// Rule name reported for blacklist rejections.
pub const BLACKLIST_RULE: &str = "blacklist";
/// Retry-after for blacklisted identities (24 hours).
pub const BLACKLIST_RETRY_AFTER: u64 = 86_400;

/// The result of checking one rule for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the window resets
    pub reset_time: DateTime<Utc>,
    /// Seconds to wait before retrying; only set on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Rule that produced this result
    pub rule_name: String,
    /// Events counted in the current window
    pub current_usage: u64,
    /// Limit applied
    pub total_limit: u64,
}

impl RateLimitResult {
    /// An accepting result.
    pub fn allow(rule_name: &str, limit: u64, usage: u64, reset_at: f64) -> Self {
        Self {
            allowed: true,
            remaining: limit.saturating_sub(usage),
            reset_time: to_datetime(reset_at),
            retry_after: None,
            rule_name: rule_name.to_string(),
            current_usage: usage,
            total_limit: limit,
        }
    }

    /// A rejecting result.
    pub fn reject(rule_name: &str, limit: u64, usage: u64, reset_at: f64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: limit.saturating_sub(usage),
            reset_time: to_datetime(reset_at),
            retry_after: Some(retry_after),
            rule_name: rule_name.to_string(),
            current_usage: usage,
            total_limit: limit,
        }
    }

    /// The synthetic rejection returned for blacklisted callers.
    pub fn blacklisted(now: f64) -> Self {
        Self::reject(
            BLACKLIST_RULE,
            0,
            0,
            now + BLACKLIST_RETRY_AFTER as f64,
            BLACKLIST_RETRY_AFTER,
        )
    }

    /// Turn a rejection into an allow, keeping the counters.
    pub fn into_allowed(mut self) -> Self {
        self.allowed = true;
        self.retry_after = None;
        self
    }

    /// Reset time as unix seconds.
    pub fn reset_timestamp(&self) -> i64 {
        self.reset_time.timestamp()
    }
}

/// Everything `check_rate_limit` produced for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    results: Vec<RateLimitResult>,
}

impl Outcome {
    pub fn new(results: Vec<RateLimitResult>) -> Self {
        Self { results }
    }

    /// True unless some result rejected.
    pub fn is_allowed(&self) -> bool {
        self.results.iter().all(|r| r.allowed)
    }

    /// The first rejecting result, if any.
    pub fn rejection(&self) -> Option<&RateLimitResult> {
        self.results.iter().find(|r| !r.allowed)
    }

    /// The first result, which belongs to the highest-priority applicable rule.
    pub fn primary(&self) -> Option<&RateLimitResult> {
        self.results.first()
    }

    pub fn results(&self) -> &[RateLimitResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<RateLimitResult> {
        self.results
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}
