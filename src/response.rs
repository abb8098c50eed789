//! Framework-independent rendering of rate limit outcomes.
//!
//! Whatever serves requests can turn an [`Outcome`] into standard rate limit
//! headers and, on rejection, a 429 JSON body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ratelimit::{Outcome, RateLimitResult, BLACKLIST_RULE};

/// HTTP status for rejected requests.
pub const TOO_MANY_REQUESTS: u16 = 429;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Rate limit headers for a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the window resets
    pub reset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn from_result(result: &RateLimitResult) -> Self {
        Self {
            limit: result.total_limit,
            remaining: result.remaining,
            reset: result.reset_timestamp(),
            retry_after: if result.allowed { None } else { result.retry_after },
        }
    }

    /// Headers for the rejecting result, or the first result if allowed.
    ///
    /// `None` when no rule applied to the request.
    pub fn from_outcome(outcome: &Outcome) -> Option<Self> {
        outcome
            .rejection()
            .or_else(|| outcome.primary())
            .map(Self::from_result)
    }

    /// Header name/value pairs, ready to attach to a response.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        headers
    }
}

/// JSON body returned with a 429.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitExceeded {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
    pub limit: u64,
    pub reset_time: DateTime<Utc>,
}

impl RateLimitExceeded {
    pub fn from_result(result: &RateLimitResult) -> Self {
        let retry_after = result.retry_after.unwrap_or(0);
        let message = if result.rule_name == BLACKLIST_RULE {
            "Access denied".to_string()
        } else {
            format!(
                "Rate limit exceeded for '{}'. Try again in {} seconds.",
                result.rule_name, retry_after
            )
        };
        Self {
            error: "rate_limit_exceeded".to_string(),
            message,
            retry_after,
            limit: result.total_limit,
            reset_time: result.reset_time,
        }
    }

    /// Body for a rejected outcome; `None` if the request was allowed.
    pub fn from_outcome(outcome: &Outcome) -> Option<Self> {
        outcome.rejection().map(Self::from_result)
    }

    pub fn status(&self) -> u16 {
        TOO_MANY_REQUESTS
    }
}

/// Everything a caller needs to answer a request: the verdict, per-rule
/// results, headers, and the 429 body on rejection.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub results: Vec<RateLimitResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<RateLimitHeaders>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<RateLimitExceeded>,
}

impl Decision {
    pub fn from_outcome(outcome: Outcome) -> Self {
        let headers = RateLimitHeaders::from_outcome(&outcome);
        let body = RateLimitExceeded::from_outcome(&outcome);
        Self {
            allowed: outcome.is_allowed(),
            status: body.as_ref().map(RateLimitExceeded::status),
            results: outcome.into_results(),
            headers,
            body,
        }
    }
}
