//! Rate limit headers and rejection bodies shared by every adapter.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::ratelimit::{Decision, RateLimiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Status returned for rejected requests.
pub const REJECTION_STATUS: StatusCode = StatusCode::TOO_MANY_REQUESTS;

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    /// Seconds until a retry can succeed
    pub retry_after: u64,
    /// Budget per window
    pub limit: u32,
    /// Window length in seconds
    pub window: u64,
}

impl RejectionBody {
    pub fn new(limiter: &RateLimiter, decision: &Decision) -> Self {
        let retry_after = decision.retry_after_secs().unwrap_or(0);
        Self {
            error: "Too Many Requests".to_string(),
            message: format!(
                "Rate limit exceeded for '{}'. Try again in {} seconds.",
                limiter.name(),
                retry_after
            ),
            retry_after,
            limit: decision.limit(),
            window: limiter.config().duration_secs(),
        }
    }
}

/// Rate limit headers for a decision as name/value pairs.
///
/// Allowed: limit, remaining and reset (unix seconds). Rejected: the same
/// with remaining `0`, plus `Retry-After` in whole seconds.
pub fn header_pairs(decision: &Decision) -> Vec<(HeaderName, String)> {
    let mut pairs = vec![
        (X_RATELIMIT_LIMIT, decision.limit().to_string()),
        (X_RATELIMIT_REMAINING, decision.remaining().to_string()),
        (X_RATELIMIT_RESET, decision.reset_at().timestamp().to_string()),
    ];
    if let Some(retry_after) = decision.retry_after_secs() {
        pairs.push((axum::http::header::RETRY_AFTER, retry_after.to_string()));
    }
    pairs
}

/// Write the rate limit headers for `decision` into `headers`.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in header_pairs(decision) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn test_allowed_headers() {
        let decision = Decision::Allowed {
            limit: 10,
            remaining: 7,
            reset_at: Utc.timestamp_opt(1_700_000_060, 0).unwrap(),
        };

        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &decision);

        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "7");
        assert_eq!(headers["x-ratelimit-reset"], "1700000060");
        assert!(headers.get("retry-after").is_none());
    }

    #[test]
    fn test_rejected_headers() {
        let decision = Decision::Rejected {
            limit: 10,
            retry_after: Duration::from_millis(2_500),
            reset_at: Utc.timestamp_opt(1_700_000_003, 0).unwrap(),
        };

        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &decision);

        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "3");
    }

    #[test]
    fn test_rejection_body_is_camel_case() {
        let body = RejectionBody {
            error: "Too Many Requests".to_string(),
            message: "slow down".to_string(),
            retry_after: 30,
            limit: 5,
            window: 300,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["retryAfter"], 30);
        assert_eq!(json["limit"], 5);
        assert_eq!(json["window"], 300);
    }
}
