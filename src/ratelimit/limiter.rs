//! The admission engine.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::key::ConsumptionKey;
use super::preset::{LimiterConfig, Quota};
use super::record::ConsumptionResult;
use crate::identity;
use crate::metrics::RateLimitMetrics;
use crate::store::FailoverStore;

/// Outcome of a consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request is admitted.
    Allowed {
        /// Budget per window
        limit: u32,
        /// Points left in the window
        remaining: u32,
        /// When the window resets
        reset_at: DateTime<Utc>,
    },
    /// The request is rejected; retrying before `retry_after` elapses will
    /// be rejected as well.
    Rejected {
        /// Budget per window
        limit: u32,
        /// Time until a retry can succeed
        retry_after: Duration,
        /// When the penalty (or window) ends
        reset_at: DateTime<Utc>,
    },
}

impl Decision {
    fn from_result(result: &ConsumptionResult) -> Self {
        let reset_at = Utc
            .timestamp_millis_opt(result.reset_at_ms)
            .single()
            .unwrap_or_else(Utc::now);

        if result.allowed {
            Decision::Allowed {
                limit: result.limit,
                remaining: result.remaining_points,
                reset_at,
            }
        } else {
            Decision::Rejected {
                limit: result.limit,
                retry_after: Duration::from_millis(result.ms_before_next.max(0) as u64),
                reset_at,
            }
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn limit(&self) -> u32 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Rejected { limit, .. } => *limit,
        }
    }

    /// Points left; always zero for a rejection.
    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Rejected { .. } => 0,
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        match self {
            Decision::Allowed { reset_at, .. } | Decision::Rejected { reset_at, .. } => *reset_at,
        }
    }

    /// Whole seconds to wait before retrying, rounded up. `None` when allowed.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Rejected { retry_after, .. } => {
                let ms = retry_after.as_millis() as u64;
                Some(ms.div_ceil(1000))
            }
        }
    }
}

/// A named, configured limiter.
///
/// Instances are created and cached by the
/// [`LimiterRegistry`](super::LimiterRegistry) and shared by `Arc`. Points
/// spent by a request are never refunded, even if the request later fails
/// or is abandoned.
pub struct RateLimiter {
    config: LimiterConfig,
    quota: Quota,
    store: Arc<FailoverStore>,
    metrics: RateLimitMetrics,
}

impl RateLimiter {
    pub(crate) fn new(config: LimiterConfig, store: Arc<FailoverStore>, metrics: RateLimitMetrics) -> Self {
        let quota = config.quota();
        Self {
            config,
            quota,
            store,
            metrics,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Consume `cost` points for `identifier`, reporting metrics under the
    /// limiter name as endpoint.
    pub async fn consume(&self, identifier: &str, cost: u32) -> Decision {
        self.consume_for(identifier, self.config.name(), cost).await
    }

    /// Consume `cost` points for `identifier`, reporting metrics under
    /// `endpoint`.
    pub async fn consume_for(&self, identifier: &str, endpoint: &str, cost: u32) -> Decision {
        let key = ConsumptionKey::new(&self.config, identifier);

        trace!(key = %key, cost = cost, "Consuming");

        let result = self.store.consume(key.as_str(), cost, &self.quota).await;
        let decision = Decision::from_result(&result);

        if !decision.is_allowed() {
            debug!(
                key = %key,
                limit = result.limit,
                ms_before_next = result.ms_before_next,
                "Rate limit exceeded"
            );
        }

        self.metrics.observe(
            identity::label(identifier),
            endpoint,
            decision.is_allowed(),
            decision.remaining(),
        );

        decision
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}
