//! Hook-style adapter for frameworks that call out during a request
//! lifecycle callback and apply the outcome themselves.

use axum::http::{HeaderName, StatusCode};
use std::sync::Arc;

use super::response::{header_pairs, RejectionBody, REJECTION_STATUS};
use crate::identity::{IdentifierResolver, RequestContext};
use crate::ratelimit::{Decision, RateLimiter};

/// What the host framework should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Continue processing and add `headers` to the eventual response.
    Proceed {
        headers: Vec<(HeaderName, String)>,
    },
    /// Stop processing and answer with this response.
    Reject {
        status: StatusCode,
        headers: Vec<(HeaderName, String)>,
        body: RejectionBody,
    },
}

impl HookOutcome {
    pub fn is_proceed(&self) -> bool {
        matches!(self, HookOutcome::Proceed { .. })
    }

    pub fn headers(&self) -> &[(HeaderName, String)] {
        match self {
            HookOutcome::Proceed { headers } | HookOutcome::Reject { headers, .. } => headers,
        }
    }
}

/// Rate limit hook sharing its decision logic with
/// [`RateLimitLayer`](super::RateLimitLayer).
#[derive(Clone)]
pub struct RateLimitHook {
    limiter: Arc<RateLimiter>,
    resolver: IdentifierResolver,
}

impl RateLimitHook {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            resolver: IdentifierResolver::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: IdentifierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Decide on a request reaching `endpoint`.
    pub async fn on_request(&self, ctx: &RequestContext, endpoint: &str) -> HookOutcome {
        let identifier = self.resolver.resolve(ctx);
        let decision = self.limiter.consume_for(&identifier, endpoint, 1).await;
        self.outcome(&decision)
    }

    fn outcome(&self, decision: &Decision) -> HookOutcome {
        let headers = header_pairs(decision);
        if decision.is_allowed() {
            HookOutcome::Proceed { headers }
        } else {
            HookOutcome::Reject {
                status: REJECTION_STATUS,
                headers,
                body: RejectionBody::new(&self.limiter, decision),
            }
        }
    }
}
