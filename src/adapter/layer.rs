//! Chain-style adapter: a tower layer that runs before the handler.

use axum::{
    extract::{MatchedPath, Request},
    response::{IntoResponse, Response},
    Json,
};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};

use super::response::{apply_headers, RejectionBody, REJECTION_STATUS};
use crate::identity::{IdentifierResolver, RequestContext};
use crate::ratelimit::RateLimiter;

/// Rate limit layer.
///
/// Admitted requests reach the inner service and get rate limit headers on
/// the way out; rejected requests are answered with 429 without reaching it.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    resolver: IdentifierResolver,
    endpoint: Option<String>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            resolver: IdentifierResolver::new(),
            endpoint: None,
        }
    }

    pub fn with_resolver(mut self, resolver: IdentifierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Report metrics under a fixed endpoint label instead of the matched
    /// route.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    resolver: IdentifierResolver,
    endpoint: Option<String>,
}

impl<S> Service<Request> for RateLimitMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let limiter = self.limiter.clone();
        let identifier = self.resolver.resolve(&RequestContext::from_request(&req));
        // Label by route template, never by raw path
        let endpoint = self.endpoint.clone().unwrap_or_else(|| {
            req.extensions()
                .get::<MatchedPath>()
                .map(|path| path.as_str().to_string())
                .unwrap_or_else(|| self.limiter.name().to_string())
        });

        // Use the instance that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = limiter.consume_for(&identifier, &endpoint, 1).await;

            if !decision.is_allowed() {
                let body = RejectionBody::new(&limiter, &decision);
                let mut response = (REJECTION_STATUS, Json(body)).into_response();
                apply_headers(response.headers_mut(), &decision);
                return Ok(response);
            }

            let mut response = inner.call(req).await?;
            apply_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}
