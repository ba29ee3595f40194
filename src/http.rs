//! HTTP server: forward-auth check endpoints, metrics and health.
//!
//! Every limiter in the registry gets `GET /v1/check/{name}`, guarded by
//! [`RateLimitLayer`]. Reverse proxies that support sub-request
//! authorization can point at it and relay the 429 and rate limit headers.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::adapter::RateLimitLayer;
use crate::error::Result;
use crate::ratelimit::LimiterRegistry;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// HTTP server for the check, metrics and health endpoints.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Registry whose limiters are exposed
    registry: Arc<LimiterRegistry>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, registry: Arc<LimiterRegistry>) -> Self {
        Self { addr, registry }
    }

    /// Build the router for the limiters currently in the registry.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics));

        for name in self.registry.names() {
            let Some(limiter) = self.registry.get(&name) else {
                continue;
            };
            let path = format!("/v1/check/{}", name);
            router = router.route(
                &path,
                get(allowed).layer(RateLimitLayer::new(limiter).with_endpoint(name)),
            );
        }

        router.with_state(self.registry.clone())
    }

    /// Start the HTTP server with graceful shutdown.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            limiters = ?self.registry.names(),
            "Starting HTTP server"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

async fn allowed() -> impl IntoResponse {
    Json(json!({ "status": "allowed" }))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics(State(registry): State<Arc<LimiterRegistry>>) -> Response {
    match registry.metrics().render() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
