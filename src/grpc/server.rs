//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::envoy::service::ratelimit::v3::rate_limit_service_server::RateLimitServiceServer;
use super::service::RateLimitServiceImpl;
use crate::error::{Result, TollgateError};
use crate::ratelimit::LimiterRegistry;

/// gRPC server for the Envoy rate limit service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Registry whose limiters back the service
    registry: Arc<LimiterRegistry>,
}

impl GrpcServer {
    /// Create a new gRPC server over a limiter registry.
    pub fn new(addr: SocketAddr, registry: Arc<LimiterRegistry>) -> Self {
        Self { addr, registry }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RateLimitServiceImpl::new(self.registry);

        info!(
            addr = %self.addr,
            "Starting gRPC server for RateLimitService"
        );

        Server::builder()
            .add_service(RateLimitServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}
