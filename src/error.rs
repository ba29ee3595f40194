//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Rejection by a limiter is not an error; it is reported as
/// [`Decision::Rejected`](crate::ratelimit::Decision::Rejected).
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid limiter presets, overrides or configuration files
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store backend could not be reached within its timeout
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Metrics registration or encoding errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
