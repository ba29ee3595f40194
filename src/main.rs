use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::error::TollgateError;
use tollgate::grpc::GrpcServer;
use tollgate::http::HttpServer;
use tollgate::metrics::RateLimitMetrics;
use tollgate::ratelimit::LimiterRegistry;

/// Admission control service with Redis-backed budgets.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<String>,

    /// Address for the Envoy rate limit gRPC service
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Address for the HTTP check, metrics and health endpoints
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Redis URL shared by every process enforcing the same budgets
    #[arg(long, env = "TOLLGATE_REDIS_URL")]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(url) = args.redis_url {
        config.store.redis_url = Some(url);
    }

    info!(
        grpc_addr = %config.server.grpc_addr,
        http_addr = %config.server.http_addr,
        redis = config.store.redis_url.is_some(),
        failure_policy = %config.store.failure_policy,
        limiters = config.limiters.len(),
        "Configuration loaded"
    );

    let metrics = RateLimitMetrics::new()?;
    let registry = Arc::new(LimiterRegistry::new(config.store.clone(), metrics)?);
    registry.create_all(&config.limiters).await?;

    let grpc_server = GrpcServer::new(config.server.grpc_addr, registry.clone());
    let http_server = HttpServer::new(config.server.http_addr, registry.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::try_join!(
        grpc_server.serve_with_shutdown(wait_for_shutdown(shutdown_rx.clone())),
        http_server.serve_with_shutdown(wait_for_shutdown(shutdown_rx)),
        async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
            Ok::<(), TollgateError>(())
        }
    );

    registry.shutdown().await;
    result?;

    info!("Tollgate stopped");
    Ok(())
}

/// Resolve once the shutdown flag is raised (or its sender is gone).
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
