//! Shard Beacon - shard lease coordinator for Discord bot clusters
//!
//! Hands out disjoint ranges of shard IDs to cooperating bot processes:
//! - Per-channel shard pools with heartbeat-renewed leases
//! - Automatic reclaim of expired leases and dead-lease callbacks to peers
//! - Authenticated JSON-over-WebSocket RPC
//! - Health/ready/metrics endpoints for operators

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod auth;
mod config;
mod data;
pub mod error;
mod health;
mod metrics;
mod rpc;
mod shard;

use auth::BearerAuth;
use config::BeaconConfig;
use data::SharedData;
use health::AppState;
use metrics::BeaconMetrics;
use rpc::{ConnectionHub, RemoteInvoker, RouteContext, ServerState};
use shard::{PoolRegistry, RetryPolicy};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let beacon_config = BeaconConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shard_beacon={}", beacon_config.log_level).parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %beacon_config.host,
        port = beacon_config.port,
        lease_lifetime_secs = beacon_config.lease.lifetime.as_secs(),
        "Starting Shard Beacon"
    );

    let metrics = BeaconMetrics::install()?;
    info!("Prometheus metrics initialized");

    let hub = Arc::new(ConnectionHub::new(beacon_config.request_timeout));
    let registry = Arc::new(PoolRegistry::new(
        beacon_config.lease,
        RetryPolicy {
            max_attempts: beacon_config.notify_max_attempts,
            base_delay: beacon_config.notify_base_delay,
        },
        Arc::clone(&hub) as Arc<dyn RemoteInvoker>,
    ));
    let routes = Arc::new(
        RouteContext::new(Arc::clone(&registry), Arc::new(SharedData::default()))
            .with_max_shard_count(beacon_config.max_shard_count),
    );

    let app = rpc::router(ServerState {
        hub: Arc::clone(&hub),
        routes,
        auth: Arc::new(BearerAuth::new(beacon_config.auth_token.clone())),
    })
    .merge(health::router(AppState {
        registry: Arc::clone(&registry),
        hub: Arc::clone(&hub),
        metrics,
    }));

    let listener =
        tokio::net::TcpListener::bind((beacon_config.host.as_str(), beacon_config.port)).await?;
    info!(addr = %listener.local_addr()?, "Starting WebSocket/HTTP server");

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "Server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!(channels = registry.len(), "Shutting down beacon...");
    registry.teardown_all().await;

    info!("Beacon shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
