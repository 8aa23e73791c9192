//! Store node - warm read replica of the central inventory.
//!
//! Serves reads from the local mirror, proxies mutations to Central with
//! store-namespaced idempotency keys, and runs the replication engine that
//! keeps the mirror converged.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stocksync_backend::middleware::ApiKeyGate;
use stocksync_backend::models::StoreConfig;
use stocksync_backend::store::{
    api::{build_router, StoreState},
    CentralClient, ReplicationConfig, ReplicationEngine, StoreCache,
};

#[derive(Parser, Debug)]
#[command(name = "store-node", about = "StockSync store replica node")]
struct Args {
    /// Listen port (overrides PORT).
    #[arg(long, env = "PORT", default_value_t = 8081)]
    port: u16,

    /// Local data directory (overrides DATA_DIR).
    #[arg(long, env = "DATA_DIR", default_value = "./store-data")]
    data_dir: PathBuf,

    /// Base URL of the central node (overrides CENTRAL_URL).
    #[arg(long, env = "CENTRAL_URL", default_value = "http://localhost:8080")]
    central_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = StoreConfig::from_env().context("invalid store configuration")?;
    config.port = args.port;
    config.data_dir = args.data_dir;
    config.central_url = args.central_url.trim_end_matches('/').to_string();

    info!(store_id = %config.store_id, central = %config.central_url, "starting store node");

    let cache = Arc::new(StoreCache::open(&config.data_dir));
    let central = Arc::new(
        CentralClient::new(config.central_url.clone(), &config.central_api_key)
            .context("failed to build central client")?,
    );

    let replication = ReplicationEngine::new(
        cache.clone(),
        central.clone(),
        ReplicationConfig {
            sync_interval: config.sync_interval,
            wait_timeout_secs: config.event_wait_timeout_secs,
            batch_limit: config.event_batch_limit,
            max_consecutive_failures: config.max_consecutive_failures,
        },
    );
    replication.spawn();

    if config.api_key.is_empty() {
        warn!("API_KEY is empty: the /api/v1 surface is open");
    }
    let gate = ApiKeyGate::new(config.api_key.clone());

    let state = StoreState {
        cache,
        replication,
        central,
        store_id: config.store_id.clone(),
        started_at: Utc::now(),
    };
    let app = build_router(state, gate);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, store_id = %config.store_id, "store API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("store node stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stocksync_backend=info,store_node=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
