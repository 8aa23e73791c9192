//! Central node - single source of truth for per-SKU stock.
//!
//! Owns the authoritative inventory, the OCC mutation pipeline, and the
//! durable event feed that Store replicas converge from.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stocksync_backend::api::{build_router, CentralState};
use stocksync_backend::inventory::{
    DispatcherConfig, EventLog, IdempotencyCache, InventoryStore, UpdateDispatcher,
};
use stocksync_backend::middleware::{ApiKeyGate, RateLimitConfig, RateLimiter};
use stocksync_backend::models::CentralConfig;

#[derive(Parser, Debug)]
#[command(name = "central", about = "StockSync central inventory node")]
struct Args {
    /// Listen port (overrides PORT).
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Inventory snapshot file (overrides DATA_PATH).
    #[arg(long, env = "DATA_PATH", default_value = "./data/inventory.json")]
    data_path: PathBuf,

    /// Event log file (overrides EVENTS_PATH).
    #[arg(long, env = "EVENTS_PATH", default_value = "./data/events.json")]
    events_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = CentralConfig::from_env().context("invalid central configuration")?;
    config.port = args.port;
    config.data_path = args.data_path;
    config.events_path = args.events_path;

    info!("starting central inventory node");

    // Recovery order matters: the event log first, then the inventory
    // snapshot reconciled against it. The log wins on divergence.
    let events = Arc::new(EventLog::open(config.events_path.clone(), config.max_events));
    let store = Arc::new(InventoryStore::open(
        config.data_path.clone(),
        events.clone(),
    ));
    info!(
        products = store.len(),
        next_offset = events.next_offset(),
        "state recovered"
    );

    let idempotency = Arc::new(IdempotencyCache::new(config.idempotency_ttl));
    idempotency.spawn_sweeper(config.idempotency_cleanup_interval);
    spawn_lock_reaper(store.clone(), config.idempotency_cleanup_interval);

    let dispatcher = UpdateDispatcher::spawn(
        store.clone(),
        idempotency.clone(),
        DispatcherConfig {
            worker_count: config.worker_count,
            queue_capacity: config.queue_buffer_size,
            ..Default::default()
        },
    );

    if config.api_key.is_empty() {
        warn!("API_KEY is empty: the /api/v1 surface is open");
    }
    let gate = ApiKeyGate::new(config.api_key.clone());
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: config.rate_limit_max_requests,
        window: config.rate_limit_window,
    });
    spawn_rate_limit_cleanup(limiter.clone(), config.rate_limit_window);

    let state = CentralState {
        store,
        events,
        dispatcher,
        idempotency,
        started_at: Utc::now(),
    };
    let app = build_router(state, gate, limiter);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "central API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("central node stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stocksync_backend=info,central=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Sweep lock cells for deleted products so the lock table tracks the
/// catalog instead of growing with its history.
fn spawn_lock_reaper(store: Arc<InventoryStore>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = store.reap_locks();
            if reaped > 0 {
                tracing::debug!(reaped, "reaped stale product locks");
            }
        }
    });
}

fn spawn_rate_limit_cleanup(limiter: RateLimiter, window: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(window * 2);
        loop {
            ticker.tick().await;
            limiter.cleanup();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
