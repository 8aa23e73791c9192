//! Replication engine: drives the local cache to convergence with Central.
//!
//! An explicit circuit-breaker state machine. `Bootstrap` and `Fallback`
//! both resync from a snapshot; `PollingSteady` long-polls the event feed
//! and applies batches. Poll errors are swallowed and counted; after
//! `max_consecutive_failures` the breaker opens and the engine falls back
//! to snapshot resync until one succeeds.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::StoreCache;
use super::central_client::{CentralFeed, FeedError};

/// Circuit-breaker phase of one Store's replication loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Bootstrap,
    PollingSteady,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub sync_interval: Duration,
    pub wait_timeout_secs: u64,
    pub batch_limit: usize,
    pub max_consecutive_failures: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(2),
            wait_timeout_secs: 25,
            batch_limit: 100,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplicationStats {
    pub polls: AtomicU64,
    pub events_applied: AtomicU64,
    pub bootstraps: AtomicU64,
    pub poll_failures: AtomicU64,
}

/// Serializable view for the sync-status endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub last_event_offset: u64,
    pub last_sync_time: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub polls: u64,
    pub events_applied: u64,
    pub bootstraps: u64,
}

pub struct ReplicationEngine {
    cache: Arc<StoreCache>,
    feed: Arc<dyn CentralFeed>,
    config: ReplicationConfig,
    phase: RwLock<SyncPhase>,
    consecutive_failures: AtomicU32,
    pub stats: ReplicationStats,
}

impl ReplicationEngine {
    pub fn new(
        cache: Arc<StoreCache>,
        feed: Arc<dyn CentralFeed>,
        config: ReplicationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            feed,
            config,
            phase: RwLock::new(SyncPhase::Bootstrap),
            consecutive_failures: AtomicU32::new(0),
            stats: ReplicationStats::default(),
        })
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            phase: self.phase(),
            last_event_offset: self.cache.last_event_offset(),
            last_sync_time: self.cache.last_sync_time(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            polls: self.stats.polls.load(Ordering::Relaxed),
            events_applied: self.stats.events_applied.load(Ordering::Relaxed),
            bootstraps: self.stats.bootstraps.load(Ordering::Relaxed),
        }
    }

    /// Run the convergence loop until the process exits.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            info!(
                sync_interval_secs = engine.config.sync_interval.as_secs(),
                batch_limit = engine.config.batch_limit,
                "replication engine started"
            );
            loop {
                engine.step().await;
                tokio::time::sleep(engine.config.sync_interval).await;
            }
        })
    }

    /// One cycle of the state machine. Public so tests can drive the engine
    /// deterministically without the timer loop.
    pub async fn step(&self) {
        match self.phase() {
            SyncPhase::Bootstrap | SyncPhase::Fallback => self.resync_from_snapshot().await,
            SyncPhase::PollingSteady => self.poll_once().await,
        }
    }

    async fn resync_from_snapshot(&self) {
        match self.feed.fetch_snapshot().await {
            Ok(snapshot) => {
                let count = snapshot.products.len();
                self.cache.sync_all(snapshot.products, snapshot.event_offset);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.stats.bootstraps.fetch_add(1, Ordering::Relaxed);
                *self.phase.write() = SyncPhase::PollingSteady;
                info!(
                    products = count,
                    offset = snapshot.event_offset,
                    "snapshot resync complete, polling steady"
                );
            }
            Err(e) => {
                self.stats.poll_failures.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "snapshot resync failed, will retry");
            }
        }
    }

    async fn poll_once(&self) {
        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        let from = self.cache.last_event_offset();

        let response = match self
            .feed
            .fetch_events(from, self.config.batch_limit, self.config.wait_timeout_secs)
            .await
        {
            Ok(response) => response,
            Err(FeedError::OffsetGone) => {
                info!(from, "offset truncated on central, re-bootstrapping");
                self.enter(SyncPhase::Bootstrap);
                return;
            }
            Err(e) => {
                self.record_poll_failure(&e);
                return;
            }
        };

        // Central restarted with a younger log: our watermark is ahead of
        // anything it can serve.
        if response.next_offset < from {
            warn!(
                from,
                central_next = response.next_offset,
                "central reset detected, re-bootstrapping"
            );
            self.enter(SyncPhase::Bootstrap);
            return;
        }

        if !response.events.is_empty() {
            // A leading gap or any hole inside the batch means offsets would
            // be skipped; only a full resync is safe then.
            let leading_ok = response.events[0].offset == from;
            let contiguous = response
                .events
                .windows(2)
                .all(|pair| pair[0].offset + 1 == pair[1].offset);
            if !leading_ok || !contiguous {
                warn!(
                    from,
                    first = response.events[0].offset,
                    contiguous,
                    "event gap detected, re-bootstrapping"
                );
                self.enter(SyncPhase::Bootstrap);
                return;
            }

            let applied = response.events.len() as u64;
            self.cache.apply_events(&response.events);
            self.stats.events_applied.fetch_add(applied, Ordering::Relaxed);
            debug!(
                applied,
                watermark = self.cache.last_event_offset(),
                "event batch applied"
            );
        }

        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_poll_failure(&self, error: &FeedError) {
        self.stats.poll_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(failures, error = %error, "event poll failed");
        if failures >= self.config.max_consecutive_failures {
            warn!(
                failures,
                threshold = self.config.max_consecutive_failures,
                "circuit open, falling back to snapshot resync"
            );
            self.enter(SyncPhase::Fallback);
        }
    }

    fn enter(&self, phase: SyncPhase) {
        *self.phase.write() = phase;
    }
}
