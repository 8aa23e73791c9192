//! Update dispatcher: bounded admission queue + worker pool.
//!
//! Serializes admission of stock mutations so back-pressure is explicit and
//! timeouts are deterministic. Workers drive each request through the
//! idempotency cache, the per-product lock, the OCC apply, and the event
//! append; the caller suspends on a one-shot reply channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::inventory::idempotency::IdempotencyCache;
use crate::inventory::store::{InventoryStore, UpdateError, UpdateOutcome};

/// One mutation as admitted to the queue.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub store_id: String,
    pub product_id: String,
    pub delta: i64,
    pub version: u64,
    pub idempotency_key: String,
}

struct UpdateJob {
    request: UpdateRequest,
    reply: oneshot::Sender<UpdateOutcome>,
    enqueued_at: Instant,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub processing_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 200,
            enqueue_timeout: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub submitted: AtomicU64,
    pub applied: AtomicU64,
    pub rejected: AtomicU64,
    pub idempotent_hits: AtomicU64,
    pub backpressure_timeouts: AtomicU64,
    pub processing_timeouts: AtomicU64,
    pub dropped_replies: AtomicU64,
}

/// Queue + worker pool in front of the inventory store.
pub struct UpdateDispatcher {
    queue: mpsc::Sender<UpdateJob>,
    config: DispatcherConfig,
    pub stats: Arc<DispatcherStats>,
}

impl UpdateDispatcher {
    /// Start the worker pool. Workers run until the dispatcher (and with it
    /// the queue sender) is dropped.
    pub fn spawn(
        store: Arc<InventoryStore>,
        idempotency: Arc<IdempotencyCache<UpdateOutcome>>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<UpdateJob>(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(DispatcherStats::default());

        for worker_id in 0..config.worker_count {
            let rx = rx.clone();
            let store = store.clone();
            let idempotency = idempotency.clone();
            let stats = stats.clone();
            let processing_timeout = config.processing_timeout;
            tokio::spawn(async move {
                worker_loop(worker_id, rx, store, idempotency, stats, processing_timeout).await;
            });
        }

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            "update dispatcher started"
        );

        Arc::new(Self {
            queue: tx,
            config,
            stats,
        })
    }

    /// Admit one update and wait for its outcome. Every path returns an
    /// outcome; queue overflow and deadlines surface as typed rejections.
    pub async fn submit(&self, request: UpdateRequest) -> UpdateOutcome {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = UpdateJob {
            request,
            reply: reply_tx,
            enqueued_at: Instant::now(),
        };

        let send = tokio::time::timeout(self.config.enqueue_timeout, self.queue.send(job)).await;
        match send {
            Err(_) => {
                self.stats.backpressure_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("update queue full, submission timed out");
                return UpdateOutcome::Rejected(UpdateError::BackpressureTimeout);
            }
            Ok(Err(_)) => {
                return UpdateOutcome::Rejected(UpdateError::Internal {
                    reason: "update queue closed".into(),
                });
            }
            Ok(Ok(())) => {}
        }

        // The worker enforces the processing deadline; the extra second here
        // covers queue residency of a job picked up near the admission cutoff.
        let reply_window = self.config.enqueue_timeout + self.config.processing_timeout
            + Duration::from_secs(1);
        match tokio::time::timeout(reply_window, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            _ => UpdateOutcome::Rejected(UpdateError::Timeout),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<UpdateJob>>>,
    store: Arc<InventoryStore>,
    idempotency: Arc<IdempotencyCache<UpdateOutcome>>,
    stats: Arc<DispatcherStats>,
    processing_timeout: Duration,
) {
    loop {
        // Lock only around the dequeue so idle workers don't starve busy ones.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            debug!(worker_id, "update queue closed, worker exiting");
            break;
        };

        let queued_for = job.enqueued_at.elapsed();
        let product_id = job.request.product_id.clone();

        let outcome = match tokio::time::timeout(
            processing_timeout,
            process_update(&store, &idempotency, &stats, job.request),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                stats.processing_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, product_id = %product_id, "update processing deadline exceeded");
                // Deliberately not cached: a retry with the same key should
                // re-run the mutation, not replay the deadline.
                UpdateOutcome::Rejected(UpdateError::Timeout)
            }
        };

        match &outcome {
            UpdateOutcome::Applied(_) => stats.applied.fetch_add(1, Ordering::Relaxed),
            UpdateOutcome::Rejected(_) => stats.rejected.fetch_add(1, Ordering::Relaxed),
        };

        // One-shot reply: either the caller is still waiting or it gave up
        // and the result is dropped here.
        if job.reply.send(outcome).is_err() {
            stats.dropped_replies.fetch_add(1, Ordering::Relaxed);
            debug!(
                worker_id,
                product_id = %product_id,
                queued_ms = queued_for.as_millis() as u64,
                "caller gone before reply, outcome dropped"
            );
        }
    }
}

/// Full mutation pipeline for one request: idempotency lookup, then the
/// OCC apply (which locks, checks, mutates, and appends the event).
async fn process_update(
    store: &InventoryStore,
    idempotency: &IdempotencyCache<UpdateOutcome>,
    stats: &DispatcherStats,
    request: UpdateRequest,
) -> UpdateOutcome {
    if let Some(cached) = idempotency.get(&request.idempotency_key) {
        stats.idempotent_hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %request.idempotency_key, "idempotent replay");
        return cached;
    }

    let outcome = match store.apply_delta(
        &request.product_id,
        request.delta,
        request.version,
        &request.store_id,
    ) {
        Ok(applied) => UpdateOutcome::Applied(applied),
        Err(err) => UpdateOutcome::Rejected(err),
    };

    // Successes and OCC rejections are both cached so a retry replays the
    // exact original outcome.
    idempotency.set(request.idempotency_key, outcome.clone());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::event_log::EventLog;
    use crate::inventory::store::NewProduct;

    fn fixture(config: DispatcherConfig) -> (tempfile::TempDir, Arc<UpdateDispatcher>, Arc<InventoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events.json"), 1000));
        let store = Arc::new(InventoryStore::open(dir.path().join("inventory.json"), log));
        store
            .admin_create(NewProduct {
                product_id: "SKU-1".into(),
                name: "Widget".into(),
                available: 10,
                price: 2.0,
            })
            .unwrap();
        let cache = Arc::new(IdempotencyCache::new(Duration::from_secs(60)));
        let dispatcher = UpdateDispatcher::spawn(store.clone(), cache, config);
        (dir, dispatcher, store)
    }

    fn request(key: &str, delta: i64, version: u64) -> UpdateRequest {
        UpdateRequest {
            store_id: "store-1".into(),
            product_id: "SKU-1".into(),
            delta,
            version,
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn submit_applies_and_replays_idempotently() {
        let (_dir, dispatcher, store) = fixture(DispatcherConfig::default());

        let first = dispatcher.submit(request("K1", -2, 1)).await;
        let UpdateOutcome::Applied(applied) = &first else {
            panic!("expected applied, got {first:?}");
        };
        assert_eq!(applied.new_quantity, 8);
        assert_eq!(applied.new_version, 2);

        let before = store.event_log().next_offset();
        let second = dispatcher.submit(request("K1", -2, 1)).await;
        assert_eq!(first, second);
        assert_eq!(store.event_log().next_offset(), before);
        assert_eq!(dispatcher.stats.idempotent_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn rejections_replay_from_cache_too() {
        let (_dir, dispatcher, store) = fixture(DispatcherConfig::default());

        let first = dispatcher.submit(request("KC", -50, 1)).await;
        assert!(matches!(
            &first,
            UpdateOutcome::Rejected(UpdateError::InsufficientInventory { .. })
        ));
        assert_eq!(store.get("SKU-1").unwrap().available, 10);

        let second = dispatcher.submit(request("KC", -50, 1)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn backpressure_surfaces_as_typed_rejection() {
        // Zero workers: nothing drains the single-slot queue, so the second
        // submission must time out at admission.
        let (_dir, dispatcher, _store) = fixture(DispatcherConfig {
            worker_count: 0,
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(50),
            processing_timeout: Duration::from_millis(200),
        });

        let parked = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(request("K-parked", -1, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = dispatcher.submit(request("K-full", -1, 1)).await;
        assert!(matches!(
            outcome,
            UpdateOutcome::Rejected(UpdateError::BackpressureTimeout)
        ));
        assert!(dispatcher.stats.backpressure_timeouts.load(Ordering::Relaxed) >= 1);

        // The parked job never ran; its caller times out with `timeout`.
        let parked_outcome = parked.await.unwrap();
        assert!(matches!(
            parked_outcome,
            UpdateOutcome::Rejected(UpdateError::Timeout)
        ));
    }

    #[tokio::test]
    async fn concurrent_same_version_submissions_one_winner() {
        let (_dir, dispatcher, store) = fixture(DispatcherConfig::default());

        let a = dispatcher.submit(request("KA", -1, 1));
        let b = dispatcher.submit(request("KB", -1, 1));
        let (ra, rb) = tokio::join!(a, b);

        let applied = [&ra, &rb]
            .iter()
            .filter(|o| matches!(o, UpdateOutcome::Applied(_)))
            .count();
        let conflicts = [&ra, &rb]
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    UpdateOutcome::Rejected(UpdateError::VersionConflict { .. })
                )
            })
            .count();
        assert_eq!(applied, 1);
        assert_eq!(conflicts, 1);

        let product = store.get("SKU-1").unwrap();
        assert_eq!(product.available, 9);
        assert_eq!(product.version, 2);
    }
}
