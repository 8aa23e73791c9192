//! End-to-end tests for the central mutation pipeline: dispatcher queue →
//! idempotency → per-product lock → OCC apply → event append.

use std::sync::Arc;
use std::time::Duration;

use stocksync_backend::inventory::store::{NewProduct, ProductPatch, UpdateError, UpdateOutcome};
use stocksync_backend::inventory::{
    DispatcherConfig, EventLog, IdempotencyCache, InventoryStore, UpdateDispatcher, UpdateRequest,
};

struct Central {
    _dir: tempfile::TempDir,
    store: Arc<InventoryStore>,
    events: Arc<EventLog>,
    dispatcher: Arc<UpdateDispatcher>,
}

/// Build a central engine with `SKU-1 {available: 10, version: 5}`, a
/// product that has seen a few admin touches, like any lived-in catalog.
fn central() -> Central {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(EventLog::open(dir.path().join("events.json"), 10_000));
    let store = Arc::new(InventoryStore::open(
        dir.path().join("inventory.json"),
        events.clone(),
    ));

    store
        .admin_create(NewProduct {
            product_id: "SKU-1".into(),
            name: "Widget".into(),
            available: 10,
            price: 19.99,
        })
        .unwrap();
    for _ in 0..4 {
        store
            .admin_set(
                "SKU-1",
                ProductPatch {
                    available: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    assert_eq!(store.get("SKU-1").unwrap().version, 5);

    let idempotency = Arc::new(IdempotencyCache::new(Duration::from_secs(3600)));
    let dispatcher = UpdateDispatcher::spawn(
        store.clone(),
        idempotency,
        DispatcherConfig::default(),
    );

    Central {
        _dir: dir,
        store,
        events,
        dispatcher,
    }
}

fn request(key: &str, product_id: &str, delta: i64, version: u64) -> UpdateRequest {
    UpdateRequest {
        store_id: "store-1".into(),
        product_id: product_id.into(),
        delta,
        version,
        idempotency_key: key.into(),
    }
}

#[tokio::test]
async fn happy_path_decrement_with_idempotent_retry() {
    let central = central();
    let offset_before = central.events.next_offset();

    let first = central.dispatcher.submit(request("K1", "SKU-1", -2, 5)).await;
    let UpdateOutcome::Applied(applied) = &first else {
        panic!("expected applied, got {first:?}");
    };
    assert_eq!(applied.new_quantity, 8);
    assert_eq!(applied.new_version, 6);

    // Exactly one event appended, carrying the post-state.
    assert_eq!(central.events.next_offset(), offset_before + 1);
    let batch = central.events.fetch(offset_before, 10).unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].data.available, 8);
    assert_eq!(batch.events[0].version, 6);
    assert_eq!(batch.events[0].data, central.store.get("SKU-1").unwrap());

    // The metadata watermark trails the log exactly.
    assert_eq!(central.store.metadata().last_offset, offset_before);

    // Retry with the same key: identical outcome, still one event total.
    let second = central.dispatcher.submit(request("K1", "SKU-1", -2, 5)).await;
    assert_eq!(first, second);
    assert_eq!(central.events.next_offset(), offset_before + 1);
}

#[tokio::test]
async fn concurrent_same_version_updates_have_one_winner() {
    let central = central();
    let offset_before = central.events.next_offset();

    let a = central.dispatcher.submit(request("KA", "SKU-1", -1, 5));
    let b = central.dispatcher.submit(request("KB", "SKU-1", -1, 5));
    let (ra, rb) = tokio::join!(a, b);

    let (winner, loser) = match (&ra, &rb) {
        (UpdateOutcome::Applied(w), UpdateOutcome::Rejected(l)) => (w.clone(), l.clone()),
        (UpdateOutcome::Rejected(l), UpdateOutcome::Applied(w)) => (w.clone(), l.clone()),
        other => panic!("expected one winner and one conflict, got {other:?}"),
    };

    assert_eq!(winner.new_version, 6);
    assert_eq!(winner.new_quantity, 9);
    match loser {
        UpdateError::VersionConflict {
            current_version,
            current_available,
        } => {
            assert_eq!(current_version, 6);
            assert_eq!(current_available, 9);
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    // Final state reflects exactly one applied update, one appended event.
    let product = central.store.get("SKU-1").unwrap();
    assert_eq!(product.available, 9);
    assert_eq!(product.version, 6);
    assert_eq!(central.events.next_offset(), offset_before + 1);
}

#[tokio::test]
async fn insufficient_inventory_leaves_state_untouched() {
    let central = central();
    central
        .store
        .admin_create(NewProduct {
            product_id: "SKU-2".into(),
            name: "Scarce".into(),
            available: 3,
            price: 1.0,
        })
        .unwrap();
    let offset_before = central.events.next_offset();

    let first = central.dispatcher.submit(request("KC", "SKU-2", -5, 1)).await;
    match &first {
        UpdateOutcome::Rejected(UpdateError::InsufficientInventory { available, delta }) => {
            assert_eq!(*available, 3);
            assert_eq!(*delta, -5);
        }
        other => panic!("expected insufficient_inventory, got {other:?}"),
    }

    let product = central.store.get("SKU-2").unwrap();
    assert_eq!(product.available, 3);
    assert_eq!(product.version, 1);
    assert_eq!(central.events.next_offset(), offset_before);

    // The failure is cached: a retry replays it without touching state.
    let second = central.dispatcher.submit(request("KC", "SKU-2", -5, 1)).await;
    assert_eq!(first, second);
    assert_eq!(central.events.next_offset(), offset_before);
}

#[tokio::test]
async fn long_poll_wakes_on_append() {
    let central = central();
    let offset = central.events.next_offset();

    let waiter = {
        let events = central.events.clone();
        tokio::spawn(async move {
            let start = std::time::Instant::now();
            let woke = events.wait_for(offset, Duration::from_secs(30)).await;
            (woke, start.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let outcome = central.dispatcher.submit(request("KW", "SKU-1", -1, 5)).await;
    assert!(matches!(outcome, UpdateOutcome::Applied(_)));

    let (woke, elapsed) = tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .expect("long poll must wake well before its timeout")
        .unwrap();
    assert!(woke);
    assert!(elapsed < Duration::from_secs(3));

    let batch = central.events.fetch(offset, 10).unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.next_offset, offset + 1);
}

#[tokio::test]
async fn deltas_of_zero_and_exact_drain_are_accepted() {
    let central = central();

    let outcome = central.dispatcher.submit(request("KZ", "SKU-1", 0, 5)).await;
    let UpdateOutcome::Applied(applied) = outcome else {
        panic!("delta 0 must be accepted");
    };
    assert_eq!(applied.new_quantity, 10);
    assert_eq!(applied.new_version, 6);

    let outcome = central
        .dispatcher
        .submit(request("KD", "SKU-1", -10, 6))
        .await;
    let UpdateOutcome::Applied(applied) = outcome else {
        panic!("drain to zero must be accepted");
    };
    assert_eq!(applied.new_quantity, 0);
}

#[tokio::test]
async fn restart_recovers_from_event_log_and_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (final_offset, final_available) = {
        let events = Arc::new(EventLog::open(dir.path().join("events.json"), 10_000));
        let store = Arc::new(InventoryStore::open(
            dir.path().join("inventory.json"),
            events.clone(),
        ));
        store
            .admin_create(NewProduct {
                product_id: "SKU-1".into(),
                name: "Widget".into(),
                available: 10,
                price: 1.0,
            })
            .unwrap();
        store.apply_delta("SKU-1", -4, 1, "store-1").unwrap();
        (events.next_offset(), store.get("SKU-1").unwrap().available)
    };

    let events = Arc::new(EventLog::open(dir.path().join("events.json"), 10_000));
    let store = InventoryStore::open(dir.path().join("inventory.json"), events.clone());

    assert_eq!(events.next_offset(), final_offset);
    assert_eq!(store.get("SKU-1").unwrap().available, final_available);
    assert_eq!(store.metadata().last_offset, final_offset - 1);
}
