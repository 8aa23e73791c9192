//! Authoritative inventory state for the Central node.
//!
//! Holds the product map plus the metadata singleton, runs the OCC
//! check-and-apply under per-product write locks, and emits one event per
//! successful mutation. The JSON snapshot is a warm-start optimization; the
//! event log is the durable truth and wins on restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::inventory::event_log::EventLog;
use crate::inventory::locks::KeyedLocks;
use crate::inventory::persistence;
use crate::models::{EventType, Metadata, Product};

/// Rejection reasons on the OCC mutation path. Cached under idempotency keys
/// exactly like successes, so retries replay the same typed error.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateError {
    ProductNotFound {
        product_id: String,
    },
    VersionConflict {
        current_version: u64,
        current_available: u64,
    },
    InvalidDelta {
        delta: i64,
    },
    InsufficientInventory {
        available: u64,
        delta: i64,
    },
    InvalidRequest {
        reason: String,
    },
    BackpressureTimeout,
    Timeout,
    Internal {
        reason: String,
    },
}

impl UpdateError {
    /// Wire-level `errorType` discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::ProductNotFound { .. } => "product_not_found",
            UpdateError::VersionConflict { .. } => "version_conflict",
            UpdateError::InvalidDelta { .. } => "invalid_delta",
            UpdateError::InsufficientInventory { .. } => "insufficient_inventory",
            UpdateError::InvalidRequest { .. } => "invalid_request",
            UpdateError::BackpressureTimeout => "backpressure_timeout",
            UpdateError::Timeout => "timeout",
            UpdateError::Internal { .. } => "internal_error",
        }
    }
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::ProductNotFound { product_id } => {
                write!(f, "product {product_id} not found")
            }
            UpdateError::VersionConflict {
                current_version,
                current_available,
            } => write!(
                f,
                "version conflict: current version {current_version}, available {current_available}"
            ),
            UpdateError::InvalidDelta { delta } => {
                write!(f, "delta {delta} is not allowed on the decrement path")
            }
            UpdateError::InsufficientInventory { available, delta } => {
                write!(f, "insufficient inventory: {available} available, delta {delta}")
            }
            UpdateError::InvalidRequest { reason } => write!(f, "invalid request: {reason}"),
            UpdateError::BackpressureTimeout => write!(f, "update queue is full"),
            UpdateError::Timeout => write!(f, "update processing timed out"),
            UpdateError::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for UpdateError {}

/// Rejection reasons on the admin paths.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminError {
    NotFound { product_id: String },
    AlreadyExists { product_id: String },
    Validation { reason: String },
}

impl AdminError {
    pub fn kind(&self) -> &'static str {
        match self {
            AdminError::NotFound { .. } => "product_not_found",
            AdminError::AlreadyExists { .. } => "already_exists",
            AdminError::Validation { .. } => "validation_error",
        }
    }
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminError::NotFound { product_id } => write!(f, "product {product_id} not found"),
            AdminError::AlreadyExists { product_id } => {
                write!(f, "product {product_id} already exists")
            }
            AdminError::Validation { reason } => write!(f, "validation error: {reason}"),
        }
    }
}

impl std::error::Error for AdminError {}

/// The state a successful mutation leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub product_id: String,
    pub new_quantity: u64,
    pub new_version: u64,
    pub last_updated: DateTime<Utc>,
}

/// Result of one stock update, success or typed rejection. This is the value
/// the idempotency cache stores, so a retry reproduces the exact outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(AppliedUpdate),
    Rejected(UpdateError),
}

/// New product as submitted on the admin create path.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub product_id: String,
    pub name: String,
    #[serde(default)]
    pub available: u64,
    #[serde(default)]
    pub price: f64,
}

/// Partial field update for the admin set path.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPatch {
    pub name: Option<String>,
    pub available: Option<u64>,
    pub price: Option<f64>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.available.is_none() && self.price.is_none()
    }
}

/// One page of the product listing.
#[derive(Debug, Clone)]
pub struct ProductPage {
    pub items: Vec<Product>,
    pub next_cursor: Option<String>,
    pub event_offset: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedInventory {
    products: HashMap<String, Product>,
    metadata: Metadata,
}

/// In-memory SKU map + metadata with OCC mutations and JSON warm-start.
pub struct InventoryStore {
    products: RwLock<HashMap<String, Product>>,
    metadata: Mutex<Metadata>,
    locks: KeyedLocks,
    event_log: Arc<EventLog>,
    persist_lock: Mutex<()>,
    path: PathBuf,
}

impl InventoryStore {
    /// Load the snapshot file if present and reconcile its metadata against
    /// the recovered event log. The log wins: a missing or reset log forces
    /// `last_offset` back to agree with it.
    pub fn open(path: PathBuf, event_log: Arc<EventLog>) -> Self {
        let (products, mut metadata) = match persistence::load_json::<PersistedInventory>(&path) {
            Ok(Some(persisted)) => {
                info!(
                    products = persisted.products.len(),
                    last_offset = persisted.metadata.last_offset,
                    path = %path.display(),
                    "inventory restored"
                );
                (persisted.products, persisted.metadata)
            }
            Ok(None) => {
                info!(path = %path.display(), "no inventory file, starting empty");
                (HashMap::new(), Metadata::default())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "inventory file unreadable, starting empty");
                (HashMap::new(), Metadata::default())
            }
        };

        metadata.total_products = products.len() as u64;

        let log_next = event_log.next_offset();
        let expected_last = log_next.saturating_sub(1);
        if metadata.last_offset != expected_last {
            warn!(
                snapshot_last_offset = metadata.last_offset,
                log_next_offset = log_next,
                "inventory metadata disagrees with event log, log wins"
            );
            metadata.last_offset = expected_last;
        }

        Self {
            products: RwLock::new(products),
            metadata: Mutex::new(metadata),
            locks: KeyedLocks::new(),
            event_log,
            persist_lock: Mutex::new(()),
            path,
        }
    }

    pub fn get(&self, product_id: &str) -> Option<Product> {
        let cell = self.locks.acquire(product_id);
        let _guard = cell.read();
        self.products.read().get(product_id).cloned()
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata.lock().clone()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn len(&self) -> usize {
        self.products.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.read().is_empty()
    }

    /// Deterministic listing: lexicographic by product id, cursor = last
    /// returned id, `next_cursor` absent once exhausted.
    pub fn list(&self, cursor: Option<&str>, limit: usize) -> ProductPage {
        // Offset first: the page is then never newer than the offset claims.
        let event_offset = self.event_log.next_offset();
        let products = self.products.read();

        let mut ids: Vec<&String> = match cursor {
            Some(cursor) => products.keys().filter(|id| id.as_str() > cursor).collect(),
            None => products.keys().collect(),
        };
        ids.sort();

        let limit = limit.max(1);
        let has_more = ids.len() > limit;
        ids.truncate(limit);

        let items: Vec<Product> = ids.iter().map(|id| products[*id].clone()).collect();
        let next_cursor = if has_more {
            items.last().map(|p| p.product_id.clone())
        } else {
            None
        };

        ProductPage {
            items,
            next_cursor,
            event_offset,
        }
    }

    /// Full-map snapshot plus the event offset it was taken at.
    ///
    /// The offset is read before the map is cloned: every event below the
    /// returned offset is already reflected in the map, so a replica resuming
    /// from it can only re-apply state it already holds, never miss any.
    pub fn snapshot(&self) -> (HashMap<String, Product>, u64) {
        let event_offset = self.event_log.next_offset();
        let products = self.products.read().clone();
        (products, event_offset)
    }

    /// The OCC mutation. Preconditions checked in order: existence, version
    /// match, delta sign (decrement-only path), stock floor. Exactly one
    /// event is appended per success.
    pub fn apply_delta(
        &self,
        product_id: &str,
        delta: i64,
        expected_version: u64,
        store_id: &str,
    ) -> Result<AppliedUpdate, UpdateError> {
        let cell = self.locks.acquire(product_id);
        let applied = {
            let _guard = cell.write();

            let current = self
                .products
                .read()
                .get(product_id)
                .cloned()
                .ok_or_else(|| UpdateError::ProductNotFound {
                    product_id: product_id.to_string(),
                })?;

            if expected_version != current.version {
                return Err(UpdateError::VersionConflict {
                    current_version: current.version,
                    current_available: current.available,
                });
            }
            if delta > 0 {
                return Err(UpdateError::InvalidDelta { delta });
            }
            let new_available = current.available as i64 + delta;
            if new_available < 0 {
                return Err(UpdateError::InsufficientInventory {
                    available: current.available,
                    delta,
                });
            }

            let updated = Product {
                available: new_available as u64,
                version: current.version + 1,
                last_updated: Utc::now(),
                ..current
            };
            self.products
                .write()
                .insert(product_id.to_string(), updated.clone());

            let offset = self.event_log.append(
                EventType::ProductUpdated,
                product_id,
                updated.clone(),
                updated.version,
            );
            self.advance_metadata(offset, None);

            tracing::debug!(
                product_id,
                store_id,
                delta,
                new_version = updated.version,
                offset,
                "stock update applied"
            );

            AppliedUpdate {
                product_id: updated.product_id,
                new_quantity: updated.available,
                new_version: updated.version,
                last_updated: updated.last_updated,
            }
        };
        // Per-id lock released before touching the filesystem.
        self.persist();
        Ok(applied)
    }

    /// Admin create: inserts at version 1 and emits `product_created`.
    pub fn admin_create(&self, new: NewProduct) -> Result<AppliedUpdate, AdminError> {
        if new.product_id.trim().is_empty() {
            return Err(AdminError::Validation {
                reason: "productId must not be empty".into(),
            });
        }
        if new.price < 0.0 {
            return Err(AdminError::Validation {
                reason: "price must not be negative".into(),
            });
        }

        let cell = self.locks.acquire(&new.product_id);
        let applied = {
            let _guard = cell.write();

            if self.products.read().contains_key(&new.product_id) {
                return Err(AdminError::AlreadyExists {
                    product_id: new.product_id,
                });
            }

            let product = Product {
                product_id: new.product_id.clone(),
                name: new.name,
                available: new.available,
                version: 1,
                price: new.price,
                last_updated: Utc::now(),
            };
            self.products
                .write()
                .insert(new.product_id.clone(), product.clone());

            let offset = self.event_log.append(
                EventType::ProductCreated,
                &new.product_id,
                product.clone(),
                product.version,
            );
            self.advance_metadata(offset, Some(1));

            info!(product_id = %new.product_id, offset, "product created");

            AppliedUpdate {
                product_id: product.product_id,
                new_quantity: product.available,
                new_version: product.version,
                last_updated: product.last_updated,
            }
        };
        self.persist();
        Ok(applied)
    }

    /// Admin partial update of name/available/price. Can raise stock; the
    /// decrement-only rule binds the OCC path, not this one.
    pub fn admin_set(
        &self,
        product_id: &str,
        patch: ProductPatch,
    ) -> Result<AppliedUpdate, AdminError> {
        if patch.is_empty() {
            return Err(AdminError::Validation {
                reason: "no fields to update".into(),
            });
        }
        if matches!(patch.price, Some(p) if p < 0.0) {
            return Err(AdminError::Validation {
                reason: "price must not be negative".into(),
            });
        }

        let cell = self.locks.acquire(product_id);
        let applied = {
            let _guard = cell.write();

            let current = self
                .products
                .read()
                .get(product_id)
                .cloned()
                .ok_or_else(|| AdminError::NotFound {
                    product_id: product_id.to_string(),
                })?;

            let updated = Product {
                name: patch.name.unwrap_or(current.name),
                available: patch.available.unwrap_or(current.available),
                price: patch.price.unwrap_or(current.price),
                version: current.version + 1,
                last_updated: Utc::now(),
                product_id: current.product_id,
            };
            self.products
                .write()
                .insert(product_id.to_string(), updated.clone());

            let offset = self.event_log.append(
                EventType::ProductUpdated,
                product_id,
                updated.clone(),
                updated.version,
            );
            self.advance_metadata(offset, None);

            AppliedUpdate {
                product_id: updated.product_id,
                new_quantity: updated.available,
                new_version: updated.version,
                last_updated: updated.last_updated,
            }
        };
        self.persist();
        Ok(applied)
    }

    /// Admin delete: removal is a version-incrementing event, not a silent
    /// disappearance; the tombstone snapshot lets replicas distinguish
    /// "deleted" from "never seen".
    pub fn admin_delete(&self, product_id: &str) -> Result<AppliedUpdate, AdminError> {
        let cell = self.locks.acquire(product_id);
        let applied = {
            let _guard = cell.write();

            let removed =
                self.products
                    .write()
                    .remove(product_id)
                    .ok_or_else(|| AdminError::NotFound {
                        product_id: product_id.to_string(),
                    })?;

            let tombstone = Product {
                version: removed.version + 1,
                last_updated: Utc::now(),
                ..removed
            };
            let offset = self.event_log.append(
                EventType::ProductDeleted,
                product_id,
                tombstone.clone(),
                tombstone.version,
            );
            self.advance_metadata(offset, Some(-1));

            info!(product_id, offset, "product deleted");

            AppliedUpdate {
                product_id: tombstone.product_id,
                new_quantity: tombstone.available,
                new_version: tombstone.version,
                last_updated: tombstone.last_updated,
            }
        };
        self.persist();
        Ok(applied)
    }

    /// Sweep lock cells for products that no longer exist.
    pub fn reap_locks(&self) -> usize {
        let active: std::collections::HashSet<String> =
            self.products.read().keys().cloned().collect();
        self.locks.reap(&active)
    }

    fn advance_metadata(&self, offset: u64, product_count_delta: Option<i64>) {
        let mut meta = self.metadata.lock();
        meta.last_offset = offset;
        meta.last_updated = Utc::now();
        match product_count_delta {
            Some(d) if d > 0 => meta.total_products += d as u64,
            Some(d) if d < 0 => meta.total_products = meta.total_products.saturating_sub((-d) as u64),
            _ => {}
        }
    }

    /// Best-effort snapshot write; failure never unwinds the mutation.
    fn persist(&self) {
        let _guard = self.persist_lock.lock();
        let doc = PersistedInventory {
            products: self.products.read().clone(),
            metadata: self.metadata.lock().clone(),
        };
        if let Err(e) = persistence::write_json_atomic(&self.path, &doc) {
            warn!(path = %self.path.display(), error = %e, "inventory persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, InventoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events.json"), 1000));
        let store = InventoryStore::open(dir.path().join("inventory.json"), log);
        (dir, store)
    }

    fn seeded(available: u64) -> (tempfile::TempDir, InventoryStore) {
        let (dir, store) = fixture();
        store
            .admin_create(NewProduct {
                product_id: "SKU-1".into(),
                name: "Widget".into(),
                available,
                price: 4.5,
            })
            .unwrap();
        (dir, store)
    }

    #[test]
    fn apply_delta_happy_path() {
        let (_dir, store) = seeded(10);
        // Creation is version 1; walk it to version 5 like a lived-in SKU.
        for v in 1..5 {
            store.apply_delta("SKU-1", 0, v, "store-1").unwrap();
        }

        let applied = store.apply_delta("SKU-1", -2, 5, "store-1").unwrap();
        assert_eq!(applied.new_quantity, 8);
        assert_eq!(applied.new_version, 6);

        let product = store.get("SKU-1").unwrap();
        assert_eq!(product.available, 8);
        assert_eq!(product.version, 6);
        assert_eq!(store.metadata().last_offset, store.event_log.next_offset() - 1);
    }

    #[test]
    fn precondition_order_not_found_before_version() {
        let (_dir, store) = fixture();
        let err = store.apply_delta("SKU-missing", -1, 0, "s").unwrap_err();
        assert!(matches!(err, UpdateError::ProductNotFound { .. }));
    }

    #[test]
    fn version_conflict_reports_current_state() {
        let (_dir, store) = seeded(10);
        let err = store.apply_delta("SKU-1", -1, 9, "s").unwrap_err();
        match err {
            UpdateError::VersionConflict {
                current_version,
                current_available,
            } => {
                assert_eq!(current_version, 1);
                assert_eq!(current_available, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn positive_delta_rejected_before_floor_check() {
        let (_dir, store) = seeded(10);
        let err = store.apply_delta("SKU-1", 3, 1, "s").unwrap_err();
        assert!(matches!(err, UpdateError::InvalidDelta { delta: 3 }));
    }

    #[test]
    fn boundary_deltas() {
        let (_dir, store) = seeded(3);

        // delta = 0 is accepted and still bumps the version.
        let applied = store.apply_delta("SKU-1", 0, 1, "s").unwrap();
        assert_eq!(applied.new_quantity, 3);
        assert_eq!(applied.new_version, 2);

        // Draining to exactly zero is accepted.
        let applied = store.apply_delta("SKU-1", -3, 2, "s").unwrap();
        assert_eq!(applied.new_quantity, 0);

        // One below zero is rejected and leaves state untouched.
        let before_offset = store.event_log.next_offset();
        let err = store.apply_delta("SKU-1", -1, 3, "s").unwrap_err();
        assert!(matches!(err, UpdateError::InsufficientInventory { .. }));
        assert_eq!(store.get("SKU-1").unwrap().available, 0);
        assert_eq!(store.get("SKU-1").unwrap().version, 3);
        assert_eq!(store.event_log.next_offset(), before_offset);
    }

    #[test]
    fn successful_mutation_appends_matching_event() {
        let (_dir, store) = seeded(10);
        let applied = store.apply_delta("SKU-1", -4, 1, "s").unwrap();

        let batch = store.event_log.fetch(0, 10).unwrap();
        let last = batch.events.last().unwrap();
        assert_eq!(last.event_type, EventType::ProductUpdated);
        assert_eq!(last.version, applied.new_version);
        assert_eq!(last.data.available, 6);
        assert_eq!(last.data, store.get("SKU-1").unwrap());
    }

    #[test]
    fn admin_create_conflicts_on_duplicate() {
        let (_dir, store) = seeded(10);
        let err = store
            .admin_create(NewProduct {
                product_id: "SKU-1".into(),
                name: "again".into(),
                available: 1,
                price: 1.0,
            })
            .unwrap_err();
        assert!(matches!(err, AdminError::AlreadyExists { .. }));
        assert_eq!(store.metadata().total_products, 1);
    }

    #[test]
    fn admin_set_requires_some_field() {
        let (_dir, store) = seeded(10);
        let err = store.admin_set("SKU-1", ProductPatch::default()).unwrap_err();
        assert!(matches!(err, AdminError::Validation { .. }));

        let applied = store
            .admin_set(
                "SKU-1",
                ProductPatch {
                    available: Some(50),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(applied.new_quantity, 50);
        assert_eq!(applied.new_version, 2);
    }

    #[test]
    fn admin_delete_emits_tombstone_with_bumped_version() {
        let (_dir, store) = seeded(10);
        let applied = store.admin_delete("SKU-1").unwrap();
        assert_eq!(applied.new_version, 2);
        assert!(store.get("SKU-1").is_none());
        assert_eq!(store.metadata().total_products, 0);

        let batch = store.event_log.fetch(0, 10).unwrap();
        let last = batch.events.last().unwrap();
        assert_eq!(last.event_type, EventType::ProductDeleted);
        assert_eq!(last.version, 2);
        assert_eq!(last.data.product_id, "SKU-1");
    }

    #[test]
    fn list_pages_lexicographically() {
        let (_dir, store) = fixture();
        for id in ["SKU-3", "SKU-1", "SKU-2"] {
            store
                .admin_create(NewProduct {
                    product_id: id.into(),
                    name: id.into(),
                    available: 1,
                    price: 1.0,
                })
                .unwrap();
        }

        let page = store.list(None, 2);
        let ids: Vec<&str> = page.items.iter().map(|p| p.product_id.as_str()).collect();
        assert_eq!(ids, vec!["SKU-1", "SKU-2"]);
        assert_eq!(page.next_cursor.as_deref(), Some("SKU-2"));

        let page = store.list(page.next_cursor.as_deref(), 2);
        let ids: Vec<&str> = page.items.iter().map(|p| p.product_id.as_str()).collect();
        assert_eq!(ids, vec!["SKU-3"]);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn warm_start_restores_and_log_wins_on_divergence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = Arc::new(EventLog::open(dir.path().join("events.json"), 1000));
            let store = InventoryStore::open(dir.path().join("inventory.json"), log);
            store
                .admin_create(NewProduct {
                    product_id: "SKU-1".into(),
                    name: "Widget".into(),
                    available: 10,
                    price: 4.5,
                })
                .unwrap();
            store.apply_delta("SKU-1", -1, 1, "s").unwrap();
        }

        // Normal restart: snapshot and log agree.
        {
            let log = Arc::new(EventLog::open(dir.path().join("events.json"), 1000));
            let store = InventoryStore::open(dir.path().join("inventory.json"), log.clone());
            assert_eq!(store.get("SKU-1").unwrap().available, 9);
            assert_eq!(store.metadata().last_offset, log.next_offset() - 1);
        }

        // Lost event log: metadata must reset to agree with the empty log.
        std::fs::remove_file(dir.path().join("events.json")).unwrap();
        {
            let log = Arc::new(EventLog::open(dir.path().join("events.json"), 1000));
            let store = InventoryStore::open(dir.path().join("inventory.json"), log);
            assert_eq!(store.metadata().last_offset, 0);
        }
    }

    #[test]
    fn reap_locks_drops_deleted_ids() {
        let (_dir, store) = seeded(10);
        store.get("SKU-1");
        store.admin_delete("SKU-1").unwrap();
        assert_eq!(store.reap_locks(), 1);
    }
}
