//! Warm local mirror of Central state on a Store node.
//!
//! Reads never block on synchronization; the replication engine applies
//! event batches under one write lock and snapshots replace the map
//! wholesale. `last_event_offset` is always the next offset to request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::inventory::persistence;
use crate::models::{Event, EventType, Product, UpdateResult};

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PersistedLocalInventory {
    products: HashMap<String, Product>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSyncMetadata {
    last_event_offset: u64,
    last_sync_time: DateTime<Utc>,
}

struct LocalState {
    products: HashMap<String, Product>,
    last_event_offset: u64,
    last_sync_time: DateTime<Utc>,
}

/// One page of the local listing, with replication freshness attached.
#[derive(Debug, Clone)]
pub struct LocalPage {
    pub items: Vec<Product>,
    pub next_cursor: Option<String>,
    pub last_event_offset: u64,
    pub last_sync_time: DateTime<Utc>,
}

/// The Store-side product mirror with twin-file persistence.
pub struct StoreCache {
    state: RwLock<LocalState>,
    persist_lock: Mutex<()>,
    inventory_path: PathBuf,
    metadata_path: PathBuf,
}

impl StoreCache {
    /// Restore the mirror from `data_dir`, or start cold (offset 0 forces a
    /// snapshot bootstrap on the first replication cycle).
    pub fn open(data_dir: &Path) -> Self {
        let inventory_path = data_dir.join("local_inventory.json");
        let metadata_path = data_dir.join("storage_metadata.json");

        let products = match persistence::load_json::<PersistedLocalInventory>(&inventory_path) {
            Ok(Some(p)) => p.products,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(path = %inventory_path.display(), error = %e, "local inventory unreadable, starting cold");
                HashMap::new()
            }
        };
        let (last_event_offset, last_sync_time) =
            match persistence::load_json::<PersistedSyncMetadata>(&metadata_path) {
                Ok(Some(m)) => (m.last_event_offset, m.last_sync_time),
                Ok(None) => (0, Utc::now()),
                Err(e) => {
                    warn!(path = %metadata_path.display(), error = %e, "sync metadata unreadable, starting cold");
                    (0, Utc::now())
                }
            };

        info!(
            products = products.len(),
            last_event_offset, "store cache opened"
        );

        Self {
            state: RwLock::new(LocalState {
                products,
                last_event_offset,
                last_sync_time,
            }),
            persist_lock: Mutex::new(()),
            inventory_path,
            metadata_path,
        }
    }

    pub fn get(&self, product_id: &str) -> Option<Product> {
        self.state.read().products.get(product_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().products.is_empty()
    }

    /// Next offset to request from Central; 0 when never synced.
    pub fn last_event_offset(&self) -> u64 {
        self.state.read().last_event_offset
    }

    pub fn last_sync_time(&self) -> DateTime<Utc> {
        self.state.read().last_sync_time
    }

    /// Lexicographic page over the local mirror, mirroring Central's cursor
    /// semantics, with the replication watermark attached.
    pub fn list(&self, cursor: Option<&str>, limit: usize) -> LocalPage {
        let state = self.state.read();

        let mut ids: Vec<&String> = match cursor {
            Some(cursor) => state
                .products
                .keys()
                .filter(|id| id.as_str() > cursor)
                .collect(),
            None => state.products.keys().collect(),
        };
        ids.sort();

        let limit = limit.max(1);
        let has_more = ids.len() > limit;
        ids.truncate(limit);

        let items: Vec<Product> = ids.iter().map(|id| state.products[*id].clone()).collect();
        let next_cursor = if has_more {
            items.last().map(|p| p.product_id.clone())
        } else {
            None
        };

        LocalPage {
            items,
            next_cursor,
            last_event_offset: state.last_event_offset,
            last_sync_time: state.last_sync_time,
        }
    }

    /// Apply one contiguous batch atomically, in offset order, and advance
    /// the watermark to `last_applied + 1`. The caller (replication engine)
    /// has already validated contiguity.
    pub fn apply_events(&self, events: &[Event]) {
        let Some(last) = events.last() else { return };

        {
            let mut state = self.state.write();
            for event in events {
                match event.event_type {
                    EventType::ProductDeleted => {
                        state.products.remove(&event.product_id);
                    }
                    EventType::ProductCreated | EventType::ProductUpdated => {
                        state
                            .products
                            .insert(event.product_id.clone(), event.data.clone());
                    }
                }
            }
            // Snapshot replays can hand us events below the watermark; never
            // move it backwards.
            state.last_event_offset = state.last_event_offset.max(last.offset + 1);
            state.last_sync_time = Utc::now();
        }
        self.persist();
    }

    /// Replace the whole mirror from a Central snapshot taken at `offset`.
    pub fn sync_all(&self, products: HashMap<String, Product>, offset: u64) {
        {
            let mut state = self.state.write();
            state.products = products;
            state.last_event_offset = offset;
            state.last_sync_time = Utc::now();
        }
        self.persist();
        info!(
            products = self.len(),
            offset, "store cache replaced from snapshot"
        );
    }

    /// Write-through after a proxied mutation was applied on Central. The
    /// event will arrive through the feed as well; versions only move
    /// forward, so the earlier writer loses harmlessly.
    pub fn apply_update_result(&self, result: &UpdateResult) {
        let (Some(new_quantity), Some(new_version)) = (result.new_quantity, result.new_version)
        else {
            return;
        };
        let mut state = self.state.write();
        if let Some(product) = state.products.get_mut(&result.product_id) {
            if new_version > product.version {
                product.available = new_quantity;
                product.version = new_version;
                if let Some(ts) = result.last_updated {
                    product.last_updated = ts;
                }
            }
        }
        drop(state);
        self.persist();
    }

    fn persist(&self) {
        let _guard = self.persist_lock.lock();
        let (inventory_doc, metadata_doc) = {
            let state = self.state.read();
            (
                PersistedLocalInventory {
                    products: state.products.clone(),
                },
                PersistedSyncMetadata {
                    last_event_offset: state.last_event_offset,
                    last_sync_time: state.last_sync_time,
                },
            )
        };
        if let Err(e) = persistence::write_json_atomic(&self.inventory_path, &inventory_doc) {
            warn!(path = %self.inventory_path.display(), error = %e, "local inventory persist failed");
        }
        if let Err(e) = persistence::write_json_atomic(&self.metadata_path, &metadata_doc) {
            warn!(path = %self.metadata_path.display(), error = %e, "sync metadata persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, available: u64, version: u64) -> Product {
        Product {
            product_id: id.to_string(),
            name: format!("{id} name"),
            available,
            version,
            price: 1.0,
            last_updated: Utc::now(),
        }
    }

    fn event(offset: u64, event_type: EventType, data: Product) -> Event {
        Event {
            offset,
            timestamp: Utc::now(),
            event_type,
            product_id: data.product_id.clone(),
            version: data.version,
            data,
        }
    }

    #[test]
    fn apply_events_advances_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StoreCache::open(dir.path());
        assert_eq!(cache.last_event_offset(), 0);

        cache.apply_events(&[
            event(0, EventType::ProductCreated, product("SKU-1", 10, 1)),
            event(1, EventType::ProductUpdated, product("SKU-1", 8, 2)),
        ]);

        assert_eq!(cache.last_event_offset(), 2);
        assert_eq!(cache.get("SKU-1").unwrap().available, 8);
    }

    #[test]
    fn delete_event_removes_product() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StoreCache::open(dir.path());
        cache.apply_events(&[
            event(0, EventType::ProductCreated, product("SKU-1", 10, 1)),
            event(1, EventType::ProductDeleted, product("SKU-1", 10, 2)),
        ]);
        assert!(cache.get("SKU-1").is_none());
        assert_eq!(cache.last_event_offset(), 2);
    }

    #[test]
    fn sync_all_replaces_map_and_offset() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StoreCache::open(dir.path());
        cache.apply_events(&[event(0, EventType::ProductCreated, product("OLD", 1, 1))]);

        let mut products = HashMap::new();
        products.insert("SKU-1".to_string(), product("SKU-1", 10, 5));
        cache.sync_all(products, 100);

        assert!(cache.get("OLD").is_none());
        assert_eq!(cache.get("SKU-1").unwrap().version, 5);
        assert_eq!(cache.last_event_offset(), 100);
    }

    #[test]
    fn replayed_events_never_regress_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StoreCache::open(dir.path());
        let mut products = HashMap::new();
        products.insert("SKU-1".to_string(), product("SKU-1", 10, 5));
        cache.sync_all(products, 100);

        // Replay below the snapshot offset.
        cache.apply_events(&[event(99, EventType::ProductUpdated, product("SKU-1", 10, 5))]);
        assert_eq!(cache.last_event_offset(), 100);
    }

    #[test]
    fn write_through_only_moves_versions_forward() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StoreCache::open(dir.path());
        cache.apply_events(&[event(0, EventType::ProductCreated, product("SKU-1", 10, 5))]);

        cache.apply_update_result(&UpdateResult {
            product_id: "SKU-1".into(),
            applied: true,
            new_quantity: Some(8),
            new_version: Some(6),
            last_updated: Some(Utc::now()),
            error_type: None,
            error_message: None,
        });
        assert_eq!(cache.get("SKU-1").unwrap().available, 8);

        // A stale result (version 4) must not clobber version 6.
        cache.apply_update_result(&UpdateResult {
            product_id: "SKU-1".into(),
            applied: true,
            new_quantity: Some(99),
            new_version: Some(4),
            last_updated: Some(Utc::now()),
            error_type: None,
            error_message: None,
        });
        assert_eq!(cache.get("SKU-1").unwrap().available, 8);
        assert_eq!(cache.get("SKU-1").unwrap().version, 6);
    }

    #[test]
    fn persists_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = StoreCache::open(dir.path());
            cache.apply_events(&[event(0, EventType::ProductCreated, product("SKU-1", 10, 1))]);
        }
        let cache = StoreCache::open(dir.path());
        assert_eq!(cache.last_event_offset(), 1);
        assert_eq!(cache.get("SKU-1").unwrap().available, 10);
    }
}
