//! Per-product lock manager.
//!
//! One read/write lock per product id, lazily allocated on first use. A
//! global mutex would serialize every mutation; per-id locks let the worker
//! pool scale with SKU diversity while still linearizing writes to the same
//! product.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

/// Lazily allocated per-key lock table.
///
/// `acquire` hands out the `Arc<RwLock<()>>` cell for an id; callers take
/// `.read()` / `.write()` on it and the guard releases on drop. The cell must
/// not be held across file I/O.
pub struct KeyedLocks {
    inner: RwLock<HashMap<String, Arc<RwLock<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch (or create) the lock cell for `id`.
    ///
    /// Double-checked: the common case is a read-lock lookup; only a miss
    /// takes the outer write lock, and re-checks so two racing callers don't
    /// each install a different cell.
    pub fn acquire(&self, id: &str) -> Arc<RwLock<()>> {
        if let Some(cell) = self.inner.read().get(id) {
            return cell.clone();
        }

        let mut table = self.inner.write();
        table
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop lock cells for ids no longer active, keeping any cell that is
    /// still checked out elsewhere. Must not be called while holding one of
    /// the per-id locks.
    pub fn reap(&self, active_ids: &HashSet<String>) -> usize {
        let mut table = self.inner.write();
        let before = table.len();
        table.retain(|id, cell| active_ids.contains(id) || Arc::strong_count(cell) > 1);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}
