//! Idempotency cache with TTL expiry.
//!
//! Makes the mutation API safe to retry: the same idempotency key presented
//! within the TTL yields the original outcome without re-applying anything.
//! Both successes and typed failures are cached: a retried conflicting
//! update returns the same conflict without re-checking state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// TTL-indexed key → outcome store.
///
/// Ages are monotonic (`Instant`), so wall-clock jumps cannot expire or
/// resurrect entries. Reads do not extend the TTL.
pub struct IdempotencyCache<V> {
    entries: RwLock<HashMap<String, CachedEntry<V>>>,
    ttl: Duration,
}

impl<V: Clone> IdempotencyCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a cached outcome. Entries past the TTL are treated as absent
    /// even if the sweeper has not removed them yet.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.entries.write().insert(
            key.into(),
            CachedEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove expired entries; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V: Clone + Send + Sync + 'static> IdempotencyCache<V> {
    /// Spawn the background sweeper. The task runs for the life of the
    /// process; it holds only a weak-ish shared handle via `Arc`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "idempotency sweep");
                }
            }
        })
    }
}
