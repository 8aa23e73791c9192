//! Append-only event log with bounded retention and long-poll wakeup.
//!
//! Offsets are dense and monotonic; truncation drops the oldest quarter once
//! capacity is exceeded, after which those offsets can never be served again
//! and callers must re-bootstrap from a snapshot. The log file is the
//! recovery basis for the whole Central node.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::inventory::persistence;
use crate::models::{Event, EventType, Product};

/// Hard cap on events returned by a single fetch.
pub const MAX_FETCH_LIMIT: usize = 1000;

/// Longest long-poll wait a client may request, in seconds.
pub const MAX_WAIT_SECS: u64 = 60;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedLog {
    events: Vec<Event>,
    next_offset: u64,
}

struct LogState {
    events: Vec<Event>,
    next_offset: u64,
}

struct Waiter {
    from_offset: u64,
    tx: oneshot::Sender<()>,
}

/// A contiguous slice of the feed.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub next_offset: u64,
    pub has_more: bool,
}

/// Fetch failure: the requested offset fell out of retention.
#[derive(Debug, Clone)]
pub struct OffsetGone {
    pub requested: u64,
    pub oldest_retained: u64,
}

impl std::fmt::Display for OffsetGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "offset {} is gone (oldest retained: {})",
            self.requested, self.oldest_retained
        )
    }
}

impl std::error::Error for OffsetGone {}

#[derive(Debug, Default)]
pub struct EventLogStats {
    pub appends: AtomicU64,
    pub truncated: AtomicU64,
    pub persist_failures: AtomicU64,
    pub waiters_fired: AtomicU64,
}

/// The monotonic event stream.
pub struct EventLog {
    state: RwLock<LogState>,
    waiters: Mutex<Vec<Waiter>>,
    // Serializes snapshot writes so a slow earlier write can never clobber a
    // newer one; each persist re-reads the latest state under this lock.
    persist_lock: Mutex<()>,
    path: PathBuf,
    max_events: usize,
    pub stats: EventLogStats,
}

impl EventLog {
    /// Restore the log from `path`, or start empty when the file is missing
    /// or unreadable. An empty start means offset assignment restarts at 0
    /// and the inventory store must reset its metadata to agree.
    pub fn open(path: PathBuf, max_events: usize) -> Self {
        let state = match persistence::load_json::<PersistedLog>(&path) {
            Ok(Some(persisted)) => {
                info!(
                    events = persisted.events.len(),
                    next_offset = persisted.next_offset,
                    path = %path.display(),
                    "event log restored"
                );
                LogState {
                    events: persisted.events,
                    next_offset: persisted.next_offset,
                }
            }
            Ok(None) => {
                info!(path = %path.display(), "no event log file, starting empty");
                LogState {
                    events: Vec::new(),
                    next_offset: 0,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "event log unreadable, starting empty");
                LogState {
                    events: Vec::new(),
                    next_offset: 0,
                }
            }
        };

        Self {
            state: RwLock::new(state),
            waiters: Mutex::new(Vec::new()),
            persist_lock: Mutex::new(()),
            path,
            max_events,
            stats: EventLogStats::default(),
        }
    }

    /// Offset the next append will receive.
    pub fn next_offset(&self) -> u64 {
        self.state.read().next_offset
    }

    pub fn retained(&self) -> usize {
        self.state.read().events.len()
    }

    /// Oldest offset still served; equals `next_offset` when the log is empty.
    pub fn oldest_retained(&self) -> u64 {
        let st = self.state.read();
        st.next_offset - st.events.len() as u64
    }

    /// Append one event and return its offset.
    ///
    /// `data` is the full post-change product state; `version` must be the
    /// product's version after the change (predecessor + 1 for deletions).
    pub fn append(
        &self,
        event_type: EventType,
        product_id: &str,
        data: Product,
        version: u64,
    ) -> u64 {
        let offset = {
            let mut st = self.state.write();
            let offset = st.next_offset;
            st.next_offset += 1;
            st.events.push(Event {
                offset,
                timestamp: Utc::now(),
                event_type,
                product_id: product_id.to_string(),
                version,
                data,
            });

            if st.events.len() > self.max_events {
                let keep = (self.max_events * 3) / 4;
                let drop_n = st.events.len() - keep;
                st.events.drain(..drop_n);
                self.stats.truncated.fetch_add(drop_n as u64, Ordering::Relaxed);
                debug!(dropped = drop_n, retained = keep, "event log truncated");
            }
            offset
        };

        self.stats.appends.fetch_add(1, Ordering::Relaxed);
        self.notify_waiters(offset);
        self.persist();
        offset
    }

    /// Return up to `limit` contiguous events with offset ≥ `from_offset`.
    ///
    /// `from_offset == next_offset` yields an empty batch with
    /// `has_more = false`; an offset below retention yields `OffsetGone`.
    pub fn fetch(&self, from_offset: u64, limit: usize) -> Result<EventBatch, OffsetGone> {
        let limit = limit.clamp(1, MAX_FETCH_LIMIT);
        let st = self.state.read();
        let oldest = st.next_offset - st.events.len() as u64;

        if from_offset >= st.next_offset {
            return Ok(EventBatch {
                events: Vec::new(),
                next_offset: st.next_offset,
                has_more: false,
            });
        }
        if from_offset < oldest {
            return Err(OffsetGone {
                requested: from_offset,
                oldest_retained: oldest,
            });
        }

        let start = (from_offset - oldest) as usize;
        let end = (start + limit).min(st.events.len());
        let events = st.events[start..end].to_vec();
        let next_offset = from_offset + events.len() as u64;
        Ok(EventBatch {
            events,
            next_offset,
            has_more: next_offset < st.next_offset,
        })
    }

    /// Suspend until an event with offset ≥ `from_offset` exists or `timeout`
    /// elapses. Returns `true` when data is available.
    pub async fn wait_for(&self, from_offset: u64, timeout: Duration) -> bool {
        if self.state.read().next_offset > from_offset {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(Waiter { from_offset, tx });

        // An append may have slipped in between the check and registration;
        // re-check so that waiter registration cannot miss its wakeup.
        if self.state.read().next_offset > from_offset {
            return true;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                // Timed out (receiver dropped): clear our dead entry.
                self.waiters.lock().retain(|w| !w.tx.is_closed());
                false
            }
        }
    }

    fn notify_waiters(&self, appended_offset: u64) {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if waiter.from_offset <= appended_offset {
                if waiter.tx.send(()).is_ok() {
                    self.stats.waiters_fired.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                remaining.push(waiter);
            }
        }
        *waiters = remaining;
    }

    /// Best-effort snapshot of `{events, nextOffset}` to disk. Failures are
    /// logged and never propagate; the in-memory log remains authoritative
    /// for the life of the process.
    fn persist(&self) {
        let _guard = self.persist_lock.lock();
        let doc = {
            let st = self.state.read();
            PersistedLog {
                events: st.events.clone(),
                next_offset: st.next_offset,
            }
        };
        if let Err(e) = persistence::write_json_atomic(&self.path, &doc) {
            self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(path = %self.path.display(), error = %e, "event log persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn product(id: &str, version: u64) -> Product {
        Product {
            product_id: id.to_string(),
            name: format!("{id} name"),
            available: 10,
            version,
            price: 9.99,
            last_updated: Utc::now(),
        }
    }

    fn temp_log(max_events: usize) -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("events.json"), max_events);
        (dir, log)
    }

    #[test]
    fn append_assigns_dense_offsets() {
        let (_dir, log) = temp_log(100);
        for i in 0..5 {
            let offset = log.append(EventType::ProductUpdated, "SKU-1", product("SKU-1", i + 1), i + 1);
            assert_eq!(offset, i);
        }
        assert_eq!(log.next_offset(), 5);

        let batch = log.fetch(0, 10).unwrap();
        assert_eq!(batch.events.len(), 5);
        for pair in batch.events.windows(2) {
            assert_eq!(pair[0].offset + 1, pair[1].offset);
        }
        assert!(!batch.has_more);
    }

    #[test]
    fn fetch_at_next_offset_is_empty() {
        let (_dir, log) = temp_log(100);
        log.append(EventType::ProductCreated, "SKU-1", product("SKU-1", 1), 1);
        let batch = log.fetch(1, 10).unwrap();
        assert!(batch.events.is_empty());
        assert!(!batch.has_more);
        assert_eq!(batch.next_offset, 1);
    }

    #[test]
    fn fetch_respects_limit_and_has_more() {
        let (_dir, log) = temp_log(100);
        for i in 0..10 {
            log.append(EventType::ProductUpdated, "SKU-1", product("SKU-1", i), i);
        }
        let batch = log.fetch(0, 4).unwrap();
        assert_eq!(batch.events.len(), 4);
        assert_eq!(batch.next_offset, 4);
        assert!(batch.has_more);
    }

    #[test]
    fn truncation_drops_oldest_quarter_and_reports_gone() {
        let (_dir, log) = temp_log(8);
        for i in 0..9 {
            log.append(EventType::ProductUpdated, "SKU-1", product("SKU-1", i), i);
        }
        // Capacity 8 exceeded at the 9th append: keep 6, drop oldest 3.
        assert_eq!(log.retained(), 6);
        assert_eq!(log.oldest_retained(), 3);

        let err = log.fetch(0, 10).unwrap_err();
        assert_eq!(err.oldest_retained, 3);

        let batch = log.fetch(3, 10).unwrap();
        assert_eq!(batch.events.first().unwrap().offset, 3);
        assert_eq!(batch.events.len(), 6);
    }

    #[test]
    fn restores_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        {
            let log = EventLog::open(path.clone(), 100);
            log.append(EventType::ProductCreated, "SKU-1", product("SKU-1", 1), 1);
            log.append(EventType::ProductUpdated, "SKU-1", product("SKU-1", 2), 2);
        }
        let log = EventLog::open(path, 100);
        assert_eq!(log.next_offset(), 2);
        assert_eq!(log.retained(), 2);
        let batch = log.fetch(1, 10).unwrap();
        assert_eq!(batch.events[0].version, 2);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_data_exists() {
        let (_dir, log) = temp_log(100);
        log.append(EventType::ProductCreated, "SKU-1", product("SKU-1", 1), 1);
        assert!(log.wait_for(0, Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn wait_times_out_without_events() {
        let (_dir, log) = temp_log(100);
        let woke = log.wait_for(0, Duration::from_millis(20)).await;
        assert!(!woke);
    }

    #[tokio::test]
    async fn append_wakes_waiter() {
        let (_dir, log) = temp_log(100);
        let log = Arc::new(log);

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for(0, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(EventType::ProductCreated, "SKU-1", product("SKU-1", 1), 1);

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn waiter_ahead_of_append_stays_parked() {
        let (_dir, log) = temp_log(100);
        let log = Arc::new(log);

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for(5, Duration::from_millis(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Offset 0 < awaited 5: must not wake.
        log.append(EventType::ProductCreated, "SKU-1", product("SKU-1", 1), 1);

        let woke = waiter.await.unwrap();
        assert!(!woke);
    }
}
