//! Store node tier: warm local mirror + replication from Central.
//!
//! Reads are served from the cache without touching Central; mutations are
//! proxied with store-namespaced idempotency keys; the replication engine
//! converges the mirror via the event feed with snapshot fallback.

pub mod api;
pub mod cache;
pub mod central_client;
pub mod replication;

pub use api::StoreState;
pub use cache::StoreCache;
pub use central_client::{CentralClient, CentralFeed, FeedError};
pub use replication::{ReplicationConfig, ReplicationEngine, SyncPhase};
