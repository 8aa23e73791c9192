//! StockSync Backend Library
//!
//! Exposes the consistency engine and both HTTP tiers for use by the
//! `central` and `store-node` binaries and the integration tests.

pub mod api;
pub mod inventory;
pub mod middleware;
pub mod models;
pub mod store;

// Re-export the engine types most callers reach for.
pub use api::CentralState;
pub use inventory::{
    DispatcherConfig, EventLog, IdempotencyCache, InventoryStore, UpdateDispatcher, UpdateOutcome,
};
pub use store::{CentralFeed, ReplicationEngine, StoreCache, SyncPhase};
