//! Central-side consistency engine.
//!
//! A mutation enters the dispatcher queue, a worker checks the idempotency
//! cache, takes the per-product write lock, runs the OCC check-and-apply,
//! appends the event, and persists the snapshot. The event log doubles as
//! the long-poll feed the Store tier converges from.

pub mod dispatcher;
pub mod event_log;
pub mod idempotency;
pub mod locks;
pub mod persistence;
pub mod store;

pub use dispatcher::{DispatcherConfig, UpdateDispatcher, UpdateRequest};
pub use event_log::{EventBatch, EventLog, OffsetGone};
pub use idempotency::IdempotencyCache;
pub use locks::KeyedLocks;
pub use store::{
    AdminError, AppliedUpdate, InventoryStore, NewProduct, ProductPatch, UpdateError,
    UpdateOutcome,
};
