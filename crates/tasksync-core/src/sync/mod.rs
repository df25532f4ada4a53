//! Offline-first synchronization with the remote task service.
//!
//! Local mutations are recorded in the pending-change ledger by the store.
//! [`SyncEngine`] replays that ledger, pulls remote state with last-write-wins
//! merging and removes entities deleted remotely. [`BackgroundSync`] runs
//! cycles on an interval.

pub mod cancel;
pub mod conflict_resolver;
pub mod scheduler;
pub mod state;
pub mod sync_engine;
pub mod types;


pub use cancel::{CancelSource, CancelToken};
pub use conflict_resolver::{LocalVersion, Resolution};
pub use scheduler::BackgroundSync;
pub use sync_engine::SyncEngine;
pub use types::{SyncOptions, SyncResult, SyncStatus, SyncStatusEvent, SYNC_IN_PROGRESS};
