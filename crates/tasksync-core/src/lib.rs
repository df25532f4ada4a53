//! # tasksync core library
//!
//! Offline-first task lists synchronized with a remote task service. Every
//! operation is available through the `tasksync` CLI binary, which is a thin
//! layer over this crate.
//!
//! ## Architecture
//!
//! - **Storage**: SQLite store for lists, tasks and the pending-change ledger,
//!   plus TOML configuration
//! - **Remote**: the remote task service contract, a Google Tasks REST client
//!   and an in-memory implementation
//! - **Sync**: push/pull orchestration with last-write-wins merging, orphan
//!   reconciliation and an interval scheduler
//! - **Auth**: OAuth tokens kept in the OS keyring
//!
//! ## Key Components
//!
//! - [`TaskDb`]: Local store and change ledger
//! - [`SyncEngine`]: One sync cycle at a time, with status events
//! - [`BackgroundSync`]: Periodic sync
//! - [`GoogleTasksClient`]: Remote service over HTTP

pub mod auth;
pub mod error;
pub mod model;
pub mod remote;
pub mod storage;
pub mod sync;

pub use auth::{AuthProvider, KeyringTokenProvider, OAuthTokens, StaticTokenProvider};
pub use error::{AuthError, ConfigError, CoreError, DatabaseError, SyncError, ValidationError};
pub use model::{
    ChangeOperation, ChangePayload, EntityKind, NewTask, PendingChange, RemoteTask,
    RemoteTaskList, SyncState, TaskFields, TaskItem, TaskList, TaskPatch, TaskStatus,
};
pub use remote::{GoogleTasksClient, InMemoryRemote, RemoteTaskService};
pub use storage::{Config, TaskDb, TaskFilter, TaskRepository};
pub use sync::{
    BackgroundSync, CancelSource, CancelToken, SyncEngine, SyncOptions, SyncResult, SyncStatus,
    SyncStatusEvent,
};
