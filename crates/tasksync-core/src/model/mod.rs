//! Domain types shared by the store, the remote client and the sync engine.

pub mod change;
pub mod remote;
pub mod task_item;
pub mod task_list;

pub use change::{ChangeOperation, ChangePayload, EntityKind, PendingChange};
pub use remote::{Page, RemoteTask, RemoteTaskList};
pub use task_item::{NewTask, TaskFields, TaskItem, TaskLink, TaskPatch, TaskStatus};
pub use task_list::TaskList;

use serde::{Deserialize, Serialize};

/// Per-entity synchronization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    /// Needs manual resolution (an entry exhausted its push attempts).
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::PendingCreate => "pending_create",
            SyncState::PendingUpdate => "pending_update",
            SyncState::PendingDelete => "pending_delete",
            SyncState::Conflict => "conflict",
        }
    }

    /// Parse the database representation; unknown values read as `Synced`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending_create" => SyncState::PendingCreate,
            "pending_update" => SyncState::PendingUpdate,
            "pending_delete" => SyncState::PendingDelete,
            "conflict" => SyncState::Conflict,
            _ => SyncState::Synced,
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, SyncState::Synced)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
