//! Result and status types for sync cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::OrphanScope;

/// Message returned when a cycle is requested while another is running.
pub const SYNC_IN_PROGRESS: &str = "sync already in progress";

/// Outcome of a push, a pull, or a whole cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub items_pushed: usize,
    pub items_pulled: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
}

impl SyncResult {
    /// A failed result carrying a single error message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![message.into()],
            ..Default::default()
        }
    }

    /// Combine push and pull results into a cycle result.
    pub fn combine(push: SyncResult, pull: SyncResult) -> Self {
        let mut errors = push.errors;
        errors.extend(pull.errors);
        Self {
            success: push.success && pull.success,
            items_pushed: push.items_pushed,
            items_pulled: pull.items_pulled,
            conflicts: push.conflicts + pull.conflicts,
            errors,
        }
    }

    /// Mark success from the accumulated error list.
    pub(crate) fn finish(mut self) -> Self {
        self.success = self.errors.is_empty();
        self
    }
}

/// Progress notification published on every phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusEvent {
    pub is_syncing: bool,
    pub message: String,
    /// 0-100
    pub progress: u8,
}

/// Current sync status snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Last completed cycle.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Number of ledger entries waiting to be pushed.
    pub pending_count: usize,
    /// Whether a cycle is currently running.
    pub in_progress: bool,
}

/// Tunables for the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Entries that failed this many times are no longer replayed and their
    /// entity moves to the conflict state.
    pub max_attempts: u32,
    pub include_completed: bool,
    pub include_hidden: bool,
}

impl SyncOptions {
    /// Orphan reconciliation a pull with these options supports.
    pub fn orphan_scope(&self) -> OrphanScope {
        if self.include_completed && self.include_hidden {
            OrphanScope::ListsAndTasks
        } else {
            OrphanScope::ListsOnly
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            include_completed: true,
            include_hidden: true,
        }
    }
}
