use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SyncState;

/// A named collection of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    /// Assigned at local creation, never reassigned.
    pub local_id: String,
    /// Set once, after the first successful remote create.
    pub remote_id: Option<String>,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub sync_state: SyncState,
}

impl TaskList {
    pub fn is_remote(&self) -> bool {
        self.remote_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}
