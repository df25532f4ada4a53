//! Remote snapshots as seen by the sync engine, already mapped from the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task_item::{TaskLink, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTaskList {
    pub remote_id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub remote_id: String,
    pub parent_remote_id: Option<String>,
    pub title: String,
    pub notes: String,
    pub status: TaskStatus,
    pub due: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub position: String,
    pub deleted: bool,
    pub hidden: bool,
    pub links: Vec<TaskLink>,
    pub updated_at: DateTime<Utc>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Absent on the last page.
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}
