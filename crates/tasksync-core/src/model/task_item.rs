//! Task items and their writable field sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SyncState;

/// Completion status, mirroring the remote `needsAction` / `completed` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    NeedsAction,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NeedsAction => "needsAction",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => TaskStatus::Completed,
            _ => TaskStatus::NeedsAction,
        }
    }
}

/// A link attached to a task (e.g. an email thread).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLink {
    pub link_type: String,
    pub description: String,
    pub url: String,
}

/// A to-do item. Items form a tree through `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub local_id: String,
    pub remote_id: Option<String>,
    /// Local id of the owning list.
    pub list_id: String,
    /// Local id of the parent task.
    pub parent_id: Option<String>,
    pub title: String,
    pub notes: String,
    pub status: TaskStatus,
    pub due: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Lexicographic ordering key among siblings.
    pub position: String,
    pub deleted: bool,
    pub hidden: bool,
    pub links: Vec<TaskLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_state: SyncState,
}

impl TaskItem {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due.is_some_and(|due| due < now) && !self.is_completed()
    }

    /// The writable snapshot sent to the remote service.
    pub fn fields(&self) -> TaskFields {
        TaskFields {
            title: self.title.clone(),
            notes: self.notes.clone(),
            status: self.status,
            due: self.due,
            completed_at: self.completed_at,
        }
    }
}

/// Fields a client may write on create or update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskFields {
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for a locally created task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub notes: String,
    pub due: Option<DateTime<Utc>>,
    /// Local id of the parent task.
    pub parent_id: Option<String>,
    /// Local id of the sibling this task goes after.
    pub previous_id: Option<String>,
}

/// A partial edit; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the due date.
    pub due: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.notes.is_none() && self.status.is_none() && self.due.is_none()
    }

    /// Apply onto `fields`, keeping `completed_at` consistent with the status.
    pub fn apply(&self, fields: &mut TaskFields, now: DateTime<Utc>) {
        if let Some(title) = &self.title {
            fields.title = title.clone();
        }
        if let Some(notes) = &self.notes {
            fields.notes = notes.clone();
        }
        if let Some(due) = self.due {
            fields.due = due;
        }
        if let Some(status) = self.status {
            if status != fields.status {
                fields.completed_at = match status {
                    TaskStatus::Completed => Some(now),
                    TaskStatus::NeedsAction => None,
                };
            }
            fields.status = status;
        }
    }
}
