//! Ledger entries: local mutations waiting for remote acknowledgement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task_item::TaskFields;

/// Kind of entity a change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    TaskList,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::TaskList => "TaskList",
            EntityKind::Task => "Task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TaskList" => Some(EntityKind::TaskList),
            "Task" => Some(EntityKind::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
    Move,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "Create",
            ChangeOperation::Update => "Update",
            ChangeOperation::Delete => "Delete",
            ChangeOperation::Move => "Move",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(ChangeOperation::Create),
            "Update" => Some(ChangeOperation::Update),
            "Delete" => Some(ChangeOperation::Delete),
            "Move" => Some(ChangeOperation::Move),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an entity at enqueue time, one variant per (kind, operation).
///
/// Ids stored here are local ids; they are resolved to remote ids when the
/// change is replayed, so a child enqueued before its parent was pushed still
/// finds the parent's remote id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangePayload {
    CreateList {
        title: String,
    },
    UpdateList {
        title: String,
    },
    DeleteList,
    CreateTask {
        list_id: String,
        parent_id: Option<String>,
        previous_id: Option<String>,
        fields: TaskFields,
    },
    UpdateTask {
        list_id: String,
        fields: TaskFields,
    },
    DeleteTask {
        list_id: String,
    },
    MoveTask {
        list_id: String,
        parent_id: Option<String>,
        previous_id: Option<String>,
    },
}

impl ChangePayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            ChangePayload::CreateList { .. }
            | ChangePayload::UpdateList { .. }
            | ChangePayload::DeleteList => EntityKind::TaskList,
            ChangePayload::CreateTask { .. }
            | ChangePayload::UpdateTask { .. }
            | ChangePayload::DeleteTask { .. }
            | ChangePayload::MoveTask { .. } => EntityKind::Task,
        }
    }

    pub fn operation(&self) -> ChangeOperation {
        match self {
            ChangePayload::CreateList { .. } | ChangePayload::CreateTask { .. } => {
                ChangeOperation::Create
            }
            ChangePayload::UpdateList { .. } | ChangePayload::UpdateTask { .. } => {
                ChangeOperation::Update
            }
            ChangePayload::DeleteList | ChangePayload::DeleteTask { .. } => ChangeOperation::Delete,
            ChangePayload::MoveTask { .. } => ChangeOperation::Move,
        }
    }
}

/// A durable, not-yet-acknowledged local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Ledger-assigned, monotonic.
    pub id: i64,
    /// Local id of the entity.
    pub entity_id: String,
    pub payload: ChangePayload,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingChange {
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    pub fn operation(&self) -> ChangeOperation {
        self.payload.operation()
    }

    /// One-line description used in sync error reports.
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.operation(), self.kind(), self.entity_id)
    }
}
