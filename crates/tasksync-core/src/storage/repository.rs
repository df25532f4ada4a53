//! Local store contract used by the sync engine and front ends.
//!
//! Every local mutation writes the entity and its ledger entry atomically.
//! Sync-support methods are only called by the engine and never enqueue.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::{
    ChangePayload, EntityKind, NewTask, PendingChange, RemoteTask, RemoteTaskList, TaskItem,
    TaskList, TaskPatch,
};
use crate::sync::conflict_resolver::Resolution;

/// Maximum number of hits returned by [`TaskRepository::search_tasks`].
pub const SEARCH_LIMIT: usize = 50;

/// Criteria for [`TaskRepository::tasks_by_filter`]. All set criteria must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Local id of the list to restrict to.
    pub list_id: Option<String>,
    pub completed: Option<bool>,
    /// Due at or after this instant.
    pub due_after: Option<DateTime<Utc>>,
    /// Due strictly before this instant.
    pub due_before: Option<DateTime<Utc>>,
    /// Due within the current local calendar day.
    pub today_only: bool,
    /// Due before the start of the current local day.
    pub overdue_only: bool,
    pub no_due_date: bool,
}

impl TaskFilter {
    /// Whether `task` passes the filter. `today_start` is the start of the
    /// current local day expressed in UTC.
    pub fn matches(&self, task: &TaskItem, today_start: DateTime<Utc>) -> bool {
        if task.deleted || task.hidden {
            return false;
        }
        if let Some(list_id) = &self.list_id {
            if &task.list_id != list_id {
                return false;
            }
        }
        if let Some(completed) = self.completed {
            if task.is_completed() != completed {
                return false;
            }
        }
        if self.today_only {
            let tomorrow = today_start + Duration::days(1);
            if !task.due.is_some_and(|d| d >= today_start && d < tomorrow) {
                return false;
            }
        }
        if self.overdue_only && !task.due.is_some_and(|d| d < today_start) {
            return false;
        }
        if self.no_due_date && task.due.is_some() {
            return false;
        }
        if let Some(after) = self.due_after {
            if !task.due.is_some_and(|d| d >= after) {
                return false;
            }
        }
        if let Some(before) = self.due_before {
            if !task.due.is_some_and(|d| d < before) {
                return false;
            }
        }

        // Date windows hide finished work unless completion or overdue was asked for.
        let date_window = self.due_after.is_some() || self.due_before.is_some();
        if date_window && self.completed.is_none() && !self.overdue_only && task.is_completed() {
            return false;
        }
        true
    }

    /// Apply the filter and order by due date (undated first), then position.
    pub fn apply(&self, tasks: Vec<TaskItem>, today_start: DateTime<Utc>) -> Vec<TaskItem> {
        let mut out: Vec<TaskItem> = tasks
            .into_iter()
            .filter(|t| self.matches(t, today_start))
            .collect();
        out.sort_by(|a, b| a.due.cmp(&b.due).then_with(|| a.position.cmp(&b.position)));
        out
    }
}

/// Start of the current local calendar day, in UTC.
pub fn local_today_start() -> DateTime<Utc> {
    let now = Local::now();
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc))
}

/// What an upsert-from-remote did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub resolution: Resolution,
    /// The local entity had unacknowledged edits when the remote version arrived.
    pub conflict: bool,
}

/// Local id plus outcome, returned by list upserts so tasks can be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListUpsert {
    pub local_id: String,
    pub outcome: UpsertOutcome,
}

/// Which entities a pull observed completely.
///
/// Tasks are only reconciled when the pull fetched every task of each list;
/// a filtered pull leaves unseen tasks in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanScope {
    ListsAndTasks,
    ListsOnly,
}

/// Entities removed by orphan reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub lists_removed: usize,
    pub tasks_removed: usize,
}

/// Durable local store of lists, tasks and the pending-change ledger.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    // Queries. Entities pending deletion are hidden.

    /// All lists ordered by title.
    async fn task_lists(&self) -> Result<Vec<TaskList>, SyncError>;
    async fn task_list(&self, local_id: &str) -> Result<Option<TaskList>, SyncError>;
    /// Visible tasks of a list ordered by position.
    async fn tasks(&self, list_id: &str) -> Result<Vec<TaskItem>, SyncError>;
    /// Any task by id, including deleted or hidden ones.
    async fn task(&self, local_id: &str) -> Result<Option<TaskItem>, SyncError>;
    /// Case-insensitive match on title or notes, newest first.
    async fn search_tasks(&self, query: &str) -> Result<Vec<TaskItem>, SyncError>;
    async fn tasks_by_filter(&self, filter: &TaskFilter) -> Result<Vec<TaskItem>, SyncError>;

    // Local mutations. Each one enqueues its ledger entry in the same transaction.

    async fn create_task_list(&self, title: &str) -> Result<TaskList, SyncError>;
    async fn rename_task_list(&self, local_id: &str, title: &str) -> Result<TaskList, SyncError>;
    async fn delete_task_list(&self, local_id: &str) -> Result<(), SyncError>;
    async fn create_task(&self, list_id: &str, task: NewTask) -> Result<TaskItem, SyncError>;
    async fn update_task(&self, local_id: &str, patch: TaskPatch) -> Result<TaskItem, SyncError>;
    async fn delete_task(&self, local_id: &str) -> Result<(), SyncError>;
    async fn move_task(
        &self,
        local_id: &str,
        parent_id: Option<&str>,
        previous_id: Option<&str>,
    ) -> Result<TaskItem, SyncError>;

    // Ledger.

    /// Append an entry for an existing entity. Returns the new entry id.
    async fn enqueue_change(
        &self,
        entity_id: &str,
        payload: ChangePayload,
    ) -> Result<i64, SyncError>;
    /// Entries ordered by creation time, ties broken by id.
    async fn pending_changes(&self) -> Result<Vec<PendingChange>, SyncError>;
    async fn pending_change_count(&self) -> Result<usize, SyncError>;
    /// Acknowledge an entry; the entity's state follows what is still queued.
    async fn remove_pending_change(&self, id: i64) -> Result<(), SyncError>;
    /// Record a failed replay. Returns the updated attempt count.
    async fn record_change_failure(&self, id: i64, error: &str) -> Result<u32, SyncError>;
    /// Re-arm an entry for replay and leave the conflict state.
    async fn reset_change_attempts(&self, id: i64) -> Result<(), SyncError>;

    // Sync support.

    /// Remote id of an entity. `NotFound` if the entity does not exist.
    async fn remote_id(&self, kind: EntityKind, local_id: &str)
        -> Result<Option<String>, SyncError>;
    /// Bind the remote id after a successful create. Binding is set-once.
    async fn update_remote_id(
        &self,
        kind: EntityKind,
        local_id: &str,
        remote_id: &str,
    ) -> Result<(), SyncError>;
    /// Drop an entity (and its descendants) after its remote delete was acknowledged.
    async fn remove_entity(&self, kind: EntityKind, local_id: &str) -> Result<(), SyncError>;
    async fn mark_conflict(&self, kind: EntityKind, local_id: &str) -> Result<(), SyncError>;
    async fn upsert_task_list_from_remote(
        &self,
        remote: &RemoteTaskList,
    ) -> Result<ListUpsert, SyncError>;
    async fn upsert_task_from_remote(
        &self,
        list_id: &str,
        remote: &RemoteTask,
    ) -> Result<UpsertOutcome, SyncError>;
    /// Remove bound entities that were not observed in a complete pull.
    async fn mark_orphans(
        &self,
        observed: &HashSet<String>,
        scope: OrphanScope,
    ) -> Result<OrphanReport, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SyncState, TaskStatus};

    fn task(id: &str, due: Option<DateTime<Utc>>, position: &str) -> TaskItem {
        let now = Utc::now();
        TaskItem {
            local_id: id.into(),
            remote_id: None,
            list_id: "inbox".into(),
            parent_id: None,
            title: id.into(),
            notes: String::new(),
            status: TaskStatus::NeedsAction,
            due,
            completed_at: None,
            position: position.into(),
            deleted: false,
            hidden: false,
            links: Vec::new(),
            created_at: now,
            updated_at: now,
            sync_state: SyncState::Synced,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn today_and_overdue_windows() {
        let today = at(2024, 3, 10, 0);
        let tasks = vec![
            task("yesterday", Some(at(2024, 3, 9, 12)), "1"),
            task("today", Some(at(2024, 3, 10, 9)), "2"),
            task("tomorrow", Some(at(2024, 3, 11, 0)), "3"),
            task("undated", None, "4"),
        ];

        let today_only = TaskFilter {
            today_only: true,
            ..Default::default()
        };
        let ids: Vec<_> = today_only
            .apply(tasks.clone(), today)
            .into_iter()
            .map(|t| t.local_id)
            .collect();
        assert_eq!(ids, ["today"]);

        let overdue = TaskFilter {
            overdue_only: true,
            ..Default::default()
        };
        let ids: Vec<_> = overdue
            .apply(tasks.clone(), today)
            .into_iter()
            .map(|t| t.local_id)
            .collect();
        assert_eq!(ids, ["yesterday"]);

        let undated = TaskFilter {
            no_due_date: true,
            ..Default::default()
        };
        assert_eq!(undated.apply(tasks, today).len(), 1);
    }

    #[test]
    fn date_window_hides_completed_unless_asked() {
        let today = at(2024, 3, 10, 0);
        let mut done = task("done", Some(at(2024, 3, 12, 0)), "1");
        done.status = TaskStatus::Completed;
        let open = task("open", Some(at(2024, 3, 12, 0)), "2");
        let tasks = vec![done, open];

        let window = TaskFilter {
            due_after: Some(at(2024, 3, 11, 0)),
            ..Default::default()
        };
        let ids: Vec<_> = window
            .apply(tasks.clone(), today)
            .into_iter()
            .map(|t| t.local_id)
            .collect();
        assert_eq!(ids, ["open"]);

        let window_completed = TaskFilter {
            completed: Some(true),
            ..window
        };
        let ids: Vec<_> = window_completed
            .apply(tasks, today)
            .into_iter()
            .map(|t| t.local_id)
            .collect();
        assert_eq!(ids, ["done"]);
    }

    #[test]
    fn ordering_is_due_then_position() {
        let today = at(2024, 3, 10, 0);
        let tasks = vec![
            task("c", Some(at(2024, 3, 12, 0)), "00002"),
            task("b", Some(at(2024, 3, 12, 0)), "00001"),
            task("a", None, "00009"),
        ];
        let ids: Vec<_> = TaskFilter::default()
            .apply(tasks, today)
            .into_iter()
            .map(|t| t.local_id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn hidden_and_deleted_never_match() {
        let today = at(2024, 3, 10, 0);
        let mut hidden = task("hidden", None, "1");
        hidden.hidden = true;
        let mut deleted = task("deleted", None, "2");
        deleted.deleted = true;
        assert!(TaskFilter::default().apply(vec![hidden, deleted], today).is_empty());
    }
}
