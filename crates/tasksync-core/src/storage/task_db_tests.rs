//! Tests for task_db module.

#[cfg(test)]
mod tests {
    use super::super::task_db::*;
    use crate::error::{SyncError, ValidationError};
    use crate::model::{
        ChangeOperation, ChangePayload, EntityKind, NewTask, RemoteTask, RemoteTaskList,
        SyncState, TaskLink, TaskPatch, TaskStatus,
    };
    use crate::storage::repository::{OrphanScope, TaskFilter};
    use crate::sync::conflict_resolver::Resolution;
    use chrono::{Duration, Utc};
    use std::collections::HashSet;

    fn db() -> TaskDb {
        TaskDb::open_in_memory().unwrap()
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.into(),
            ..Default::default()
        }
    }

    fn remote_list(id: &str, title: &str, age_secs: i64) -> RemoteTaskList {
        RemoteTaskList {
            remote_id: id.into(),
            title: title.into(),
            updated_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn remote_task(id: &str, title: &str, age_secs: i64) -> RemoteTask {
        RemoteTask {
            remote_id: id.into(),
            parent_remote_id: None,
            title: title.into(),
            notes: String::new(),
            status: TaskStatus::NeedsAction,
            due: None,
            completed_at: None,
            position: "00000000000000000001".into(),
            deleted: false,
            hidden: false,
            links: Vec::new(),
            updated_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    /// A list bound to `remote_id` with an empty ledger.
    fn synced_list(db: &TaskDb, remote_id: &str) -> String {
        db.merge_remote_list(&remote_list(remote_id, "Inbox", 60))
            .unwrap()
            .local_id
    }

    #[test]
    fn create_list_enqueues_create() {
        let db = db();
        let list = db.insert_task_list("Groceries").unwrap();
        assert_eq!(list.sync_state, SyncState::PendingCreate);
        assert!(list.remote_id.is_none());

        let changes = db.list_pending_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entity_id, list.local_id);
        assert_eq!(
            changes[0].payload,
            ChangePayload::CreateList {
                title: "Groceries".into()
            }
        );
        assert_eq!(changes[0].attempts, 0);
    }

    #[test]
    fn empty_title_is_rejected() {
        let db = db();
        assert!(matches!(
            db.insert_task_list("  "),
            Err(SyncError::Validation(ValidationError::InvalidValue { .. }))
        ));
        assert_eq!(db.count_pending_changes().unwrap(), 0);
    }

    #[test]
    fn edits_before_push_keep_pending_create() {
        let db = db();
        let list = db.insert_task_list("Work").unwrap();
        let task = db.insert_task(&list.local_id, new_task("Draft")).unwrap();
        let task = db
            .patch_task(
                &task.local_id,
                TaskPatch {
                    title: Some("Draft v2".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(task.sync_state, SyncState::PendingCreate);
        assert_eq!(task.title, "Draft v2");
        assert_eq!(db.count_pending_changes().unwrap(), 3);
    }

    #[test]
    fn pending_changes_are_ordered_by_creation() {
        let db = db();
        let list = db.insert_task_list("Work").unwrap();
        let a = db.insert_task(&list.local_id, new_task("a")).unwrap();
        let b = db.insert_task(&list.local_id, new_task("b")).unwrap();

        let changes = db.list_pending_changes().unwrap();
        let ids: Vec<_> = changes.iter().map(|c| c.entity_id.as_str()).collect();
        assert_eq!(ids, [list.local_id.as_str(), a.local_id.as_str(), b.local_id.as_str()]);
        assert!(changes.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn delete_of_unpushed_task_removes_it_without_ledger_entry() {
        let db = db();
        let list = db.insert_task_list("Work").unwrap();
        let parent = db.insert_task(&list.local_id, new_task("parent")).unwrap();
        let child = db
            .insert_task(
                &list.local_id,
                NewTask {
                    title: "child".into(),
                    parent_id: Some(parent.local_id.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        db.remove_task(&parent.local_id).unwrap();

        assert!(db.get_task(&parent.local_id).unwrap().is_none());
        assert!(db.get_task(&child.local_id).unwrap().is_none());
        let changes = db.list_pending_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind(), EntityKind::TaskList);
    }

    #[test]
    fn delete_of_bound_task_enqueues_and_rejects_further_edits() {
        let db = db();
        let list_id = synced_list(&db, "L1");
        db.merge_remote_task(&list_id, &remote_task("T1", "Pay rent", 60))
            .unwrap();
        let task = db.get_tasks(&list_id).unwrap().remove(0);

        db.remove_task(&task.local_id).unwrap();
        let stored = db.get_task(&task.local_id).unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::PendingDelete);
        assert!(db.get_tasks(&list_id).unwrap().is_empty());

        let err = db
            .patch_task(
                &task.local_id,
                TaskPatch {
                    title: Some("x".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::PendingDeletion { .. })
        ));
        assert_eq!(db.count_pending_changes().unwrap(), 1);
    }

    #[test]
    fn acknowledging_last_entry_returns_to_synced() {
        let db = db();
        let list_id = synced_list(&db, "L1");
        db.rename_list(&list_id, "Renamed").unwrap();
        db.rename_list(&list_id, "Renamed again").unwrap();

        let changes = db.list_pending_changes().unwrap();
        assert_eq!(changes.len(), 2);

        db.acknowledge_change(changes[0].id).unwrap();
        let list = db.get_task_list(&list_id).unwrap().unwrap();
        assert_eq!(list.sync_state, SyncState::PendingUpdate);

        db.acknowledge_change(changes[1].id).unwrap();
        let list = db.get_task_list(&list_id).unwrap().unwrap();
        assert_eq!(list.sync_state, SyncState::Synced);
        assert_eq!(db.count_pending_changes().unwrap(), 0);

        // Acknowledging twice is harmless.
        db.acknowledge_change(changes[1].id).unwrap();
    }

    #[test]
    fn create_ack_binds_remote_id_once() {
        let db = db();
        let list = db.insert_task_list("Work").unwrap();
        db.bind_remote_id(EntityKind::TaskList, &list.local_id, "R1")
            .unwrap();
        db.bind_remote_id(EntityKind::TaskList, &list.local_id, "R1")
            .unwrap();
        assert!(matches!(
            db.bind_remote_id(EntityKind::TaskList, &list.local_id, "R2"),
            Err(SyncError::Conflict(_))
        ));
        assert_eq!(
            db.lookup_remote_id(EntityKind::TaskList, &list.local_id)
                .unwrap()
                .as_deref(),
            Some("R1")
        );
        assert!(matches!(
            db.lookup_remote_id(EntityKind::Task, "missing"),
            Err(SyncError::NotFound { .. })
        ));
    }

    #[test]
    fn failures_count_attempts_and_reset_rearms() {
        let db = db();
        let list_id = synced_list(&db, "L1");
        db.rename_list(&list_id, "Renamed").unwrap();
        let change = db.list_pending_changes().unwrap().remove(0);

        assert_eq!(db.fail_change(change.id, "boom").unwrap(), 1);
        assert_eq!(db.fail_change(change.id, "boom again").unwrap(), 2);
        let stored = db.list_pending_changes().unwrap().remove(0);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("boom again"));

        db.set_conflict(EntityKind::TaskList, &list_id).unwrap();
        assert_eq!(
            db.get_task_list(&list_id).unwrap().unwrap().sync_state,
            SyncState::Conflict
        );

        db.rearm_change(change.id).unwrap();
        let stored = db.list_pending_changes().unwrap().remove(0);
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
        assert_eq!(
            db.get_task_list(&list_id).unwrap().unwrap().sync_state,
            SyncState::PendingUpdate
        );

        assert!(db.fail_change(9999, "nope").is_err());
    }

    #[test]
    fn remote_insert_and_last_write_wins() {
        let db = db();
        let list_id = synced_list(&db, "L1");

        let outcome = db
            .merge_remote_task(&list_id, &remote_task("T1", "first", 120))
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::Insert);
        assert!(!outcome.conflict);

        let local = db.get_tasks(&list_id).unwrap().remove(0);
        db.patch_task(
            &local.local_id,
            TaskPatch {
                title: Some("local edit".into()),
                ..Default::default()
            },
        )
        .unwrap();

        // Older remote copy loses against the unpushed local edit.
        let outcome = db
            .merge_remote_task(&list_id, &remote_task("T1", "stale remote", 60))
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::KeepLocal);
        assert!(outcome.conflict);
        assert_eq!(db.get_task(&local.local_id).unwrap().unwrap().title, "local edit");

        // A newer remote copy wins and drops the queued edit.
        let mut newer = remote_task("T1", "newer remote", 0);
        newer.updated_at = Utc::now() + Duration::seconds(5);
        let outcome = db.merge_remote_task(&list_id, &newer).unwrap();
        assert_eq!(outcome.resolution, Resolution::ApplyRemote);
        assert!(outcome.conflict);

        let stored = db.get_task(&local.local_id).unwrap().unwrap();
        assert_eq!(stored.title, "newer remote");
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert_eq!(db.count_pending_changes().unwrap(), 0);
    }

    #[test]
    fn remote_task_keeps_links_and_parent() {
        let db = db();
        let list_id = synced_list(&db, "L1");
        db.merge_remote_task(&list_id, &remote_task("P", "parent", 60))
            .unwrap();

        let mut child = remote_task("C", "child", 60);
        child.parent_remote_id = Some("P".into());
        child.links = vec![
            TaskLink {
                link_type: "email".into(),
                description: "thread".into(),
                url: "https://mail.example.com/1".into(),
            },
            TaskLink {
                link_type: "email".into(),
                description: "reply".into(),
                url: "https://mail.example.com/2".into(),
            },
        ];
        db.merge_remote_task(&list_id, &child).unwrap();

        let tasks = db.get_tasks(&list_id).unwrap();
        let parent = tasks.iter().find(|t| t.title == "parent").unwrap();
        let child = tasks.iter().find(|t| t.title == "child").unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(parent.local_id.as_str()));
        assert_eq!(child.links.len(), 2);
        assert_eq!(child.links[1].description, "reply");
    }

    #[test]
    fn orphans_are_removed_unless_pending() {
        let db = db();
        let kept = synced_list(&db, "L-kept");
        let gone = synced_list(&db, "L-gone");
        let pending = synced_list(&db, "L-pending");
        db.rename_list(&pending, "still editing").unwrap();
        let local_only = db.insert_task_list("never pushed").unwrap();

        db.merge_remote_task(&gone, &remote_task("T-gone", "in gone list", 60))
            .unwrap();
        db.merge_remote_task(&kept, &remote_task("T-kept", "kept", 60))
            .unwrap();
        db.merge_remote_task(&kept, &remote_task("T-removed", "removed remotely", 60))
            .unwrap();

        let observed: HashSet<String> = ["L-kept", "T-kept"].iter().map(|s| s.to_string()).collect();
        let report = db.remove_orphans(&observed, OrphanScope::ListsAndTasks).unwrap();

        assert_eq!(report.lists_removed, 1);
        assert_eq!(report.tasks_removed, 2);
        assert!(db.get_task_list(&gone).unwrap().is_none());
        assert!(db.get_task_list(&kept).unwrap().is_some());
        assert!(db.get_task_list(&pending).unwrap().is_some());
        assert!(db.get_task_list(&local_only.local_id).unwrap().is_some());
        let titles: Vec<_> = db
            .get_tasks(&kept)
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, ["kept"]);
    }

    #[test]
    fn lists_only_scope_keeps_unseen_tasks() {
        let db = db();
        let kept = synced_list(&db, "L-kept");
        let gone = synced_list(&db, "L-gone");
        db.merge_remote_task(&kept, &remote_task("T-unseen", "filtered out", 60))
            .unwrap();

        let observed: HashSet<String> = ["L-kept"].iter().map(|s| s.to_string()).collect();
        let report = db.remove_orphans(&observed, OrphanScope::ListsOnly).unwrap();

        assert_eq!(report.lists_removed, 1);
        assert_eq!(report.tasks_removed, 0);
        assert!(db.get_task_list(&gone).unwrap().is_none());
        assert_eq!(db.get_tasks(&kept).unwrap().len(), 1);
    }

    #[test]
    fn dropping_a_list_clears_its_tasks_and_entries() {
        let db = db();
        let list_id = synced_list(&db, "L1");
        db.insert_task(&list_id, new_task("queued")).unwrap();
        db.remove_task_list(&list_id).unwrap();

        let ops: Vec<_> = db
            .list_pending_changes()
            .unwrap()
            .iter()
            .map(|c| c.operation())
            .collect();
        assert_eq!(ops, [ChangeOperation::Create, ChangeOperation::Delete]);
        assert!(db.get_task_list(&list_id).unwrap().is_none());

        db.drop_entity(EntityKind::TaskList, &list_id).unwrap();
        assert_eq!(db.count_pending_changes().unwrap(), 0);
    }

    #[test]
    fn move_rejects_cycles() {
        let db = db();
        let list = db.insert_task_list("Work").unwrap();
        let parent = db.insert_task(&list.local_id, new_task("parent")).unwrap();
        let child = db
            .insert_task(
                &list.local_id,
                NewTask {
                    title: "child".into(),
                    parent_id: Some(parent.local_id.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(db
            .relocate_task(&parent.local_id, Some(&child.local_id), None)
            .is_err());

        let moved = db.relocate_task(&child.local_id, None, None).unwrap();
        assert!(moved.parent_id.is_none());
        let last = db.list_pending_changes().unwrap().pop().unwrap();
        assert_eq!(last.operation(), ChangeOperation::Move);
    }

    #[test]
    fn search_is_case_insensitive_and_newest_first() {
        let db = db();
        let list = db.insert_task_list("Home").unwrap();
        db.insert_task(&list.local_id, new_task("Buy MILK")).unwrap();
        db.insert_task(
            &list.local_id,
            NewTask {
                title: "Errands".into(),
                notes: "milk and bread".into(),
                ..Default::default()
            },
        )
        .unwrap();
        db.insert_task(&list.local_id, new_task("Call mom")).unwrap();

        let hits: Vec<_> = db
            .search("milk")
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(hits, ["Errands", "Buy MILK"]);
    }

    #[test]
    fn filter_by_completion() {
        let db = db();
        let list = db.insert_task_list("Home").unwrap();
        let done = db.insert_task(&list.local_id, new_task("done")).unwrap();
        db.insert_task(&list.local_id, new_task("open")).unwrap();
        db.patch_task(
            &done.local_id,
            TaskPatch {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        )
        .unwrap();

        let filter = TaskFilter {
            completed: Some(true),
            ..Default::default()
        };
        let titles: Vec<_> = db
            .filter(&filter)
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, ["done"]);
    }

    #[test]
    fn open_at_persists_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasksync.db");
        {
            let db = TaskDb::open_at(&path).unwrap();
            db.insert_task_list("Persistent").unwrap();
        }
        let db = TaskDb::open_at(&path).unwrap();
        assert_eq!(db.get_task_lists().unwrap().len(), 1);
        assert_eq!(db.count_pending_changes().unwrap(), 1);
    }
}
