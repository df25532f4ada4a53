//! Integration tests for full sync cycles.
//!
//! These tests drive the engine through the public API against the SQLite
//! store and either the in-memory remote or a mocked HTTP server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tasksync_core::model::{Page, RemoteTask, RemoteTaskList, TaskFields};
use tasksync_core::remote::RemoteCall;
use tasksync_core::{
    CancelToken, GoogleTasksClient, InMemoryRemote, NewTask, RemoteTaskService, StaticTokenProvider,
    SyncEngine, SyncError, SyncOptions, SyncState, TaskDb, TaskPatch, TaskRepository,
};
use tokio::sync::Notify;

// ============================================================================
// Gated remote: blocks list listings until released
// ============================================================================

struct GatedRemote {
    inner: InMemoryRemote,
    entered: Notify,
    release: Notify,
}

impl GatedRemote {
    fn new() -> Self {
        Self {
            inner: InMemoryRemote::new(),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl RemoteTaskService for GatedRemote {
    async fn list_task_lists_page(
        &self,
        page_token: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTaskList>, SyncError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.list_task_lists_page(page_token, cancel).await
    }

    async fn create_task_list(&self, title: &str, cancel: &CancelToken) -> Result<RemoteTaskList, SyncError> {
        self.inner.create_task_list(title, cancel).await
    }

    async fn update_task_list(
        &self,
        list_id: &str,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTaskList, SyncError> {
        self.inner.update_task_list(list_id, title, cancel).await
    }

    async fn delete_task_list(&self, list_id: &str, cancel: &CancelToken) -> Result<(), SyncError> {
        self.inner.delete_task_list(list_id, cancel).await
    }

    async fn list_tasks_page(
        &self,
        list_id: &str,
        page_token: Option<&str>,
        include_completed: bool,
        include_hidden: bool,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTask>, SyncError> {
        self.inner
            .list_tasks_page(list_id, page_token, include_completed, include_hidden, cancel)
            .await
    }

    async fn get_task(&self, list_id: &str, task_id: &str, cancel: &CancelToken) -> Result<RemoteTask, SyncError> {
        self.inner.get_task(list_id, task_id, cancel).await
    }

    async fn create_task(
        &self,
        list_id: &str,
        fields: &TaskFields,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        self.inner.create_task(list_id, fields, parent, previous, cancel).await
    }

    async fn update_task(
        &self,
        list_id: &str,
        task_id: &str,
        fields: &TaskFields,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        self.inner.update_task(list_id, task_id, fields, cancel).await
    }

    async fn delete_task(&self, list_id: &str, task_id: &str, cancel: &CancelToken) -> Result<(), SyncError> {
        self.inner.delete_task(list_id, task_id, cancel).await
    }

    async fn move_task(
        &self,
        list_id: &str,
        task_id: &str,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        self.inner.move_task(list_id, task_id, parent, previous, cancel).await
    }

    async fn clear_completed(&self, list_id: &str, cancel: &CancelToken) -> Result<(), SyncError> {
        self.inner.clear_completed(list_id, cancel).await
    }
}

// ============================================================================
// Cycles against the in-memory remote
// ============================================================================

#[tokio::test]
async fn test_concurrent_sync_is_rejected_without_side_effects() {
    let repo = Arc::new(TaskDb::open_in_memory().unwrap());
    let remote = Arc::new(GatedRemote::new());
    let engine = Arc::new(SyncEngine::new(repo.clone(), remote.clone(), SyncOptions::default()));
    let list = repo.create_task_list("Inbox").await.unwrap();

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync(&CancelToken::never()).await })
    };
    // The first cycle has pushed and is now parked in its pull.
    remote.entered.notified().await;
    assert!(engine.is_syncing());

    let ledger_before = repo.pending_changes().await.unwrap();
    let writes_before = remote.inner.write_calls();
    let rejected = engine.sync(&CancelToken::never()).await;
    assert!(!rejected.success);
    assert_eq!(rejected.errors, vec![tasksync_core::sync::SYNC_IN_PROGRESS.to_string()]);
    assert_eq!(repo.pending_changes().await.unwrap(), ledger_before);
    assert_eq!(remote.inner.write_calls(), writes_before);

    remote.release.notify_one();
    let first = running.await.unwrap();
    assert!(first.success, "{:?}", first.errors);
    assert!(!engine.is_syncing());
    let list = repo.task_list(&list.local_id).await.unwrap().unwrap();
    assert_eq!(list.sync_state, SyncState::Synced);
}

#[tokio::test]
async fn test_two_clients_converge() {
    let remote = Arc::new(InMemoryRemote::new());
    let laptop = Arc::new(TaskDb::open_in_memory().unwrap());
    let phone = Arc::new(TaskDb::open_in_memory().unwrap());
    let laptop_engine = SyncEngine::new(laptop.clone(), remote.clone(), SyncOptions::default());
    let phone_engine = SyncEngine::new(phone.clone(), remote.clone(), SyncOptions::default());
    let never = CancelToken::never();

    let list = laptop.create_task_list("Shared").await.unwrap();
    let task = laptop
        .create_task(
            &list.local_id,
            NewTask {
                title: "Book flights".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(laptop_engine.sync(&never).await.success);
    assert!(phone_engine.sync(&never).await.success);

    let phone_list = phone.task_lists().await.unwrap().remove(0);
    let phone_task = phone.tasks(&phone_list.local_id).await.unwrap().remove(0);
    assert_eq!(phone_task.title, "Book flights");

    // Edit on the phone, then let the laptop pick it up.
    tokio::time::sleep(Duration::from_millis(5)).await;
    phone
        .update_task(
            &phone_task.local_id,
            TaskPatch {
                title: Some("Book flights and hotel".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(phone_engine.sync(&never).await.success);
    assert!(laptop_engine.sync(&never).await.success);

    let laptop_task = laptop.task(&task.local_id).await.unwrap().unwrap();
    assert_eq!(laptop_task.title, "Book flights and hotel");
    assert_eq!(laptop_task.sync_state, SyncState::Synced);

    // Delete on the laptop; the phone drops its copy on the next pull.
    laptop.delete_task(&task.local_id).await.unwrap();
    assert!(laptop_engine.sync(&never).await.success);
    assert!(phone_engine.sync(&never).await.success);
    assert!(phone.tasks(&phone_list.local_id).await.unwrap().is_empty());
    assert_eq!(remote.calls(RemoteCall::DeleteTask), 1);
}

#[derive(Debug, Clone)]
enum LocalOp {
    CreateList(String),
    RenameList(usize, String),
    DeleteList(usize),
    CreateTask(usize, String),
    CompleteTask(usize),
    DeleteTask(usize),
}

fn local_op() -> impl Strategy<Value = LocalOp> {
    let title = "[a-z]{1,8}";
    prop_oneof![
        title.prop_map(LocalOp::CreateList),
        (0usize..4, title).prop_map(|(i, t)| LocalOp::RenameList(i, t)),
        (0usize..4).prop_map(LocalOp::DeleteList),
        (0usize..4, title).prop_map(|(i, t)| LocalOp::CreateTask(i, t)),
        (0usize..8).prop_map(LocalOp::CompleteTask),
        (0usize..8).prop_map(LocalOp::DeleteTask),
    ]
}

/// Apply an op against whatever currently exists; ops on missing targets are skipped.
async fn apply(repo: &TaskDb, op: &LocalOp) {
    let lists = repo.task_lists().await.unwrap();
    let mut tasks = Vec::new();
    for list in &lists {
        tasks.extend(repo.tasks(&list.local_id).await.unwrap());
    }
    match op {
        LocalOp::CreateList(title) => {
            repo.create_task_list(title).await.unwrap();
        }
        LocalOp::RenameList(i, title) => {
            if let Some(list) = lists.get(*i) {
                repo.rename_task_list(&list.local_id, title).await.unwrap();
            }
        }
        LocalOp::DeleteList(i) => {
            if let Some(list) = lists.get(*i) {
                repo.delete_task_list(&list.local_id).await.unwrap();
            }
        }
        LocalOp::CreateTask(i, title) => {
            if let Some(list) = lists.get(*i) {
                let new = NewTask {
                    title: title.clone(),
                    ..Default::default()
                };
                repo.create_task(&list.local_id, new).await.unwrap();
            }
        }
        LocalOp::CompleteTask(i) => {
            if let Some(task) = tasks.get(*i) {
                let patch = TaskPatch {
                    status: Some(tasksync_core::TaskStatus::Completed),
                    ..Default::default()
                };
                repo.update_task(&task.local_id, patch).await.unwrap();
            }
        }
        LocalOp::DeleteTask(i) => {
            if let Some(task) = tasks.get(*i) {
                repo.delete_task(&task.local_id).await.unwrap();
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever was done offline, one healthy cycle drains the ledger, binds
    /// every entity, and a second cycle writes nothing.
    #[test]
    fn prop_healthy_cycle_drains_ledger(ops in prop::collection::vec(local_op(), 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let repo = Arc::new(TaskDb::open_in_memory().unwrap());
            let remote = Arc::new(InMemoryRemote::new());
            let engine = SyncEngine::new(repo.clone(), remote.clone(), SyncOptions::default());
            let never = CancelToken::never();

            for (i, op) in ops.iter().enumerate() {
                apply(&repo, op).await;
                // Interleave cycles so later ops hit bound entities too.
                if i % 5 == 4 {
                    assert!(engine.sync(&never).await.success);
                }
            }

            let result = engine.sync(&never).await;
            assert!(result.success, "{:?}", result.errors);
            assert_eq!(repo.pending_change_count().await.unwrap(), 0);

            let lists = repo.task_lists().await.unwrap();
            assert_eq!(lists.len(), remote.lists().len());
            for list in &lists {
                assert_eq!(list.sync_state, SyncState::Synced);
                let remote_id = list.remote_id.clone().unwrap();
                let tasks = repo.tasks(&list.local_id).await.unwrap();
                assert_eq!(tasks.len(), remote.tasks(&remote_id).len());
                assert!(tasks.iter().all(|t| t.remote_id.is_some() && t.sync_state == SyncState::Synced));
            }

            let writes = remote.write_calls();
            let again = engine.sync(&never).await;
            assert!(again.success);
            assert_eq!(again.items_pushed, 0);
            assert_eq!(remote.write_calls(), writes);
        });
    }
}

// ============================================================================
// Cycle against a mocked Google Tasks endpoint
// ============================================================================

#[tokio::test]
async fn test_pull_from_http_service() {
    let mut server = mockito::Server::new_async().await;
    let lists = server
        .mock("GET", "/users/@me/lists")
        .match_query(mockito::Matcher::Any)
        .match_header("authorization", "Bearer secret")
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"items":[{"id":"L1","title":"Inbox","updated":"2026-03-01T10:00:00.000Z"}]}"#,
        )
        .create_async()
        .await;
    let tasks = server
        .mock("GET", "/lists/L1/tasks")
        .match_query(mockito::Matcher::Any)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"items":[
                {"id":"T1","title":"Parent","status":"needsAction","position":"001",
                 "updated":"2026-03-01T10:00:00.000Z"},
                {"id":"T2","title":"Child","parent":"T1","status":"completed","position":"002",
                 "completed":"2026-03-01T09:00:00.000Z","updated":"2026-03-01T10:00:00.000Z"}
            ]}"#,
        )
        .create_async()
        .await;

    let repo = Arc::new(TaskDb::open_in_memory().unwrap());
    let client = GoogleTasksClient::with_base_url(Arc::new(StaticTokenProvider::new("secret")), server.url());
    let engine = SyncEngine::new(repo.clone(), Arc::new(client), SyncOptions::default());

    let result = engine.sync(&CancelToken::never()).await;
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.items_pulled, 3);
    lists.assert_async().await;
    tasks.assert_async().await;

    let list = repo.task_lists().await.unwrap().remove(0);
    assert_eq!(list.remote_id.as_deref(), Some("L1"));
    let stored = repo.tasks(&list.local_id).await.unwrap();
    let parent = stored.iter().find(|t| t.title == "Parent").unwrap();
    let child = stored.iter().find(|t| t.title == "Child").unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(parent.local_id.as_str()));
    assert!(child.is_completed());
}

#[tokio::test]
async fn test_missing_token_fails_cycle_without_requests() {
    let mut server = mockito::Server::new_async().await;
    let any = server
        .mock("GET", mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let repo = Arc::new(TaskDb::open_in_memory().unwrap());
    repo.create_task_list("Offline").await.unwrap();
    let client = GoogleTasksClient::with_base_url(Arc::new(StaticTokenProvider::none()), server.url());
    let engine = SyncEngine::new(repo.clone(), Arc::new(client), SyncOptions::default());

    let result = engine.sync(&CancelToken::never()).await;
    assert!(!result.success);
    assert!(result.errors[0].contains("Authentication required"));
    assert_eq!(repo.pending_changes().await.unwrap()[0].attempts, 0);
    any.assert_async().await;
}
