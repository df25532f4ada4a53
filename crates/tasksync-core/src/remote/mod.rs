//! Remote task service: the authoritative copy the engine syncs against.

pub mod google_tasks;
pub mod memory;

pub use google_tasks::GoogleTasksClient;
pub use memory::{InMemoryRemote, RemoteCall};

use async_trait::async_trait;

use crate::error::SyncError;
use crate::model::{Page, RemoteTask, RemoteTaskList, TaskFields};
use crate::sync::CancelToken;

/// Operations the sync engine needs from the remote service.
///
/// Ids are remote ids. Every call observes `cancel` and fails with
/// [`SyncError::Cancelled`] once it fires.
#[async_trait]
pub trait RemoteTaskService: Send + Sync {
    async fn list_task_lists_page(
        &self,
        page_token: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTaskList>, SyncError>;

    async fn create_task_list(
        &self,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTaskList, SyncError>;

    async fn update_task_list(
        &self,
        list_id: &str,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTaskList, SyncError>;

    async fn delete_task_list(&self, list_id: &str, cancel: &CancelToken)
        -> Result<(), SyncError>;

    async fn list_tasks_page(
        &self,
        list_id: &str,
        page_token: Option<&str>,
        include_completed: bool,
        include_hidden: bool,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTask>, SyncError>;

    async fn get_task(
        &self,
        list_id: &str,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError>;

    async fn create_task(
        &self,
        list_id: &str,
        fields: &TaskFields,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError>;

    async fn update_task(
        &self,
        list_id: &str,
        task_id: &str,
        fields: &TaskFields,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError>;

    async fn delete_task(
        &self,
        list_id: &str,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), SyncError>;

    async fn move_task(
        &self,
        list_id: &str,
        task_id: &str,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError>;

    /// Hide all completed tasks of a list.
    async fn clear_completed(&self, list_id: &str, cancel: &CancelToken) -> Result<(), SyncError>;
}

/// Follow `next_page_token` until the listing is exhausted.
pub async fn fetch_all_task_lists(
    remote: &dyn RemoteTaskService,
    cancel: &CancelToken,
) -> Result<Vec<RemoteTaskList>, SyncError> {
    let mut lists = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = remote
            .list_task_lists_page(token.as_deref(), cancel)
            .await?;
        lists.extend(page.items);
        match page.next_page_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(lists),
        }
    }
}

/// All tasks of one list, across pages.
pub async fn fetch_all_tasks(
    remote: &dyn RemoteTaskService,
    list_id: &str,
    include_completed: bool,
    include_hidden: bool,
    cancel: &CancelToken,
) -> Result<Vec<RemoteTask>, SyncError> {
    let mut tasks = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = remote
            .list_tasks_page(
                list_id,
                token.as_deref(),
                include_completed,
                include_hidden,
                cancel,
            )
            .await?;
        tasks.extend(page.items);
        match page.next_page_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(tasks),
        }
    }
}
