//! In-process remote service.
//!
//! Keeps lists and tasks in memory with server-assigned ids and timestamps,
//! pages listings, and can be told to fail specific calls. Useful for
//! exercising the sync engine without a network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::RemoteTaskService;
use crate::error::{AuthError, SyncError};
use crate::model::{Page, RemoteTask, RemoteTaskList, TaskFields, TaskStatus};
use crate::sync::CancelToken;

/// Remote call kinds, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    ListLists,
    CreateList,
    UpdateList,
    DeleteList,
    ListTasks,
    GetTask,
    CreateTask,
    UpdateTask,
    DeleteTask,
    MoveTask,
    ClearCompleted,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    /// Ordered by remote id so listings are stable.
    lists: BTreeMap<String, RemoteTaskList>,
    /// list id -> tasks in insertion order
    tasks: BTreeMap<String, Vec<RemoteTask>>,
    calls: HashMap<RemoteCall, usize>,
    /// Remaining forced failures per call kind.
    failures: HashMap<RemoteCall, (usize, u16)>,
    /// Titles whose create/update calls always fail.
    poisoned_titles: HashSet<String>,
    clock: Option<DateTime<Utc>>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn enter(&mut self, call: RemoteCall) -> Result<(), SyncError> {
        *self.calls.entry(call).or_default() += 1;
        if let Some((remaining, status)) = self.failures.get_mut(&call) {
            if *remaining > 0 {
                *remaining -= 1;
                let message = format!("injected {call:?} failure");
                if *status == 401 {
                    return Err(AuthError::Rejected(message).into());
                }
                return Err(SyncError::remote(Some(*status), message));
            }
        }
        Ok(())
    }

    fn check_title(&self, title: &str) -> Result<(), SyncError> {
        if self.poisoned_titles.contains(title) {
            return Err(SyncError::remote(Some(400), format!("rejected title {title:?}")));
        }
        Ok(())
    }

    fn list_tasks_mut(&mut self, list_id: &str) -> Result<&mut Vec<RemoteTask>, SyncError> {
        if !self.lists.contains_key(list_id) {
            return Err(SyncError::remote(Some(404), format!("list {list_id} not found")));
        }
        Ok(self.tasks.entry(list_id.to_string()).or_default())
    }
}

fn page<T: Clone>(items: &[T], page_token: Option<&str>, page_size: usize) -> Page<T> {
    let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
    let end = (start + page_size).min(items.len());
    let slice = items.get(start..end).unwrap_or_default().to_vec();
    Page {
        items: slice,
        next_page_token: (end < items.len()).then(|| end.to_string()),
    }
}

fn not_found(what: &str, id: &str) -> SyncError {
    SyncError::remote(Some(404), format!("{what} {id} not found"))
}

/// In-memory [`RemoteTaskService`].
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<State>,
    page_size: usize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    /// Listings return at most `page_size` items per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: page_size.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin the server clock used for `updated_at`.
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state().clock = Some(now);
    }

    /// Make the next `times` calls of `call` fail with `status`. A 401 fails
    /// with an authentication error.
    pub fn fail_next(&self, call: RemoteCall, times: usize, status: u16) {
        self.state().failures.insert(call, (times, status));
    }

    /// Reject every create or update carrying `title`.
    pub fn reject_title(&self, title: &str) {
        self.state().poisoned_titles.insert(title.to_string());
    }

    pub fn calls(&self, call: RemoteCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Total calls that write remote state.
    pub fn write_calls(&self) -> usize {
        use RemoteCall::*;
        [CreateList, UpdateList, DeleteList, CreateTask, UpdateTask, DeleteTask, MoveTask, ClearCompleted]
            .iter()
            .map(|c| self.calls(*c))
            .sum()
    }

    pub fn lists(&self) -> Vec<RemoteTaskList> {
        self.state().lists.values().cloned().collect()
    }

    pub fn tasks(&self, list_id: &str) -> Vec<RemoteTask> {
        self.state().tasks.get(list_id).cloned().unwrap_or_default()
    }

    /// Seed a list as if another client created it.
    pub fn insert_list(&self, title: &str) -> RemoteTaskList {
        let mut state = self.state();
        let list = RemoteTaskList {
            remote_id: state.id("L"),
            title: title.to_string(),
            updated_at: state.now(),
        };
        state.lists.insert(list.remote_id.clone(), list.clone());
        state.tasks.entry(list.remote_id.clone()).or_default();
        list
    }

    /// Seed a task as if another client created it.
    pub fn insert_task(&self, list_id: &str, title: &str, parent: Option<&str>) -> RemoteTask {
        let mut state = self.state();
        let task = RemoteTask {
            remote_id: state.id("T"),
            parent_remote_id: parent.map(str::to_string),
            title: title.to_string(),
            notes: String::new(),
            status: TaskStatus::NeedsAction,
            due: None,
            completed_at: None,
            position: format!("{:020}", state.next_id),
            deleted: false,
            hidden: false,
            links: Vec::new(),
            updated_at: state.now(),
        };
        state
            .tasks
            .entry(list_id.to_string())
            .or_default()
            .push(task.clone());
        task
    }

    /// Edit a list title as another client would.
    pub fn rename_list(&self, list_id: &str, title: &str, at: DateTime<Utc>) {
        if let Some(list) = self.state().lists.get_mut(list_id) {
            list.title = title.to_string();
            list.updated_at = at;
        }
    }

    /// Edit a task title as another client would.
    pub fn retitle_task(&self, list_id: &str, task_id: &str, title: &str, at: DateTime<Utc>) {
        let mut state = self.state();
        if let Some(task) = state
            .tasks
            .get_mut(list_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.remote_id == task_id))
        {
            task.title = title.to_string();
            task.updated_at = at;
        }
    }

    /// Delete a list as another client would.
    pub fn remove_list(&self, list_id: &str) {
        let mut state = self.state();
        state.lists.remove(list_id);
        state.tasks.remove(list_id);
    }
}

#[async_trait]
impl RemoteTaskService for InMemoryRemote {
    async fn list_task_lists_page(
        &self,
        page_token: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTaskList>, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::ListLists)?;
                let lists: Vec<_> = state.lists.values().cloned().collect();
                Ok(page(&lists, page_token, self.page_size))
            })
            .await
    }

    async fn create_task_list(
        &self,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTaskList, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::CreateList)?;
                state.check_title(title)?;
                let list = RemoteTaskList {
                    remote_id: state.id("L"),
                    title: title.to_string(),
                    updated_at: state.now(),
                };
                state.lists.insert(list.remote_id.clone(), list.clone());
                state.tasks.entry(list.remote_id.clone()).or_default();
                Ok(list)
            })
            .await
    }

    async fn update_task_list(
        &self,
        list_id: &str,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTaskList, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::UpdateList)?;
                state.check_title(title)?;
                let now = state.now();
                let list = state
                    .lists
                    .get_mut(list_id)
                    .ok_or_else(|| not_found("list", list_id))?;
                list.title = title.to_string();
                list.updated_at = now;
                Ok(list.clone())
            })
            .await
    }

    async fn delete_task_list(
        &self,
        list_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::DeleteList)?;
                state
                    .lists
                    .remove(list_id)
                    .ok_or_else(|| not_found("list", list_id))?;
                state.tasks.remove(list_id);
                Ok(())
            })
            .await
    }

    async fn list_tasks_page(
        &self,
        list_id: &str,
        page_token: Option<&str>,
        include_completed: bool,
        include_hidden: bool,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTask>, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::ListTasks)?;
                let tasks: Vec<_> = state
                    .list_tasks_mut(list_id)?
                    .iter()
                    .filter(|t| !t.deleted)
                    .filter(|t| include_completed || t.status != TaskStatus::Completed)
                    .filter(|t| include_hidden || !t.hidden)
                    .cloned()
                    .collect();
                Ok(page(&tasks, page_token, self.page_size))
            })
            .await
    }

    async fn get_task(
        &self,
        list_id: &str,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::GetTask)?;
                state
                    .list_tasks_mut(list_id)?
                    .iter()
                    .find(|t| t.remote_id == task_id)
                    .cloned()
                    .ok_or_else(|| not_found("task", task_id))
            })
            .await
    }

    async fn create_task(
        &self,
        list_id: &str,
        fields: &TaskFields,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::CreateTask)?;
                state.check_title(&fields.title)?;
                let remote_id = state.id("T");
                let now = state.now();
                let position = format!("{:020}", state.next_id);
                let tasks = state.list_tasks_mut(list_id)?;
                if let Some(parent) = parent {
                    if !tasks.iter().any(|t| t.remote_id == parent) {
                        return Err(not_found("parent task", parent));
                    }
                }
                let task = RemoteTask {
                    remote_id,
                    parent_remote_id: parent.map(str::to_string),
                    title: fields.title.clone(),
                    notes: fields.notes.clone(),
                    status: fields.status,
                    due: fields.due,
                    completed_at: fields.completed_at,
                    position,
                    deleted: false,
                    hidden: false,
                    links: Vec::new(),
                    updated_at: now,
                };
                let index = previous
                    .and_then(|p| tasks.iter().position(|t| t.remote_id == p))
                    .map_or(tasks.len(), |i| i + 1);
                tasks.insert(index, task.clone());
                Ok(task)
            })
            .await
    }

    async fn update_task(
        &self,
        list_id: &str,
        task_id: &str,
        fields: &TaskFields,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::UpdateTask)?;
                state.check_title(&fields.title)?;
                let now = state.now();
                let task = state
                    .list_tasks_mut(list_id)?
                    .iter_mut()
                    .find(|t| t.remote_id == task_id)
                    .ok_or_else(|| not_found("task", task_id))?;
                task.title = fields.title.clone();
                task.notes = fields.notes.clone();
                task.status = fields.status;
                task.due = fields.due;
                task.completed_at = fields.completed_at;
                task.updated_at = now;
                Ok(task.clone())
            })
            .await
    }

    async fn delete_task(
        &self,
        list_id: &str,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::DeleteTask)?;
                let tasks = state.list_tasks_mut(list_id)?;
                let before = tasks.len();
                tasks.retain(|t| t.remote_id != task_id && t.parent_remote_id.as_deref() != Some(task_id));
                if tasks.len() == before {
                    return Err(not_found("task", task_id));
                }
                Ok(())
            })
            .await
    }

    async fn move_task(
        &self,
        list_id: &str,
        task_id: &str,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::MoveTask)?;
                let now = state.now();
                let tasks = state.list_tasks_mut(list_id)?;
                let index = tasks
                    .iter()
                    .position(|t| t.remote_id == task_id)
                    .ok_or_else(|| not_found("task", task_id))?;
                let mut task = tasks.remove(index);
                task.parent_remote_id = parent.map(str::to_string);
                task.updated_at = now;
                let index = previous
                    .and_then(|p| tasks.iter().position(|t| t.remote_id == p))
                    .map_or(0, |i| i + 1);
                tasks.insert(index, task.clone());
                Ok(task)
            })
            .await
    }

    async fn clear_completed(&self, list_id: &str, cancel: &CancelToken) -> Result<(), SyncError> {
        cancel
            .run(async {
                let mut state = self.state();
                state.enter(RemoteCall::ClearCompleted)?;
                let now = state.now();
                for task in state.list_tasks_mut(list_id)? {
                    if task.status == TaskStatus::Completed && !task.hidden {
                        task.hidden = true;
                        task.updated_at = now;
                    }
                }
                Ok(())
            })
            .await
    }
}
