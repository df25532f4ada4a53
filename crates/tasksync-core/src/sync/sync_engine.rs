//! Push/pull orchestration.
//!
//! A cycle replays the pending-change ledger against the remote service,
//! then pulls every list and task, merges them last-write-wins and removes
//! local copies the remote no longer has. Only one cycle runs at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::model::{ChangePayload, EntityKind, PendingChange, RemoteTask};
use crate::remote::{fetch_all_task_lists, fetch_all_tasks, RemoteTaskService};
use crate::storage::TaskRepository;
use crate::sync::cancel::CancelToken;
use crate::sync::types::{SyncOptions, SyncResult, SyncStatus, SyncStatusEvent, SYNC_IN_PROGRESS};

const EVENT_CAPACITY: usize = 64;

/// Clears the in-flight flag when a cycle ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Result of one phase plus the error that stopped it early, if any.
struct Phase {
    result: SyncResult,
    fatal: Option<SyncError>,
}

pub struct SyncEngine {
    repo: Arc<dyn TaskRepository>,
    remote: Arc<dyn RemoteTaskService>,
    options: SyncOptions,
    events: broadcast::Sender<SyncStatusEvent>,
    in_flight: AtomicBool,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        remote: Arc<dyn RemoteTaskService>,
        options: SyncOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            repo,
            remote,
            options,
            events,
            in_flight: AtomicBool::new(false),
            last_sync_at: Mutex::new(None),
        }
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    /// Status events for every phase transition of every cycle.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatusEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            last_sync_at: self.last_sync_at(),
            pending_count: self.repo.pending_change_count().await?,
            in_progress: self.is_syncing(),
        })
    }

    /// Run a full cycle: push, then pull and reconcile orphans.
    ///
    /// Returns a failed result without touching anything when another cycle
    /// is already running. Errors on individual changes or entities are
    /// collected in the result; only authentication failures and
    /// cancellation end the cycle early.
    pub async fn sync(&self, cancel: &CancelToken) -> SyncResult {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("sync requested while a cycle is running");
            return SyncResult::failure(SYNC_IN_PROGRESS);
        };
        info!("sync cycle started");
        self.emit(true, "Starting sync...", 0);

        self.emit(true, "Pushing local changes...", 25);
        let push = self.push_changes(cancel).await;
        if let Some(err) = push.fatal {
            return self.fail_cycle(push.result, SyncResult::default(), err);
        }

        self.emit(true, "Pulling remote changes...", 50);
        let pull = self.pull_changes(cancel).await;
        if let Some(err) = pull.fatal {
            return self.fail_cycle(push.result, pull.result, err);
        }

        let result = SyncResult::combine(push.result, pull.result);
        self.finish_cycle();
        info!(
            pushed = result.items_pushed,
            pulled = result.items_pulled,
            conflicts = result.conflicts,
            errors = result.errors.len(),
            "sync cycle finished"
        );
        self.emit(false, "Sync complete", 100);
        result
    }

    /// Replay the ledger only.
    pub async fn push(&self, cancel: &CancelToken) -> SyncResult {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return SyncResult::failure(SYNC_IN_PROGRESS);
        };
        self.push_changes(cancel).await.result
    }

    /// Pull and reconcile only.
    pub async fn pull(&self, cancel: &CancelToken) -> SyncResult {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return SyncResult::failure(SYNC_IN_PROGRESS);
        };
        self.pull_changes(cancel).await.result
    }

    /// Hide completed tasks of a list on the remote. Local copies follow on
    /// the next pull.
    pub async fn clear_completed(&self, list_id: &str, cancel: &CancelToken) -> Result<(), SyncError> {
        let remote_list = self.require_remote_id(EntityKind::TaskList, list_id).await?;
        self.remote.clear_completed(&remote_list, cancel).await
    }

    fn emit(&self, is_syncing: bool, message: impl Into<String>, progress: u8) {
        // No subscribers is fine.
        let _ = self.events.send(SyncStatusEvent {
            is_syncing,
            message: message.into(),
            progress,
        });
    }

    fn finish_cycle(&self) {
        *self.last_sync_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    fn fail_cycle(&self, push: SyncResult, pull: SyncResult, err: SyncError) -> SyncResult {
        warn!(error = %err, "sync cycle aborted");
        self.emit(false, format!("Sync failed: {err}"), 0);
        let mut result = SyncResult::combine(push, pull);
        result.success = false;
        result
    }

    async fn push_changes(&self, cancel: &CancelToken) -> Phase {
        let mut result = SyncResult::default();
        let changes = match self.repo.pending_changes().await {
            Ok(changes) => changes,
            Err(err) => {
                result.errors.push(format!("Failed to read pending changes: {err}"));
                return Phase {
                    result: result.finish(),
                    fatal: None,
                };
            }
        };
        debug!(count = changes.len(), "replaying pending changes");

        for change in changes {
            if cancel.is_cancelled() {
                result.errors.push(SyncError::Cancelled.to_string());
                return Phase {
                    result: result.finish(),
                    fatal: Some(SyncError::Cancelled),
                };
            }
            if change.attempts >= self.options.max_attempts {
                debug!(change = %change.describe(), "skipping exhausted change");
                continue;
            }

            match self.replay(&change, cancel).await {
                Ok(()) => {
                    result.items_pushed += 1;
                    debug!(change = %change.describe(), "change pushed");
                }
                Err(SyncError::NotFound { kind, id })
                    if kind == change.payload.kind() && id == change.entity_id =>
                {
                    debug!(change = %change.describe(), "entity gone, dropping change");
                    if let Err(err) = self.repo.remove_pending_change(change.id).await {
                        result.errors.push(describe_failure(&change, &err));
                    }
                }
                Err(err) if err.is_fatal() => {
                    result.errors.push(describe_failure(&change, &err));
                    return Phase {
                        result: result.finish(),
                        fatal: Some(err),
                    };
                }
                Err(err) => {
                    warn!(change = %change.describe(), error = %err, "change failed");
                    result.errors.push(describe_failure(&change, &err));
                    if self.record_failure(&change, &err).await {
                        result.conflicts += 1;
                    }
                }
            }
        }

        Phase {
            result: result.finish(),
            fatal: None,
        }
    }

    /// Count the failed attempt. Returns true when the entity was escalated.
    async fn record_failure(&self, change: &PendingChange, err: &SyncError) -> bool {
        let attempts = match self.repo.record_change_failure(change.id, &err.to_string()).await {
            Ok(attempts) => attempts,
            Err(record_err) => {
                warn!(change = %change.describe(), error = %record_err, "could not record failure");
                return false;
            }
        };
        if attempts < self.options.max_attempts {
            return false;
        }
        let kind = change.payload.kind();
        match self.repo.mark_conflict(kind, &change.entity_id).await {
            Ok(()) => {
                warn!(change = %change.describe(), attempts, "change exhausted its attempts");
                true
            }
            Err(mark_err) => {
                warn!(change = %change.describe(), error = %mark_err, "could not mark conflict");
                false
            }
        }
    }

    async fn replay(&self, change: &PendingChange, cancel: &CancelToken) -> Result<(), SyncError> {
        let id = change.entity_id.as_str();
        match &change.payload {
            ChangePayload::CreateList { title } => {
                if self.repo.remote_id(EntityKind::TaskList, id).await?.is_none() {
                    let created = self.remote.create_task_list(title, cancel).await?;
                    self.repo
                        .update_remote_id(EntityKind::TaskList, id, &created.remote_id)
                        .await?;
                }
            }
            ChangePayload::UpdateList { title } => {
                let remote_id = self.require_remote_id(EntityKind::TaskList, id).await?;
                let updated = self.remote.update_task_list(&remote_id, title, cancel).await;
                gone_remotely(updated, EntityKind::TaskList, id)?;
            }
            ChangePayload::DeleteList => {
                if let Some(remote_id) = self.repo.remote_id(EntityKind::TaskList, id).await? {
                    tolerate_missing(self.remote.delete_task_list(&remote_id, cancel).await)?;
                }
                return self.repo.remove_entity(EntityKind::TaskList, id).await;
            }
            ChangePayload::CreateTask {
                list_id,
                parent_id,
                previous_id,
                fields,
            } => {
                if self.repo.remote_id(EntityKind::Task, id).await?.is_none() {
                    let list = self.require_remote_id(EntityKind::TaskList, list_id).await?;
                    let parent = match parent_id {
                        Some(parent) => Some(self.require_remote_id(EntityKind::Task, parent).await?),
                        None => None,
                    };
                    let previous = self.optional_remote_id(previous_id.as_deref()).await;
                    let created = self
                        .remote
                        .create_task(&list, fields, parent.as_deref(), previous.as_deref(), cancel)
                        .await?;
                    self.repo
                        .update_remote_id(EntityKind::Task, id, &created.remote_id)
                        .await?;
                }
            }
            ChangePayload::UpdateTask { list_id, fields } => {
                let list = self.require_remote_id(EntityKind::TaskList, list_id).await?;
                let task = self.require_remote_id(EntityKind::Task, id).await?;
                let updated = self.remote.update_task(&list, &task, fields, cancel).await;
                gone_remotely(updated, EntityKind::Task, id)?;
            }
            ChangePayload::DeleteTask { list_id } => {
                if let Some(task) = self.repo.remote_id(EntityKind::Task, id).await? {
                    let list = self.require_remote_id(EntityKind::TaskList, list_id).await?;
                    tolerate_missing(self.remote.delete_task(&list, &task, cancel).await)?;
                }
                return self.repo.remove_entity(EntityKind::Task, id).await;
            }
            ChangePayload::MoveTask {
                list_id,
                parent_id,
                previous_id,
            } => {
                let list = self.require_remote_id(EntityKind::TaskList, list_id).await?;
                let task = self.require_remote_id(EntityKind::Task, id).await?;
                let parent = match parent_id {
                    Some(parent) => Some(self.require_remote_id(EntityKind::Task, parent).await?),
                    None => None,
                };
                let previous = self.optional_remote_id(previous_id.as_deref()).await;
                let moved = self
                    .remote
                    .move_task(&list, &task, parent.as_deref(), previous.as_deref(), cancel)
                    .await;
                gone_remotely(moved, EntityKind::Task, id)?;
            }
        }
        self.repo.remove_pending_change(change.id).await
    }

    async fn require_remote_id(&self, kind: EntityKind, local_id: &str) -> Result<String, SyncError> {
        self.repo
            .remote_id(kind, local_id)
            .await?
            .ok_or_else(|| SyncError::Unbound {
                kind,
                id: local_id.to_string(),
            })
    }

    /// Sibling placement is a hint; an unknown or unbound sibling means
    /// "first position".
    async fn optional_remote_id(&self, local_id: Option<&str>) -> Option<String> {
        let local_id = local_id?;
        self.repo
            .remote_id(EntityKind::Task, local_id)
            .await
            .ok()
            .flatten()
    }

    async fn pull_changes(&self, cancel: &CancelToken) -> Phase {
        let mut result = SyncResult::default();
        let mut fatal = None;
        match self.pull_all(cancel, &mut result).await {
            Ok(observed) => match self
                .repo
                .mark_orphans(&observed, self.options.orphan_scope())
                .await
            {
                Ok(report) => {
                    if report.lists_removed + report.tasks_removed > 0 {
                        info!(
                            lists = report.lists_removed,
                            tasks = report.tasks_removed,
                            "removed entities deleted remotely"
                        );
                    }
                }
                Err(err) => result.errors.push(format!("Pull failed: {err}")),
            },
            Err(err) => {
                warn!(error = %err, "pull failed");
                result.errors.push(format!("Pull failed: {err}"));
                if err.is_fatal() {
                    fatal = Some(err);
                }
            }
        }
        Phase {
            result: result.finish(),
            fatal,
        }
    }

    /// Upsert every remote list and task. Returns the remote ids observed.
    async fn pull_all(
        &self,
        cancel: &CancelToken,
        result: &mut SyncResult,
    ) -> Result<HashSet<String>, SyncError> {
        let mut observed = HashSet::new();
        let lists = fetch_all_task_lists(self.remote.as_ref(), cancel).await?;
        debug!(count = lists.len(), "pulled task lists");

        for remote_list in lists {
            observed.insert(remote_list.remote_id.clone());
            let upsert = self.repo.upsert_task_list_from_remote(&remote_list).await?;
            result.items_pulled += 1;
            if upsert.outcome.conflict {
                result.conflicts += 1;
            }

            let tasks = fetch_all_tasks(
                self.remote.as_ref(),
                &remote_list.remote_id,
                self.options.include_completed,
                self.options.include_hidden,
                cancel,
            )
            .await?;
            debug!(list = %remote_list.remote_id, count = tasks.len(), "pulled tasks");

            for task in parents_first(tasks) {
                observed.insert(task.remote_id.clone());
                let outcome = self
                    .repo
                    .upsert_task_from_remote(&upsert.local_id, &task)
                    .await?;
                result.items_pulled += 1;
                if outcome.conflict {
                    result.conflicts += 1;
                }
            }
        }
        Ok(observed)
    }
}

fn describe_failure(change: &PendingChange, err: &SyncError) -> String {
    format!("Failed to sync {}: {err}", change.describe())
}

/// A delete whose target is already gone has done its job.
fn tolerate_missing(result: Result<(), SyncError>) -> Result<(), SyncError> {
    match result {
        Err(SyncError::Remote {
            status: Some(404 | 410),
            ..
        }) => Ok(()),
        other => other,
    }
}

/// A 404/410 while editing an entity means it was deleted remotely; the
/// change is dropped and the pull reconciles the local copy.
fn gone_remotely<T>(result: Result<T, SyncError>, kind: EntityKind, id: &str) -> Result<T, SyncError> {
    match result {
        Err(SyncError::Remote {
            status: Some(404 | 410),
            ..
        }) => Err(SyncError::NotFound {
            kind,
            id: id.to_string(),
        }),
        other => other,
    }
}

/// Order tasks so every parent precedes its children. Tasks whose parent is
/// not in the batch count as roots. Relative order is otherwise kept.
pub(crate) fn parents_first(tasks: Vec<RemoteTask>) -> Vec<RemoteTask> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.remote_id.as_str()).collect();
    let parents: HashMap<&str, &str> = tasks
        .iter()
        .filter_map(|t| Some((t.remote_id.as_str(), t.parent_remote_id.as_deref()?)))
        .filter(|(_, parent)| ids.contains(parent))
        .collect();

    let depth_of = |id: &str| -> usize {
        let mut depth = 0;
        let mut current = id;
        // A malformed parent cycle stops at the batch size.
        while let Some(parent) = parents.get(current) {
            depth += 1;
            if depth > tasks.len() {
                break;
            }
            current = parent;
        }
        depth
    };

    let depths: Vec<usize> = tasks.iter().map(|t| depth_of(&t.remote_id)).collect();
    let mut ranked: Vec<(usize, RemoteTask)> = depths.into_iter().zip(tasks.iter().cloned()).collect();
    ranked.sort_by_key(|(depth, _)| *depth);
    ranked.into_iter().map(|(_, task)| task).collect()
}
