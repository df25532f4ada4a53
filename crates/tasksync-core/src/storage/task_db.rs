//! SQLite-backed task store and pending-change ledger.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::migrations;
use super::repository::{
    local_today_start, ListUpsert, OrphanReport, OrphanScope, TaskFilter, TaskRepository, UpsertOutcome,
    SEARCH_LIMIT,
};
use crate::error::{DatabaseError, SyncError, ValidationError};
use crate::model::{
    ChangeOperation, ChangePayload, EntityKind, NewTask, PendingChange, RemoteTask,
    RemoteTaskList, SyncState, TaskItem, TaskLink, TaskList, TaskPatch, TaskStatus,
};
use crate::sync::conflict_resolver::{self, LocalVersion, Resolution};

// === Helper Functions ===

/// Format a timestamp for storage. Fixed precision keeps text ordering chronological.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse datetime from RFC3339 string with fallback to the epoch
fn parse_datetime_fallback(dt_str: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn parse_datetime_opt(dt_str: Option<String>) -> Option<DateTime<Utc>> {
    dt_str
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Table holding entities of `kind`
fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::TaskList => "task_lists",
        EntityKind::Task => "tasks",
    }
}

/// Sibling ordering key for locally created tasks; replaced by the remote one on pull.
fn local_position(now: DateTime<Utc>) -> String {
    format!("{:020}", now.timestamp_micros())
}

fn pending_deletion(kind: EntityKind, id: &str) -> SyncError {
    SyncError::Validation(ValidationError::PendingDeletion {
        kind,
        id: id.to_string(),
    })
}

fn invalid(field: &str, message: impl Into<String>) -> SyncError {
    SyncError::Validation(ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    })
}

fn missing_change(id: i64) -> SyncError {
    SyncError::Persistence(DatabaseError::QueryFailed(format!(
        "pending change {id} not found"
    )))
}

const LIST_COLUMNS: &str = "local_id, remote_id, title, updated_at, sync_state";

/// Build a TaskList from a database row
fn row_to_task_list(row: &rusqlite::Row) -> Result<TaskList, rusqlite::Error> {
    let updated_at: String = row.get(3)?;
    let sync_state: String = row.get(4)?;
    Ok(TaskList {
        local_id: row.get(0)?,
        remote_id: row.get(1)?,
        title: row.get(2)?,
        updated_at: parse_datetime_fallback(&updated_at),
        sync_state: SyncState::parse(&sync_state),
    })
}

const TASK_COLUMNS: &str = "local_id, remote_id, list_id, parent_id, title, notes, status, due, \
     completed_at, position, deleted, hidden, created_at, updated_at, sync_state";

/// Build a TaskItem from a database row. Links are attached separately.
fn row_to_task(row: &rusqlite::Row) -> Result<TaskItem, rusqlite::Error> {
    let status: String = row.get(6)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    let sync_state: String = row.get(14)?;
    Ok(TaskItem {
        local_id: row.get(0)?,
        remote_id: row.get(1)?,
        list_id: row.get(2)?,
        parent_id: row.get(3)?,
        title: row.get(4)?,
        notes: row.get(5)?,
        status: TaskStatus::parse(&status),
        due: parse_datetime_opt(row.get(7)?),
        completed_at: parse_datetime_opt(row.get(8)?),
        position: row.get(9)?,
        deleted: row.get(10)?,
        hidden: row.get(11)?,
        links: Vec::new(),
        created_at: parse_datetime_fallback(&created_at),
        updated_at: parse_datetime_fallback(&updated_at),
        sync_state: SyncState::parse(&sync_state),
    })
}

/// Raw ledger row; the payload is decoded outside the rusqlite closure.
struct ChangeRow {
    id: i64,
    entity_id: String,
    payload: String,
    created_at: String,
    attempts: u32,
    last_error: Option<String>,
}

impl ChangeRow {
    fn decode(self) -> Result<PendingChange, SyncError> {
        Ok(PendingChange {
            id: self.id,
            entity_id: self.entity_id,
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_datetime_fallback(&self.created_at),
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

// === Transaction-scoped queries ===

fn load_task_list(conn: &Connection, local_id: &str) -> Result<Option<TaskList>, SyncError> {
    let sql = format!("SELECT {LIST_COLUMNS} FROM task_lists WHERE local_id = ?1");
    Ok(conn
        .query_row(&sql, params![local_id], row_to_task_list)
        .optional()?)
}

fn load_task(conn: &Connection, local_id: &str) -> Result<Option<TaskItem>, SyncError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE local_id = ?1");
    let task = conn
        .query_row(&sql, params![local_id], row_to_task)
        .optional()?;
    match task {
        Some(mut task) => {
            task.links = load_links(conn, &task.local_id)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

fn load_links(conn: &Connection, task_id: &str) -> Result<Vec<TaskLink>, SyncError> {
    let mut stmt = conn.prepare(
        "SELECT link_type, description, url FROM task_links
         WHERE task_id = ?1 ORDER BY ordinal",
    )?;
    let links = stmt
        .query_map(params![task_id], |row| {
            Ok(TaskLink {
                link_type: row.get(0)?,
                description: row.get(1)?,
                url: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}

fn query_tasks(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<TaskItem>, SyncError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {where_clause}");
    let mut stmt = conn.prepare(&sql)?;
    let mut tasks = stmt
        .query_map(args, row_to_task)?
        .collect::<Result<Vec<_>, _>>()?;
    for task in &mut tasks {
        task.links = load_links(conn, &task.local_id)?;
    }
    Ok(tasks)
}

/// Visible tasks: not deleted, not hidden, not pending deletion, in a visible list.
const VISIBLE_TASKS: &str = "deleted = 0 AND hidden = 0 AND sync_state != 'pending_delete' \
     AND list_id IN (SELECT local_id FROM task_lists WHERE sync_state != 'pending_delete')";

fn replace_links(conn: &Connection, task_id: &str, links: &[TaskLink]) -> Result<(), SyncError> {
    conn.execute("DELETE FROM task_links WHERE task_id = ?1", params![task_id])?;
    for (ordinal, link) in links.iter().enumerate() {
        conn.execute(
            "INSERT INTO task_links (task_id, ordinal, link_type, description, url)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, ordinal as i64, link.link_type, link.description, link.url],
        )?;
    }
    Ok(())
}

fn insert_change(
    conn: &Connection,
    entity_id: &str,
    payload: &ChangePayload,
    now: DateTime<Utc>,
) -> Result<i64, SyncError> {
    let json = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO pending_changes (entity_type, entity_id, operation, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            payload.kind().as_str(),
            entity_id,
            payload.operation().as_str(),
            json,
            format_datetime(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn entity_state(
    conn: &Connection,
    kind: EntityKind,
    local_id: &str,
) -> Result<Option<SyncState>, SyncError> {
    let sql = format!("SELECT sync_state FROM {} WHERE local_id = ?1", table_for(kind));
    let state: Option<String> = conn
        .query_row(&sql, params![local_id], |row| row.get(0))
        .optional()?;
    Ok(state.as_deref().map(SyncState::parse))
}

fn set_entity_state(
    conn: &Connection,
    kind: EntityKind,
    local_id: &str,
    state: SyncState,
) -> Result<(), SyncError> {
    let sql = format!("UPDATE {} SET sync_state = ?1 WHERE local_id = ?2", table_for(kind));
    conn.execute(&sql, params![state.as_str(), local_id])?;
    Ok(())
}

/// Operations still queued for an entity, in ledger order.
fn outstanding_ops(
    conn: &Connection,
    kind: EntityKind,
    local_id: &str,
) -> Result<Vec<ChangeOperation>, SyncError> {
    let mut stmt = conn.prepare(
        "SELECT operation FROM pending_changes
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at, id",
    )?;
    let ops = stmt
        .query_map(params![kind.as_str(), local_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ops.iter().filter_map(|op| ChangeOperation::parse(op)).collect())
}

/// Recompute an entity's state from what is left in the ledger.
fn refresh_state(
    conn: &Connection,
    kind: EntityKind,
    local_id: &str,
    base: Option<SyncState>,
) -> Result<(), SyncError> {
    let Some(current) = entity_state(conn, kind, local_id)? else {
        return Ok(());
    };
    let ops = outstanding_ops(conn, kind, local_id)?;
    let next = base.unwrap_or(current).from_outstanding(&ops);
    if next != current {
        set_entity_state(conn, kind, local_id, next)?;
    }
    Ok(())
}

fn has_outstanding(conn: &Connection, kind: EntityKind, local_id: &str) -> Result<bool, SyncError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_changes WHERE entity_type = ?1 AND entity_id = ?2",
        params![kind.as_str(), local_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn discard_changes(conn: &Connection, kind: EntityKind, local_id: &str) -> Result<(), SyncError> {
    conn.execute(
        "DELETE FROM pending_changes WHERE entity_type = ?1 AND entity_id = ?2",
        params![kind.as_str(), local_id],
    )?;
    Ok(())
}

/// Local ids of a task and all of its descendants.
fn task_subtree(conn: &Connection, local_id: &str) -> Result<Vec<String>, SyncError> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE subtree(id) AS (
             SELECT ?1
             UNION
             SELECT t.local_id FROM tasks t JOIN subtree s ON t.parent_id = s.id
         )
         SELECT id FROM subtree",
    )?;
    let ids = stmt
        .query_map(params![local_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Remove a task subtree with its ledger entries. Returns the number of tasks removed.
fn purge_task(conn: &Connection, local_id: &str) -> Result<usize, SyncError> {
    let ids = task_subtree(conn, local_id)?;
    let mut removed = 0;
    for id in &ids {
        discard_changes(conn, EntityKind::Task, id)?;
        removed += conn.execute("DELETE FROM tasks WHERE local_id = ?1", params![id])?;
    }
    Ok(removed)
}

/// Remove a list, its tasks and every related ledger entry. Returns the number of tasks removed.
fn purge_task_list(conn: &Connection, local_id: &str) -> Result<usize, SyncError> {
    conn.execute(
        "DELETE FROM pending_changes
         WHERE entity_type = ?1
           AND entity_id IN (SELECT local_id FROM tasks WHERE list_id = ?2)",
        params![EntityKind::Task.as_str(), local_id],
    )?;
    discard_changes(conn, EntityKind::TaskList, local_id)?;
    let tasks = conn.execute("DELETE FROM tasks WHERE list_id = ?1", params![local_id])?;
    conn.execute("DELETE FROM task_lists WHERE local_id = ?1", params![local_id])?;
    Ok(tasks)
}

fn local_id_by_remote(
    conn: &Connection,
    kind: EntityKind,
    remote_id: &str,
) -> Result<Option<String>, SyncError> {
    let sql = format!("SELECT local_id FROM {} WHERE remote_id = ?1", table_for(kind));
    Ok(conn
        .query_row(&sql, params![remote_id], |row| row.get(0))
        .optional()?)
}

/// A list that accepts new or edited tasks.
fn writable_list(conn: &Connection, list_id: &str) -> Result<TaskList, SyncError> {
    let list = load_task_list(conn, list_id)?
        .ok_or_else(|| SyncError::not_found(EntityKind::TaskList, list_id))?;
    if list.sync_state == SyncState::PendingDelete {
        return Err(pending_deletion(EntityKind::TaskList, list_id));
    }
    Ok(list)
}

/// A task in `list_id` usable as a parent or predecessor.
fn sibling_in_list(
    conn: &Connection,
    field: &str,
    task_id: &str,
    list_id: &str,
) -> Result<TaskItem, SyncError> {
    let task = load_task(conn, task_id)?
        .ok_or_else(|| SyncError::not_found(EntityKind::Task, task_id))?;
    if task.list_id != list_id {
        return Err(invalid(field, format!("task {task_id} belongs to another list")));
    }
    if task.sync_state == SyncState::PendingDelete {
        return Err(pending_deletion(EntityKind::Task, task_id));
    }
    Ok(task)
}

/// SQLite task store.
///
/// A single connection guarded by a mutex; every public method runs in its
/// own transaction.
pub struct TaskDb {
    conn: Mutex<Connection>,
}

impl TaskDb {
    /// Open the database at `~/.config/tasksync/tasksync.db`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> crate::error::Result<Self> {
        let path = super::data_dir()?.join("tasksync.db");
        Ok(Self::open_at(&path)?)
    }

    /// Open (creating if needed) the database at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_at(path: &Path) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init(conn)
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory().map_err(|source| DatabaseError::OpenFailed {
            path: ":memory:".into(),
            source,
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Persistence(DatabaseError::Poisoned))
    }

    /// Run `f` inside a transaction, committing on success.
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // === Queries ===

    pub fn get_task_lists(&self) -> Result<Vec<TaskList>, SyncError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {LIST_COLUMNS} FROM task_lists
             WHERE sync_state != 'pending_delete'
             ORDER BY title COLLATE NOCASE, local_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let lists = stmt
            .query_map([], row_to_task_list)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lists)
    }

    pub fn get_task_list(&self, local_id: &str) -> Result<Option<TaskList>, SyncError> {
        let conn = self.lock()?;
        Ok(load_task_list(&conn, local_id)?.filter(|l| l.sync_state != SyncState::PendingDelete))
    }

    pub fn get_tasks(&self, list_id: &str) -> Result<Vec<TaskItem>, SyncError> {
        let conn = self.lock()?;
        query_tasks(
            &conn,
            &format!("list_id = ?1 AND {VISIBLE_TASKS} ORDER BY position, created_at"),
            &[&list_id as &dyn rusqlite::ToSql],
        )
    }

    pub fn get_task(&self, local_id: &str) -> Result<Option<TaskItem>, SyncError> {
        let conn = self.lock()?;
        load_task(&conn, local_id)
    }

    pub fn search(&self, query: &str) -> Result<Vec<TaskItem>, SyncError> {
        let needle = query.to_lowercase();
        let conn = self.lock()?;
        let mut hits: Vec<TaskItem> = query_tasks(&conn, VISIBLE_TASKS, &[])?
            .into_iter()
            .filter(|t| {
                t.title.to_lowercase().contains(&needle) || t.notes.to_lowercase().contains(&needle)
            })
            .collect();
        hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        hits.truncate(SEARCH_LIMIT);
        Ok(hits)
    }

    pub fn filter(&self, filter: &TaskFilter) -> Result<Vec<TaskItem>, SyncError> {
        let conn = self.lock()?;
        let tasks = query_tasks(&conn, VISIBLE_TASKS, &[])?;
        Ok(filter.apply(tasks, local_today_start()))
    }

    // === Local mutations ===

    pub fn insert_task_list(&self, title: &str) -> Result<TaskList, SyncError> {
        if title.trim().is_empty() {
            return Err(invalid("title", "must not be empty"));
        }
        let now = Utc::now();
        let list = TaskList {
            local_id: Uuid::new_v4().to_string(),
            remote_id: None,
            title: title.to_string(),
            updated_at: now,
            sync_state: SyncState::PendingCreate,
        };
        self.write(|tx| {
            tx.execute(
                "INSERT INTO task_lists (local_id, remote_id, title, updated_at, sync_state)
                 VALUES (?1, NULL, ?2, ?3, ?4)",
                params![
                    list.local_id,
                    list.title,
                    format_datetime(now),
                    list.sync_state.as_str()
                ],
            )?;
            insert_change(
                tx,
                &list.local_id,
                &ChangePayload::CreateList {
                    title: list.title.clone(),
                },
                now,
            )?;
            Ok(())
        })?;
        Ok(list)
    }

    pub fn rename_list(&self, local_id: &str, title: &str) -> Result<TaskList, SyncError> {
        if title.trim().is_empty() {
            return Err(invalid("title", "must not be empty"));
        }
        let now = Utc::now();
        self.write(|tx| {
            let mut list = load_task_list(tx, local_id)?
                .ok_or_else(|| SyncError::not_found(EntityKind::TaskList, local_id))?;
            list.sync_state = list
                .sync_state
                .after_local_mutation(ChangeOperation::Update)
                .ok_or_else(|| pending_deletion(EntityKind::TaskList, local_id))?;
            list.title = title.to_string();
            list.updated_at = now;
            tx.execute(
                "UPDATE task_lists SET title = ?1, updated_at = ?2, sync_state = ?3
                 WHERE local_id = ?4",
                params![
                    list.title,
                    format_datetime(now),
                    list.sync_state.as_str(),
                    local_id
                ],
            )?;
            insert_change(
                tx,
                local_id,
                &ChangePayload::UpdateList {
                    title: list.title.clone(),
                },
                now,
            )?;
            Ok(list)
        })
    }

    pub fn remove_task_list(&self, local_id: &str) -> Result<(), SyncError> {
        let now = Utc::now();
        self.write(|tx| {
            let list = load_task_list(tx, local_id)?
                .ok_or_else(|| SyncError::not_found(EntityKind::TaskList, local_id))?;
            let next = list
                .sync_state
                .after_local_mutation(ChangeOperation::Delete)
                .ok_or_else(|| pending_deletion(EntityKind::TaskList, local_id))?;

            if !list.is_remote() {
                purge_task_list(tx, local_id)?;
                return Ok(());
            }

            tx.execute(
                "UPDATE task_lists SET updated_at = ?1, sync_state = ?2 WHERE local_id = ?3",
                params![format_datetime(now), next.as_str(), local_id],
            )?;
            insert_change(tx, local_id, &ChangePayload::DeleteList, now)?;
            Ok(())
        })
    }

    pub fn insert_task(&self, list_id: &str, new: NewTask) -> Result<TaskItem, SyncError> {
        let now = Utc::now();
        self.write(|tx| {
            writable_list(tx, list_id)?;
            if let Some(parent_id) = &new.parent_id {
                sibling_in_list(tx, "parent_id", parent_id, list_id)?;
            }
            if let Some(previous_id) = &new.previous_id {
                let previous = sibling_in_list(tx, "previous_id", previous_id, list_id)?;
                if previous.parent_id != new.parent_id {
                    return Err(invalid("previous_id", "must share the new task's parent"));
                }
            }

            let task = TaskItem {
                local_id: Uuid::new_v4().to_string(),
                remote_id: None,
                list_id: list_id.to_string(),
                parent_id: new.parent_id.clone(),
                title: new.title.clone(),
                notes: new.notes.clone(),
                status: TaskStatus::NeedsAction,
                due: new.due,
                completed_at: None,
                position: local_position(now),
                deleted: false,
                hidden: false,
                links: Vec::new(),
                created_at: now,
                updated_at: now,
                sync_state: SyncState::PendingCreate,
            };
            tx.execute(
                "INSERT INTO tasks (local_id, remote_id, list_id, parent_id, title, notes, status,
                                    due, completed_at, position, deleted, hidden, created_at,
                                    updated_at, sync_state)
                 VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, 0, 0, ?9, ?9, ?10)",
                params![
                    task.local_id,
                    task.list_id,
                    task.parent_id,
                    task.title,
                    task.notes,
                    task.status.as_str(),
                    task.due.map(format_datetime),
                    task.position,
                    format_datetime(now),
                    task.sync_state.as_str(),
                ],
            )?;
            insert_change(
                tx,
                &task.local_id,
                &ChangePayload::CreateTask {
                    list_id: list_id.to_string(),
                    parent_id: new.parent_id,
                    previous_id: new.previous_id,
                    fields: task.fields(),
                },
                now,
            )?;
            Ok(task)
        })
    }

    pub fn patch_task(&self, local_id: &str, patch: TaskPatch) -> Result<TaskItem, SyncError> {
        let now = Utc::now();
        self.write(|tx| {
            let mut task = load_task(tx, local_id)?
                .ok_or_else(|| SyncError::not_found(EntityKind::Task, local_id))?;
            let next = task
                .sync_state
                .after_local_mutation(ChangeOperation::Update)
                .ok_or_else(|| pending_deletion(EntityKind::Task, local_id))?;
            writable_list(tx, &task.list_id)?;
            if patch.is_empty() {
                return Ok(task);
            }

            let mut fields = task.fields();
            patch.apply(&mut fields, now);
            task.title = fields.title.clone();
            task.notes = fields.notes.clone();
            task.status = fields.status;
            task.due = fields.due;
            task.completed_at = fields.completed_at;
            task.updated_at = now;
            task.sync_state = next;

            tx.execute(
                "UPDATE tasks SET title = ?1, notes = ?2, status = ?3, due = ?4, completed_at = ?5,
                                  updated_at = ?6, sync_state = ?7
                 WHERE local_id = ?8",
                params![
                    task.title,
                    task.notes,
                    task.status.as_str(),
                    task.due.map(format_datetime),
                    task.completed_at.map(format_datetime),
                    format_datetime(now),
                    task.sync_state.as_str(),
                    local_id,
                ],
            )?;
            insert_change(
                tx,
                local_id,
                &ChangePayload::UpdateTask {
                    list_id: task.list_id.clone(),
                    fields,
                },
                now,
            )?;
            Ok(task)
        })
    }

    pub fn remove_task(&self, local_id: &str) -> Result<(), SyncError> {
        let now = Utc::now();
        self.write(|tx| {
            let task = load_task(tx, local_id)?
                .ok_or_else(|| SyncError::not_found(EntityKind::Task, local_id))?;
            let next = task
                .sync_state
                .after_local_mutation(ChangeOperation::Delete)
                .ok_or_else(|| pending_deletion(EntityKind::Task, local_id))?;

            if task.remote_id.as_deref().map_or(true, str::is_empty) {
                purge_task(tx, local_id)?;
                return Ok(());
            }

            tx.execute(
                "UPDATE tasks SET updated_at = ?1, sync_state = ?2 WHERE local_id = ?3",
                params![format_datetime(now), next.as_str(), local_id],
            )?;
            insert_change(
                tx,
                local_id,
                &ChangePayload::DeleteTask {
                    list_id: task.list_id,
                },
                now,
            )?;
            Ok(())
        })
    }

    pub fn relocate_task(
        &self,
        local_id: &str,
        parent_id: Option<&str>,
        previous_id: Option<&str>,
    ) -> Result<TaskItem, SyncError> {
        let now = Utc::now();
        self.write(|tx| {
            let mut task = load_task(tx, local_id)?
                .ok_or_else(|| SyncError::not_found(EntityKind::Task, local_id))?;
            let next = task
                .sync_state
                .after_local_mutation(ChangeOperation::Move)
                .ok_or_else(|| pending_deletion(EntityKind::Task, local_id))?;
            writable_list(tx, &task.list_id)?;

            if let Some(parent_id) = parent_id {
                sibling_in_list(tx, "parent_id", parent_id, &task.list_id)?;
                if task_subtree(tx, local_id)?.iter().any(|id| id == parent_id) {
                    return Err(invalid("parent_id", "a task cannot move under itself"));
                }
            }
            if let Some(previous_id) = previous_id {
                if previous_id == local_id {
                    return Err(invalid("previous_id", "a task cannot follow itself"));
                }
                let previous = sibling_in_list(tx, "previous_id", previous_id, &task.list_id)?;
                if previous.parent_id.as_deref() != parent_id {
                    return Err(invalid("previous_id", "must share the target parent"));
                }
            }

            task.parent_id = parent_id.map(str::to_string);
            task.updated_at = now;
            task.sync_state = next;
            tx.execute(
                "UPDATE tasks SET parent_id = ?1, updated_at = ?2, sync_state = ?3
                 WHERE local_id = ?4",
                params![
                    task.parent_id,
                    format_datetime(now),
                    task.sync_state.as_str(),
                    local_id
                ],
            )?;
            insert_change(
                tx,
                local_id,
                &ChangePayload::MoveTask {
                    list_id: task.list_id.clone(),
                    parent_id: task.parent_id.clone(),
                    previous_id: previous_id.map(str::to_string),
                },
                now,
            )?;
            Ok(task)
        })
    }

    // === Ledger ===

    pub fn enqueue(&self, entity_id: &str, payload: ChangePayload) -> Result<i64, SyncError> {
        let now = Utc::now();
        let kind = payload.kind();
        self.write(|tx| {
            let state = entity_state(tx, kind, entity_id)?
                .ok_or_else(|| SyncError::not_found(kind, entity_id))?;
            let next = state
                .after_local_mutation(payload.operation())
                .ok_or_else(|| pending_deletion(kind, entity_id))?;
            set_entity_state(tx, kind, entity_id, next)?;
            insert_change(tx, entity_id, &payload, now)
        })
    }

    pub fn list_pending_changes(&self) -> Result<Vec<PendingChange>, SyncError> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, entity_id, payload, created_at, attempts, last_error
                 FROM pending_changes ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ChangeRow {
                        id: row.get(0)?,
                        entity_id: row.get(1)?,
                        payload: row.get(2)?,
                        created_at: row.get(3)?,
                        attempts: row.get(4)?,
                        last_error: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(ChangeRow::decode).collect()
    }

    pub fn count_pending_changes(&self) -> Result<usize, SyncError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_changes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Entity behind a ledger entry.
    fn change_entity(conn: &Connection, id: i64) -> Result<Option<(EntityKind, String)>, SyncError> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT entity_type, entity_id FROM pending_changes WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(kind, entity_id)| EntityKind::parse(&kind).map(|k| (k, entity_id))))
    }

    pub fn acknowledge_change(&self, id: i64) -> Result<(), SyncError> {
        self.write(|tx| {
            let Some((kind, entity_id)) = Self::change_entity(tx, id)? else {
                return Ok(());
            };
            tx.execute("DELETE FROM pending_changes WHERE id = ?1", params![id])?;
            refresh_state(tx, kind, &entity_id, None)
        })
    }

    pub fn fail_change(&self, id: i64, error: &str) -> Result<u32, SyncError> {
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE pending_changes SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
                params![error, id],
            )?;
            if updated == 0 {
                return Err(missing_change(id));
            }
            let attempts: u32 = tx.query_row(
                "SELECT attempts FROM pending_changes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(attempts)
        })
    }

    pub fn rearm_change(&self, id: i64) -> Result<(), SyncError> {
        self.write(|tx| {
            let (kind, entity_id) = Self::change_entity(tx, id)?.ok_or_else(|| missing_change(id))?;
            tx.execute(
                "UPDATE pending_changes SET attempts = 0, last_error = NULL WHERE id = ?1",
                params![id],
            )?;
            if entity_state(tx, kind, &entity_id)? == Some(SyncState::Conflict) {
                refresh_state(tx, kind, &entity_id, Some(SyncState::Synced))?;
            }
            Ok(())
        })
    }

    // === Sync support ===

    pub fn lookup_remote_id(
        &self,
        kind: EntityKind,
        local_id: &str,
    ) -> Result<Option<String>, SyncError> {
        let conn = self.lock()?;
        let sql = format!("SELECT remote_id FROM {} WHERE local_id = ?1", table_for(kind));
        let row: Option<Option<String>> = conn
            .query_row(&sql, params![local_id], |row| row.get(0))
            .optional()?;
        match row {
            Some(remote_id) => Ok(remote_id.filter(|id| !id.is_empty())),
            None => Err(SyncError::not_found(kind, local_id)),
        }
    }

    pub fn bind_remote_id(
        &self,
        kind: EntityKind,
        local_id: &str,
        remote_id: &str,
    ) -> Result<(), SyncError> {
        self.write(|tx| {
            let sql = format!("SELECT remote_id FROM {} WHERE local_id = ?1", table_for(kind));
            let current: Option<String> = tx
                .query_row(&sql, params![local_id], |row| row.get(0))
                .optional()?
                .ok_or_else(|| SyncError::not_found(kind, local_id))?;

            match current.as_deref() {
                Some(existing) if existing == remote_id => Ok(()),
                Some(existing) if !existing.is_empty() => Err(SyncError::Conflict(format!(
                    "{kind} {local_id} is already bound to {existing}"
                ))),
                _ => {
                    let sql = format!(
                        "UPDATE {} SET remote_id = ?1 WHERE local_id = ?2",
                        table_for(kind)
                    );
                    tx.execute(&sql, params![remote_id, local_id])?;
                    Ok(())
                }
            }
        })
    }

    pub fn drop_entity(&self, kind: EntityKind, local_id: &str) -> Result<(), SyncError> {
        self.write(|tx| {
            match kind {
                EntityKind::TaskList => {
                    purge_task_list(tx, local_id)?;
                }
                EntityKind::Task => {
                    purge_task(tx, local_id)?;
                }
            }
            Ok(())
        })
    }

    pub fn set_conflict(&self, kind: EntityKind, local_id: &str) -> Result<(), SyncError> {
        self.write(|tx| {
            if entity_state(tx, kind, local_id)?.is_none() {
                return Err(SyncError::not_found(kind, local_id));
            }
            set_entity_state(tx, kind, local_id, SyncState::Conflict)
        })
    }

    pub fn merge_remote_list(&self, remote: &RemoteTaskList) -> Result<ListUpsert, SyncError> {
        self.write(|tx| {
            let existing = match local_id_by_remote(tx, EntityKind::TaskList, &remote.remote_id)? {
                Some(local_id) => load_task_list(tx, &local_id)?,
                None => None,
            };
            let local = existing.as_ref().map(|l| LocalVersion {
                updated_at: l.updated_at,
                sync_state: l.sync_state,
            });
            let resolution = conflict_resolver::resolve(local, remote.updated_at);
            let conflict = conflict_resolver::is_conflict(local);

            let local_id = match (resolution, existing) {
                (Resolution::Insert, _) | (_, None) => {
                    let local_id = Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO task_lists (local_id, remote_id, title, updated_at, sync_state)
                         VALUES (?1, ?2, ?3, ?4, 'synced')",
                        params![
                            local_id,
                            remote.remote_id,
                            remote.title,
                            format_datetime(remote.updated_at)
                        ],
                    )?;
                    local_id
                }
                (Resolution::ApplyRemote, Some(list)) => {
                    tx.execute(
                        "UPDATE task_lists SET title = ?1, updated_at = ?2, sync_state = 'synced'
                         WHERE local_id = ?3",
                        params![remote.title, format_datetime(remote.updated_at), list.local_id],
                    )?;
                    discard_changes(tx, EntityKind::TaskList, &list.local_id)?;
                    list.local_id
                }
                (Resolution::KeepLocal, Some(list)) => list.local_id,
            };

            if conflict {
                debug!(list = %local_id, ?resolution, "remote list met unpushed local edits");
            }
            Ok(ListUpsert {
                local_id,
                outcome: UpsertOutcome {
                    resolution,
                    conflict,
                },
            })
        })
    }

    pub fn merge_remote_task(
        &self,
        list_id: &str,
        remote: &RemoteTask,
    ) -> Result<UpsertOutcome, SyncError> {
        self.write(|tx| {
            let existing = match local_id_by_remote(tx, EntityKind::Task, &remote.remote_id)? {
                Some(local_id) => load_task(tx, &local_id)?,
                None => None,
            };
            let local = existing.as_ref().map(|t| LocalVersion {
                updated_at: t.updated_at,
                sync_state: t.sync_state,
            });
            let resolution = conflict_resolver::resolve(local, remote.updated_at);
            let conflict = conflict_resolver::is_conflict(local);

            let parent_id = match &remote.parent_remote_id {
                Some(parent) => local_id_by_remote(tx, EntityKind::Task, parent)?,
                None => None,
            };

            match (resolution, existing) {
                (Resolution::Insert, _) | (_, None) => {
                    let local_id = Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO tasks (local_id, remote_id, list_id, parent_id, title, notes,
                                            status, due, completed_at, position, deleted, hidden,
                                            created_at, updated_at, sync_state)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'synced')",
                        params![
                            local_id,
                            remote.remote_id,
                            list_id,
                            parent_id,
                            remote.title,
                            remote.notes,
                            remote.status.as_str(),
                            remote.due.map(format_datetime),
                            remote.completed_at.map(format_datetime),
                            remote.position,
                            remote.deleted,
                            remote.hidden,
                            format_datetime(Utc::now()),
                            format_datetime(remote.updated_at),
                        ],
                    )?;
                    replace_links(tx, &local_id, &remote.links)?;
                }
                (Resolution::ApplyRemote, Some(task)) => {
                    tx.execute(
                        "UPDATE tasks SET list_id = ?1, parent_id = ?2, title = ?3, notes = ?4,
                                          status = ?5, due = ?6, completed_at = ?7, position = ?8,
                                          deleted = ?9, hidden = ?10, updated_at = ?11,
                                          sync_state = 'synced'
                         WHERE local_id = ?12",
                        params![
                            list_id,
                            parent_id,
                            remote.title,
                            remote.notes,
                            remote.status.as_str(),
                            remote.due.map(format_datetime),
                            remote.completed_at.map(format_datetime),
                            remote.position,
                            remote.deleted,
                            remote.hidden,
                            format_datetime(remote.updated_at),
                            task.local_id,
                        ],
                    )?;
                    replace_links(tx, &task.local_id, &remote.links)?;
                    discard_changes(tx, EntityKind::Task, &task.local_id)?;
                }
                (Resolution::KeepLocal, Some(_)) => {}
            }

            Ok(UpsertOutcome {
                resolution,
                conflict,
            })
        })
    }

    pub fn remove_orphans(
        &self,
        observed: &HashSet<String>,
        scope: OrphanScope,
    ) -> Result<OrphanReport, SyncError> {
        self.write(|tx| {
            let mut report = OrphanReport::default();

            let bound_lists: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT local_id, remote_id FROM task_lists
                     WHERE remote_id IS NOT NULL AND remote_id != ''",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut observed_lists = HashSet::new();
            for (local_id, remote_id) in bound_lists {
                if observed.contains(&remote_id) {
                    observed_lists.insert(local_id);
                } else if !has_outstanding(tx, EntityKind::TaskList, &local_id)? {
                    report.tasks_removed += purge_task_list(tx, &local_id)?;
                    report.lists_removed += 1;
                }
            }

            if scope == OrphanScope::ListsOnly {
                return Ok(report);
            }

            let bound_tasks: Vec<(String, String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT local_id, remote_id, list_id FROM tasks
                     WHERE remote_id IS NOT NULL AND remote_id != ''",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            for (local_id, remote_id, list_id) in bound_tasks {
                if observed.contains(&remote_id)
                    || !observed_lists.contains(&list_id)
                    || has_outstanding(tx, EntityKind::Task, &local_id)?
                {
                    continue;
                }
                tx.execute(
                    "UPDATE tasks SET parent_id = NULL WHERE parent_id = ?1",
                    params![local_id],
                )?;
                report.tasks_removed +=
                    tx.execute("DELETE FROM tasks WHERE local_id = ?1", params![local_id])?;
            }

            Ok(report)
        })
    }
}

#[async_trait]
impl TaskRepository for TaskDb {
    async fn task_lists(&self) -> Result<Vec<TaskList>, SyncError> {
        self.get_task_lists()
    }

    async fn task_list(&self, local_id: &str) -> Result<Option<TaskList>, SyncError> {
        self.get_task_list(local_id)
    }

    async fn tasks(&self, list_id: &str) -> Result<Vec<TaskItem>, SyncError> {
        self.get_tasks(list_id)
    }

    async fn task(&self, local_id: &str) -> Result<Option<TaskItem>, SyncError> {
        self.get_task(local_id)
    }

    async fn search_tasks(&self, query: &str) -> Result<Vec<TaskItem>, SyncError> {
        self.search(query)
    }

    async fn tasks_by_filter(&self, filter: &TaskFilter) -> Result<Vec<TaskItem>, SyncError> {
        self.filter(filter)
    }

    async fn create_task_list(&self, title: &str) -> Result<TaskList, SyncError> {
        self.insert_task_list(title)
    }

    async fn rename_task_list(&self, local_id: &str, title: &str) -> Result<TaskList, SyncError> {
        self.rename_list(local_id, title)
    }

    async fn delete_task_list(&self, local_id: &str) -> Result<(), SyncError> {
        self.remove_task_list(local_id)
    }

    async fn create_task(&self, list_id: &str, task: NewTask) -> Result<TaskItem, SyncError> {
        self.insert_task(list_id, task)
    }

    async fn update_task(&self, local_id: &str, patch: TaskPatch) -> Result<TaskItem, SyncError> {
        self.patch_task(local_id, patch)
    }

    async fn delete_task(&self, local_id: &str) -> Result<(), SyncError> {
        self.remove_task(local_id)
    }

    async fn move_task(
        &self,
        local_id: &str,
        parent_id: Option<&str>,
        previous_id: Option<&str>,
    ) -> Result<TaskItem, SyncError> {
        self.relocate_task(local_id, parent_id, previous_id)
    }

    async fn enqueue_change(
        &self,
        entity_id: &str,
        payload: ChangePayload,
    ) -> Result<i64, SyncError> {
        self.enqueue(entity_id, payload)
    }

    async fn pending_changes(&self) -> Result<Vec<PendingChange>, SyncError> {
        self.list_pending_changes()
    }

    async fn pending_change_count(&self) -> Result<usize, SyncError> {
        self.count_pending_changes()
    }

    async fn remove_pending_change(&self, id: i64) -> Result<(), SyncError> {
        self.acknowledge_change(id)
    }

    async fn record_change_failure(&self, id: i64, error: &str) -> Result<u32, SyncError> {
        self.fail_change(id, error)
    }

    async fn reset_change_attempts(&self, id: i64) -> Result<(), SyncError> {
        self.rearm_change(id)
    }

    async fn remote_id(
        &self,
        kind: EntityKind,
        local_id: &str,
    ) -> Result<Option<String>, SyncError> {
        self.lookup_remote_id(kind, local_id)
    }

    async fn update_remote_id(
        &self,
        kind: EntityKind,
        local_id: &str,
        remote_id: &str,
    ) -> Result<(), SyncError> {
        self.bind_remote_id(kind, local_id, remote_id)
    }

    async fn remove_entity(&self, kind: EntityKind, local_id: &str) -> Result<(), SyncError> {
        self.drop_entity(kind, local_id)
    }

    async fn mark_conflict(&self, kind: EntityKind, local_id: &str) -> Result<(), SyncError> {
        self.set_conflict(kind, local_id)
    }

    async fn upsert_task_list_from_remote(
        &self,
        remote: &RemoteTaskList,
    ) -> Result<ListUpsert, SyncError> {
        self.merge_remote_list(remote)
    }

    async fn upsert_task_from_remote(
        &self,
        list_id: &str,
        remote: &RemoteTask,
    ) -> Result<UpsertOutcome, SyncError> {
        self.merge_remote_task(list_id, remote)
    }

    async fn mark_orphans(
        &self,
        observed: &HashSet<String>,
        scope: OrphanScope,
    ) -> Result<OrphanReport, SyncError> {
        self.remove_orphans(observed, scope)
    }
}
