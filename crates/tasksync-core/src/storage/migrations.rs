//! Database schema migrations for tasksync.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    match conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    }) {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: lists, tasks and the pending-change ledger.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS task_lists (
            local_id    TEXT PRIMARY KEY,
            remote_id   TEXT UNIQUE,
            title       TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            sync_state  TEXT NOT NULL DEFAULT 'synced'
        );

        CREATE TABLE IF NOT EXISTS tasks (
            local_id      TEXT PRIMARY KEY,
            remote_id     TEXT,
            list_id       TEXT NOT NULL REFERENCES task_lists(local_id) ON DELETE CASCADE,
            parent_id     TEXT,
            title         TEXT NOT NULL,
            notes         TEXT NOT NULL DEFAULT '',
            status        TEXT NOT NULL DEFAULT 'needsAction',
            due           TEXT,
            completed_at  TEXT,
            position      TEXT NOT NULL DEFAULT '',
            deleted       INTEGER NOT NULL DEFAULT 0,
            hidden        INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            sync_state    TEXT NOT NULL DEFAULT 'synced'
        );

        CREATE TABLE IF NOT EXISTS pending_changes (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type  TEXT NOT NULL,
            entity_id    TEXT NOT NULL,
            operation    TEXT NOT NULL,
            payload      TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0,
            last_error   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_remote_id ON tasks(remote_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_list_id ON tasks(list_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(due);
        CREATE INDEX IF NOT EXISTS idx_pending_changes_entity ON pending_changes(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_pending_changes_order ON pending_changes(created_at, id);",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()?;
    Ok(())
}

/// Migration v2: link attachments, kept in remote order.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS task_links (
            task_id      TEXT NOT NULL REFERENCES tasks(local_id) ON DELETE CASCADE,
            ordinal      INTEGER NOT NULL,
            link_type    TEXT NOT NULL DEFAULT '',
            description  TEXT NOT NULL DEFAULT '',
            url          TEXT NOT NULL,
            PRIMARY KEY (task_id, ordinal)
        );",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}
