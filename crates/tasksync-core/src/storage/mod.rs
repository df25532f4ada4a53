pub mod config;
pub mod migrations;
pub mod repository;
pub mod task_db;

#[cfg(test)]
mod task_db_tests;

pub use config::Config;
pub use repository::{
    ListUpsert, OrphanReport, OrphanScope, TaskFilter, TaskRepository, UpsertOutcome,
};
pub use task_db::TaskDb;

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns `~/.config/tasksync[-dev]/` based on TASKSYNC_ENV.
///
/// Set TASKSYNC_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("TASKSYNC_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("tasksync-dev")
    } else {
        base_dir.join("tasksync")
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
