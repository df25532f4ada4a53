//! Subcommands and the wiring they share.

pub mod auth;
pub mod config;
pub mod lists;
pub mod sync;
pub mod task;

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tasksync_core::auth::{AuthProvider, KeyringTokenProvider, StaticTokenProvider};
use tasksync_core::{Config, GoogleTasksClient, SyncEngine, TaskDb, TaskList, TaskRepository};

pub type CliResult = Result<(), Box<dyn Error>>;

/// Loaded configuration plus the opened store.
pub struct Context {
    pub config: Config,
    pub repo: Arc<TaskDb>,
}

impl Context {
    pub fn load() -> Result<Self, Box<dyn Error>> {
        let config = Config::load()?;
        let repo = TaskDb::open_at(&config.database_path()?)?;
        Ok(Self {
            config,
            repo: Arc::new(repo),
        })
    }

    /// `TASKSYNC_ACCESS_TOKEN` wins over tokens stored in the keyring.
    pub fn auth_provider(&self) -> Arc<dyn AuthProvider> {
        match StaticTokenProvider::from_env() {
            Some(provider) => Arc::new(provider),
            None => Arc::new(KeyringTokenProvider::new(self.config.auth.clone())),
        }
    }

    pub fn engine(&self) -> Result<Arc<SyncEngine>, Box<dyn Error>> {
        let client = GoogleTasksClient::new(self.auth_provider(), &self.config.remote)?;
        Ok(Arc::new(SyncEngine::new(
            self.repo.clone(),
            Arc::new(client),
            self.config.sync_options(),
        )))
    }

    /// Find a list by local id, or by title when exactly one list has it.
    pub async fn resolve_list(&self, key: &str) -> Result<TaskList, Box<dyn Error>> {
        if let Some(list) = self.repo.task_list(key).await? {
            return Ok(list);
        }
        let mut matches: Vec<TaskList> = self
            .repo
            .task_lists()
            .await?
            .into_iter()
            .filter(|l| l.title.eq_ignore_ascii_case(key))
            .collect();
        match matches.len() {
            0 => Err(format!("no task list matches '{key}'").into()),
            1 => Ok(matches.remove(0)),
            n => Err(format!("{n} task lists are titled '{key}'; use the list id").into()),
        }
    }
}

/// Parse a due date: RFC 3339, or a bare `YYYY-MM-DD` taken as midnight UTC.
pub fn parse_due(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| format!("invalid date '{s}': expected YYYY-MM-DD or RFC 3339"))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_due_accepts_date_and_rfc3339() {
        let date = parse_due("2026-10-20").unwrap();
        assert_eq!(date.to_rfc3339(), "2026-10-20T00:00:00+00:00");

        let full = parse_due("2026-10-20T15:30:00+02:00").unwrap();
        assert_eq!(full.to_rfc3339(), "2026-10-20T13:30:00+00:00");

        assert!(parse_due("next tuesday").is_err());
    }
}
