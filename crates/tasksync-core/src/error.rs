//! Core error types for tasksync-core.
//!
//! This module defines the error hierarchy used across the library. The
//! sync engine works in terms of [`SyncError`]; [`CoreError`] is the umbrella
//! type handed to front ends such as the CLI.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::EntityKind;

/// Core error type for tasksync-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Sync, store and remote errors
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Errors raised while talking to the local store or the remote service.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No valid access token is available.
    #[error("Authentication required: {0}")]
    Authentication(#[from] AuthError),

    /// Network or HTTP failure from a single remote call.
    #[error("Remote service error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Remote {
        status: Option<u16>,
        message: String,
    },

    /// Local store failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),

    /// A write would break an identity invariant (e.g. rebinding a remote id).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    /// The entity has not been created remotely yet, so it has no remote id.
    #[error("{kind} {id} has no remote id yet")]
    Unbound { kind: EntityKind, id: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Errors after which further remote calls in the same cycle are pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Authentication(_) | SyncError::Cancelled)
    }

    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::Remote {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Remote {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Persistence(err.into())
    }
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// The connection mutex was poisoned by a panicking writer
    #[error("Database connection poisoned")]
    Poisoned,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Data directory could not be resolved or created
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Authentication errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Nothing stored for the service
    #[error("Not authenticated with {service}")]
    NotAuthenticated { service: String },

    /// Access token expired
    #[error("Access token expired and no refresh token available")]
    TokenExpired,

    /// The remote service refused the access token
    #[error("Access token rejected: {0}")]
    Rejected(String),

    /// Token refresh failed
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// Credentials not configured
    #[error("OAuth credentials not configured for {service}")]
    CredentialsNotConfigured { service: String },

    /// OS keyring failure
    #[error("Keyring error: {0}")]
    Keyring(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// Mutation rejected because of the entity's sync state
    #[error("{kind} {id} is pending deletion")]
    PendingDeletion { kind: EntityKind, id: String },
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<keyring::Error> for AuthError {
    fn from(err: keyring::Error) -> Self {
        AuthError::Keyring(err.to_string())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(SyncError::Cancelled.is_fatal());
        assert!(SyncError::Authentication(AuthError::TokenExpired).is_fatal());
        assert!(!SyncError::remote(Some(500), "boom").is_fatal());
        assert!(!SyncError::Conflict("x".into()).is_fatal());
    }

    #[test]
    fn test_remote_error_display_includes_status() {
        let err = SyncError::remote(Some(404), "Not Found");
        assert_eq!(err.to_string(), "Remote service error (404): Not Found");

        let err = SyncError::remote(None, "connection reset");
        assert_eq!(err.to_string(), "Remote service error: connection reset");
    }

    #[test]
    fn test_not_found_display() {
        let err = SyncError::not_found(EntityKind::Task, "abc");
        assert_eq!(err.to_string(), "Task abc not found");
    }
}
