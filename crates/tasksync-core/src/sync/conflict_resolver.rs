//! Last-write-wins resolution for remote snapshots pulled over local state.

use chrono::{DateTime, Utc};

use crate::model::SyncState;

/// What the store knows about the local copy of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVersion {
    pub updated_at: DateTime<Utc>,
    pub sync_state: SyncState,
}

/// Decision for one incoming remote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No local match: insert as a new synced entity.
    Insert,
    /// Overwrite the local copy and mark it synced.
    ApplyRemote,
    /// Keep the local pending edit until it is pushed.
    KeepLocal,
}

/// Resolve a remote snapshot against the local copy matched by remote id.
///
/// The remote copy wins when it is at least as new as the local one (ties go
/// to the remote), or when the local copy carries no unpushed edit regardless
/// of clock skew.
pub fn resolve(local: Option<LocalVersion>, remote_updated_at: DateTime<Utc>) -> Resolution {
    match local {
        None => Resolution::Insert,
        Some(local) if remote_updated_at >= local.updated_at => Resolution::ApplyRemote,
        Some(local) if local.sync_state == SyncState::Synced => Resolution::ApplyRemote,
        Some(_) => Resolution::KeepLocal,
    }
}

/// Whether the snapshot met a local copy with unpushed edits.
pub fn is_conflict(local: Option<LocalVersion>) -> bool {
    local.is_some_and(|l| l.sync_state.is_pending())
}
