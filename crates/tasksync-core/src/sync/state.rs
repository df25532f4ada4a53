//! Entity sync-state transitions.
//!
//! ```text
//! Synced ──local edit──▶ PendingCreate | PendingUpdate | PendingDelete
//! PendingCreate ──create acked──▶ Synced (remote id bound)
//! PendingUpdate ──update acked──▶ Synced
//! PendingDelete ──delete acked──▶ (removed)
//! any pending ──attempts exhausted──▶ Conflict
//! ```

use crate::model::{ChangeOperation, SyncState};

impl SyncState {
    /// State after a local mutation. `None` means the mutation is rejected:
    /// an entity waiting for its remote delete accepts no further edits.
    pub fn after_local_mutation(self, op: ChangeOperation) -> Option<SyncState> {
        match (self, op) {
            (SyncState::PendingDelete, _) => None,
            (_, ChangeOperation::Create) => Some(SyncState::PendingCreate),
            (_, ChangeOperation::Delete) => Some(SyncState::PendingDelete),
            (SyncState::PendingCreate, ChangeOperation::Update | ChangeOperation::Move) => {
                Some(SyncState::PendingCreate)
            }
            (_, ChangeOperation::Update | ChangeOperation::Move) => Some(SyncState::PendingUpdate),
        }
    }

    /// State implied by the entity's outstanding ledger entries, in ledger order.
    ///
    /// An escalated entity stays in `Conflict` while anything is still queued.
    pub fn from_outstanding(self, ops: &[ChangeOperation]) -> SyncState {
        match ops.first() {
            None => SyncState::Synced,
            Some(_) if self == SyncState::Conflict => SyncState::Conflict,
            Some(_) if ops.contains(&ChangeOperation::Delete) => SyncState::PendingDelete,
            Some(ChangeOperation::Create) => SyncState::PendingCreate,
            Some(_) => SyncState::PendingUpdate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChangeOperation::*;

    #[test]
    fn test_local_mutation_from_synced() {
        assert_eq!(SyncState::Synced.after_local_mutation(Update), Some(SyncState::PendingUpdate));
        assert_eq!(SyncState::Synced.after_local_mutation(Move), Some(SyncState::PendingUpdate));
        assert_eq!(SyncState::Synced.after_local_mutation(Delete), Some(SyncState::PendingDelete));
    }

    #[test]
    fn test_edit_before_create_is_pushed_stays_pending_create() {
        assert_eq!(
            SyncState::PendingCreate.after_local_mutation(Update),
            Some(SyncState::PendingCreate)
        );
    }

    #[test]
    fn test_pending_delete_rejects_edits() {
        for op in [Create, Update, Delete, Move] {
            assert_eq!(SyncState::PendingDelete.after_local_mutation(op), None);
        }
    }

    #[test]
    fn test_conflict_reenters_pending_on_edit() {
        assert_eq!(SyncState::Conflict.after_local_mutation(Update), Some(SyncState::PendingUpdate));
    }

    #[test]
    fn test_from_outstanding() {
        assert_eq!(SyncState::PendingUpdate.from_outstanding(&[]), SyncState::Synced);
        assert_eq!(SyncState::PendingCreate.from_outstanding(&[Update]), SyncState::PendingUpdate);
        assert_eq!(SyncState::PendingCreate.from_outstanding(&[Create, Update]), SyncState::PendingCreate);
        assert_eq!(SyncState::PendingUpdate.from_outstanding(&[Update, Delete]), SyncState::PendingDelete);
        assert_eq!(SyncState::Conflict.from_outstanding(&[Update]), SyncState::Conflict);
        assert_eq!(SyncState::Conflict.from_outstanding(&[]), SyncState::Synced);
    }
}
