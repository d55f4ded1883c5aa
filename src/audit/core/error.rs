use super::revision::RevisionId;
use super::snapshot::ChangeKind;
use crate::utils::IsTransient;

// ============================================================================
// Audit Errors
// ============================================================================
//
// Every variant except NotFound aborts the enclosing transaction.
// Only ClockUnavailable and StoreUnavailable are worth retrying, and only
// at whole-transaction granularity.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Revision clock unavailable: {0}")]
    ClockUnavailable(String),

    #[error("Revision {0} already exists")]
    DuplicateRevision(RevisionId),

    #[error("Snapshot already exists for {entity_type}#{entity_id} at revision {revision_id}")]
    DuplicateSnapshot {
        entity_type: String,
        entity_id: String,
        revision_id: RevisionId,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Audit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid change sequence for {entity_type}#{entity_id}: {from} followed by {to}")]
    InvalidTransition {
        entity_type: String,
        entity_id: String,
        from: ChangeKind,
        to: ChangeKind,
    },

    #[error("Current state of {entity_type}#{entity_id} does not admit a {change_kind} change")]
    EntityStateConflict {
        entity_type: String,
        entity_id: String,
        change_kind: ChangeKind,
    },

    #[error("Field state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction {0} is already {1}")]
    TransactionClosed(uuid::Uuid, &'static str),

    #[error("Invalid entity type name: {0:?}")]
    InvalidEntityType(String),
}

impl AuditError {
    /// Short, stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditError::ClockUnavailable(_) => "clock_unavailable",
            AuditError::DuplicateRevision(_) => "duplicate_revision",
            AuditError::DuplicateSnapshot { .. } => "duplicate_snapshot",
            AuditError::NotFound(_) => "not_found",
            AuditError::StoreUnavailable(_) => "store_unavailable",
            AuditError::InvalidTransition { .. } => "invalid_transition",
            AuditError::EntityStateConflict { .. } => "entity_state_conflict",
            AuditError::Serialization(_) => "serialization",
            AuditError::TransactionClosed(..) => "transaction_closed",
            AuditError::InvalidEntityType(_) => "invalid_entity_type",
        }
    }

    /// Invariant violations indicate a bug or an allocation race and must
    /// surface loudly.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            AuditError::DuplicateRevision(_) | AuditError::DuplicateSnapshot { .. }
        )
    }
}

impl IsTransient for AuditError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            AuditError::ClockUnavailable(_) | AuditError::StoreUnavailable(_)
        )
    }
}
