use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use uuid::Uuid;

use crate::audit::core::{AuditError, AuditedEntitySnapshot, RevisionId, RevisionRecord};

// ============================================================================
// Store Seams
// ============================================================================
//
// The audit subsystem talks to persistence only through these traits.
// Each backend (in-memory, Postgres) implements all of them, which makes
// it an `AuditBackend`.
//
// ============================================================================

/// Backing sequence for revision numbers. Never hands out the same value
/// twice; values consumed by aborted transactions become gaps.
#[async_trait]
pub trait RevisionSequence: Send + Sync {
    async fn next_revision(&self) -> Result<RevisionId, AuditError>;
}

/// One row per revision.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Fails with `DuplicateRevision` if the id is already taken.
    async fn insert(&self, record: RevisionRecord) -> Result<(), AuditError>;

    async fn get(&self, revision_id: RevisionId) -> Result<RevisionRecord, AuditError>;
}

/// Append-only per-entity history.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fails with `DuplicateSnapshot` if (type, id, revision) exists.
    async fn append(&self, snapshot: AuditedEntitySnapshot) -> Result<(), AuditError>;

    /// Snapshots in ascending revision order. Nothing is read until the
    /// stream is polled, and calling this again starts over.
    fn history_of<'a>(
        &'a self,
        entity_type: &str,
        entity_id: &str,
    ) -> BoxStream<'a, Result<AuditedEntitySnapshot, AuditError>>;

    /// Latest snapshot at or before `revision_id`.
    async fn as_of(
        &self,
        entity_type: &str,
        entity_id: &str,
        revision_id: RevisionId,
    ) -> Result<AuditedEntitySnapshot, AuditError>;
}

/// Read access to the current-state (primary) tables.
#[async_trait]
pub trait EntityTable: Send + Sync {
    async fn load(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>, AuditError>;

    /// All rows of a type, ordered by id.
    async fn load_all(&self, entity_type: &str) -> Result<Vec<(String, Value)>, AuditError>;

    /// Rows whose top-level `field` equals `value`.
    async fn load_where(
        &self,
        entity_type: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, AuditError>;
}

/// Everything a transaction flushes at commit.
///
/// Each snapshot doubles as the primary mutation for its entity:
/// CREATED inserts a row that must not exist yet, UPDATED replaces a row
/// that must exist, DELETED removes a row that must exist.
#[derive(Debug, Clone)]
pub struct CommitUnit {
    pub tx_id: Uuid,
    pub revision: RevisionRecord,
    pub snapshots: Vec<AuditedEntitySnapshot>,
}

/// Applies a `CommitUnit` atomically: the primary mutations, the revision
/// row and every snapshot become visible together, or none of them do.
#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn commit(&self, unit: CommitUnit) -> Result<(), AuditError>;
}

pub trait AuditBackend:
    RevisionSequence + RevisionStore + SnapshotStore + EntityTable + CommitSink
{
}

impl<T> AuditBackend for T where
    T: RevisionSequence + RevisionStore + SnapshotStore + EntityTable + CommitSink
{
}
