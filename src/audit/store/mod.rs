// ============================================================================
// Audit Store - Persistence for revisions, snapshots and current state
// ============================================================================

pub mod backend;
pub mod memory;
pub mod postgres;

pub use backend::{
    AuditBackend, CommitSink, CommitUnit, EntityTable, RevisionSequence, RevisionStore,
    SnapshotStore,
};
pub use memory::{FailPoint, InMemoryAuditStore};
pub use postgres::PgAuditStore;
