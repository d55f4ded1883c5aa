// ============================================================================
// Audit Core - Generic Revisioning Vocabulary
// ============================================================================
//
// Types shared by every part of the audit subsystem. Nothing in here knows
// about a concrete entity (Company, ...) or a concrete store.
//
// ============================================================================

pub mod actor;
pub mod entity;
pub mod error;
pub mod revision;
pub mod snapshot;

pub use actor::{
    ActorResolver, ContextActorResolver, ExecutionContext, FixedActorResolver, DEFAULT_ACTOR,
    FALLBACK_ACTOR,
};
pub use entity::{table_name, Audited, EntityKey};
pub use error::AuditError;
pub use revision::{RevisionId, RevisionRecord, RevisionStamp};
pub use snapshot::{AuditedEntitySnapshot, ChangeKind, MergedChange};
