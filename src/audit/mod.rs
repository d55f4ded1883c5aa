// ============================================================================
// Audit Infrastructure
// ============================================================================
//
// Generic, reusable revision history for any tracked entity.
// Domain-specific code is in src/domain/
//
// ============================================================================

pub mod clock;
pub mod core;
pub mod interceptor;
pub mod store;

pub use self::clock::RevisionClock;
pub use self::core::*;
pub use self::interceptor::{AuditInterceptor, AuditTransaction, Buffered, TxState};
pub use self::store::*;
