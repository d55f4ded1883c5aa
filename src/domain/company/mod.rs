// ============================================================================
// Company Domain - Audited CRUD for the Company entity
// ============================================================================
//
// This module contains ALL Company-specific code:
// - Entity (Company, tracked through `Audited`)
// - Errors (CompanyError enum)
// - Repository (CRUD with read-your-writes inside a transaction)
// - Service (one audited transaction per call, history queries)
//
// The revisioning itself lives in the generic audit infrastructure.
//
// ============================================================================

pub mod errors;
pub mod model;
pub mod repository;
pub mod service;

// Re-export for convenience
pub use errors::*;
pub use model::*;
pub use repository::*;
pub use service::*;
