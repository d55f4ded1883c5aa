// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Each tracked entity has its own subdirectory with:
// - The entity and its validation
// - Errors
// - Repository
// - Service
//
// This layer only talks to the audit infrastructure through
// `AuditTransaction` and the store traits.
//
// ============================================================================

pub mod company;
