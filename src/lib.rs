// ============================================================================
// company_audit - Revision history for audited entities
// ============================================================================
//
// - audit: revision clock, transaction interceptor, snapshot stores
// - domain: audited entities (Company) and their services
// - metrics: Prometheus counters and the /metrics, /health server
// - config: environment-driven runtime settings
//
// ============================================================================

pub mod audit;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod utils;
