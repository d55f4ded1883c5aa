use crate::audit::AuditError;
use crate::utils::IsTransient;

// ============================================================================
// Company Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CompanyError {
    #[error("Company name cannot be empty")]
    EmptyName,

    #[error("Company {0} already exists")]
    AlreadyExists(i64),

    #[error("Company {0} was deleted and its id cannot be reused")]
    IdRetired(i64),

    #[error("Company not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl From<serde_json::Error> for CompanyError {
    fn from(e: serde_json::Error) -> Self {
        CompanyError::Audit(AuditError::Serialization(e))
    }
}

impl IsTransient for CompanyError {
    fn is_transient(&self) -> bool {
        match self {
            CompanyError::Audit(e) => e.is_transient(),
            _ => false,
        }
    }
}
