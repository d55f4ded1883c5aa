use serde::{Deserialize, Serialize};

use super::errors::CompanyError;
use crate::audit::Audited;

// ============================================================================
// Company Entity
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Company {
    pub id: i64,
    pub name: String,
}

impl Company {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), CompanyError> {
        if self.name.trim().is_empty() {
            return Err(CompanyError::EmptyName);
        }
        Ok(())
    }

    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            id: self.id,
            name: name.into(),
        }
    }
}

impl Audited for Company {
    const ENTITY_TYPE: &'static str = "Company";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_state_mirrors_fields() {
        let company = Company::new(1, "Acme");
        assert_eq!(company.field_state().unwrap(), json!({ "id": 1, "name": "Acme" }));
        assert_eq!(company.entity_key().to_string(), "Company#1");
    }

    #[test]
    fn test_validation() {
        assert!(Company::new(1, "Acme").validate().is_ok());
        assert!(matches!(Company::new(1, "  ").validate(), Err(CompanyError::EmptyName)));
    }

    #[test]
    fn test_renamed_keeps_id() {
        let renamed = Company::new(7, "Acme").renamed("Acme Corp");
        assert_eq!(renamed, Company::new(7, "Acme Corp"));
    }
}
