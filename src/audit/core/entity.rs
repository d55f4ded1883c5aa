use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use super::error::AuditError;

// ============================================================================
// Tracked Entities
// ============================================================================

/// A domain entity type opted into history recording.
///
/// Field state is whatever serde produces for the entity, so the shape of a
/// snapshot always mirrors the persisted fields.
pub trait Audited: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Name of the tracked entity class, e.g. `"Company"`.
    const ENTITY_TYPE: &'static str;

    fn entity_id(&self) -> String;

    fn field_state(&self) -> Result<Value, AuditError> {
        Ok(serde_json::to_value(self)?)
    }

    fn entity_key(&self) -> EntityKey {
        EntityKey::new(Self::ENTITY_TYPE, self.entity_id())
    }
}

/// (entity_type, entity_id) pair identifying one tracked row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.entity_id)
    }
}

/// Table name backing an entity type (`Company` -> `company`).
///
/// Entity types end up spliced into SQL identifiers, so only plain ASCII
/// identifiers of at most 59 characters are accepted (room for `_aud`).
pub fn table_name(entity_type: &str) -> Result<String, AuditError> {
    let mut chars = entity_type.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || entity_type.len() > 59 {
        return Err(AuditError::InvalidEntityType(entity_type.to_string()));
    }

    Ok(entity_type.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name() {
        assert_eq!(table_name("Company").unwrap(), "company");
        assert_eq!(table_name("_Legacy_Unit2").unwrap(), "_legacy_unit2");
    }

    #[test]
    fn test_table_name_rejects_unsafe_identifiers() {
        for bad in ["", "2fast", "company; DROP TABLE x", "with-dash", "ünïcode"] {
            assert!(
                matches!(table_name(bad), Err(AuditError::InvalidEntityType(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(table_name(&"a".repeat(60)).is_err());
    }

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::new("Company", "1").to_string(), "Company#1");
    }
}
