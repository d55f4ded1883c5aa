use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::error::AuditError;
use super::revision::RevisionId;

// ============================================================================
// Snapshots - Immutable per-entity state at one revision
// ============================================================================

/// Classification of a snapshot.
///
/// The numeric codes match the `revtype` column of the history tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Result of folding two changes to the same entity inside one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergedChange {
    Kind(ChangeKind),
    /// The changes cancel out: nothing is written for this entity.
    Cancelled,
    Invalid,
}

impl ChangeKind {
    pub fn code(self) -> i16 {
        match self {
            ChangeKind::Created => 0,
            ChangeKind::Updated => 1,
            ChangeKind::Deleted => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(ChangeKind::Created),
            1 => Some(ChangeKind::Updated),
            2 => Some(ChangeKind::Deleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "CREATED",
            ChangeKind::Updated => "UPDATED",
            ChangeKind::Deleted => "DELETED",
        }
    }

    /// Fold a later change on the same entity into this one.
    pub fn merge(self, next: ChangeKind) -> MergedChange {
        use ChangeKind::*;
        match (self, next) {
            (Created, Updated) => MergedChange::Kind(Created),
            (Created, Deleted) => MergedChange::Cancelled,
            (Updated, Updated) => MergedChange::Kind(Updated),
            (Updated, Deleted) => MergedChange::Kind(Deleted),
            (Deleted, Created) => MergedChange::Kind(Updated),
            _ => MergedChange::Invalid,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of an entity's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditedEntitySnapshot {
    pub entity_type: String,
    pub entity_id: String,
    pub revision_id: RevisionId,
    pub change_kind: ChangeKind,
    /// Full persisted field values. For DELETED, the last-known state.
    pub field_state: Value,
}

impl AuditedEntitySnapshot {
    /// Rebuild the typed entity this snapshot was taken from.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, AuditError> {
        Ok(serde_json::from_value(self.field_state.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_kind_codes() {
        for kind in [ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted] {
            assert_eq!(ChangeKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ChangeKind::from_code(3), None);
        assert_eq!(ChangeKind::Deleted.to_string(), "DELETED");
    }

    #[test]
    fn test_merge_table() {
        use ChangeKind::*;
        assert_eq!(Created.merge(Updated), MergedChange::Kind(Created));
        assert_eq!(Created.merge(Deleted), MergedChange::Cancelled);
        assert_eq!(Updated.merge(Updated), MergedChange::Kind(Updated));
        assert_eq!(Updated.merge(Deleted), MergedChange::Kind(Deleted));
        assert_eq!(Deleted.merge(Created), MergedChange::Kind(Updated));

        assert_eq!(Created.merge(Created), MergedChange::Invalid);
        assert_eq!(Updated.merge(Created), MergedChange::Invalid);
        assert_eq!(Deleted.merge(Updated), MergedChange::Invalid);
        assert_eq!(Deleted.merge(Deleted), MergedChange::Invalid);
    }

    #[test]
    fn test_decode_snapshot() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Named {
            name: String,
        }

        let snapshot = AuditedEntitySnapshot {
            entity_type: "Company".into(),
            entity_id: "1".into(),
            revision_id: RevisionId::new(1),
            change_kind: ChangeKind::Created,
            field_state: json!({ "name": "Acme" }),
        };

        let decoded: Named = snapshot.decode().unwrap();
        assert_eq!(decoded, Named { name: "Acme".into() });
    }
}
