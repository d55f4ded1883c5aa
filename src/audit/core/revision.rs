use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Revisions - One committed unit of change
// ============================================================================

/// Globally unique, strictly increasing revision number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(i64);

impl RevisionId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A freshly allocated revision number and the time it was allocated.
///
/// The timestamp is truncated to millisecond precision so that it survives a
/// round trip through the persisted `revtstmp` column unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionStamp {
    pub revision_id: RevisionId,
    pub timestamp: DateTime<Utc>,
}

impl RevisionStamp {
    pub fn now(revision_id: RevisionId) -> Self {
        Self {
            revision_id,
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    /// Attach the acting identity, producing the record that gets persisted.
    pub fn attribute(self, actor: impl Into<String>) -> RevisionRecord {
        RevisionRecord {
            revision_id: self.revision_id,
            timestamp: self.timestamp,
            actor: actor.into(),
        }
    }
}

/// Persisted revision row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub revision_id: RevisionId,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
}

impl RevisionRecord {
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
