use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

use super::backend::{CommitSink, CommitUnit, EntityTable, RevisionSequence, RevisionStore, SnapshotStore};
use crate::audit::core::{
    AuditError, AuditedEntitySnapshot, ChangeKind, EntityKey, RevisionId, RevisionRecord,
};

// ============================================================================
// In-Memory Audit Store
// ============================================================================
//
// A complete backend kept in process memory. Commits are copy-on-write:
// the unit is applied to a staged copy of all tables under the write lock
// and swapped in only once every write succeeded.
//
// Fail points let tests simulate an unreachable store at precise moments
// of the commit.
//
// ============================================================================

/// Moments at which a simulated store failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Revision allocation (surfaces as `ClockUnavailable`).
    AllocateRevision,
    /// Start of a commit, before anything is staged.
    BeforePrimaryWrite,
    /// After the primary mutations are staged, before the audit rows.
    AfterPrimaryWrite,
    /// Any read.
    Read,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RevisionTable {
    rows: BTreeMap<RevisionId, RevisionRecord>,
}

impl RevisionTable {
    pub(crate) fn insert(&mut self, record: RevisionRecord) -> Result<(), AuditError> {
        if self.rows.contains_key(&record.revision_id) {
            return Err(AuditError::DuplicateRevision(record.revision_id));
        }
        self.rows.insert(record.revision_id, record);
        Ok(())
    }

    pub(crate) fn get(&self, revision_id: RevisionId) -> Option<&RevisionRecord> {
        self.rows.get(&revision_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SnapshotTable {
    rows: BTreeMap<EntityKey, BTreeMap<RevisionId, AuditedEntitySnapshot>>,
}

impl SnapshotTable {
    pub(crate) fn append(
        &mut self,
        snapshot: AuditedEntitySnapshot,
        revisions: &RevisionTable,
    ) -> Result<(), AuditError> {
        if revisions.get(snapshot.revision_id).is_none() {
            return Err(AuditError::NotFound(format!(
                "revision {} referenced by {}#{}",
                snapshot.revision_id, snapshot.entity_type, snapshot.entity_id
            )));
        }

        let key = EntityKey::new(snapshot.entity_type.clone(), snapshot.entity_id.clone());
        let history = self.rows.entry(key).or_default();
        if history.contains_key(&snapshot.revision_id) {
            return Err(AuditError::DuplicateSnapshot {
                entity_type: snapshot.entity_type,
                entity_id: snapshot.entity_id,
                revision_id: snapshot.revision_id,
            });
        }
        history.insert(snapshot.revision_id, snapshot);
        Ok(())
    }

    pub(crate) fn history(&self, key: &EntityKey) -> Vec<AuditedEntitySnapshot> {
        self.rows
            .get(key)
            .map(|history| history.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn as_of(&self, key: &EntityKey, revision_id: RevisionId) -> Option<&AuditedEntitySnapshot> {
        self.rows
            .get(key)?
            .range(..=revision_id)
            .next_back()
            .map(|(_, snapshot)| snapshot)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    revisions: RevisionTable,
    snapshots: SnapshotTable,
    entities: HashMap<String, BTreeMap<String, Value>>,
}

impl Tables {
    fn apply_primary(&mut self, snapshot: &AuditedEntitySnapshot) -> Result<(), AuditError> {
        let rows = self.entities.entry(snapshot.entity_type.clone()).or_default();
        let exists = rows.contains_key(&snapshot.entity_id);

        let admitted = match snapshot.change_kind {
            ChangeKind::Created => !exists,
            ChangeKind::Updated | ChangeKind::Deleted => exists,
        };
        if !admitted {
            return Err(AuditError::EntityStateConflict {
                entity_type: snapshot.entity_type.clone(),
                entity_id: snapshot.entity_id.clone(),
                change_kind: snapshot.change_kind,
            });
        }

        match snapshot.change_kind {
            ChangeKind::Created | ChangeKind::Updated => {
                rows.insert(snapshot.entity_id.clone(), snapshot.field_state.clone());
            }
            ChangeKind::Deleted => {
                rows.remove(&snapshot.entity_id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    tables: RwLock<Tables>,
    last_revision: AtomicI64,
    fail_points: Mutex<HashMap<FailPoint, u32>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` passes through `point` fail.
    pub fn fail_at(&self, point: FailPoint, times: u32) {
        let mut fail_points = self.fail_points.lock().unwrap_or_else(|e| e.into_inner());
        fail_points.insert(point, times);
    }

    fn trip(&self, point: FailPoint) -> Result<(), AuditError> {
        let mut fail_points = self.fail_points.lock().unwrap_or_else(|e| e.into_inner());
        match fail_points.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                tracing::debug!(fail_point = ?point, "Injected store failure");
                Err(match point {
                    FailPoint::AllocateRevision => {
                        AuditError::ClockUnavailable("injected failure".to_string())
                    }
                    _ => AuditError::StoreUnavailable(format!("injected failure at {:?}", point)),
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn revision_count(&self) -> usize {
        self.tables.read().await.revisions.len()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.tables.read().await.snapshots.len()
    }
}

#[async_trait]
impl RevisionSequence for InMemoryAuditStore {
    async fn next_revision(&self) -> Result<RevisionId, AuditError> {
        self.trip(FailPoint::AllocateRevision)?;
        let value = self.last_revision.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RevisionId::new(value))
    }
}

#[async_trait]
impl RevisionStore for InMemoryAuditStore {
    async fn insert(&self, record: RevisionRecord) -> Result<(), AuditError> {
        self.tables.write().await.revisions.insert(record)
    }

    async fn get(&self, revision_id: RevisionId) -> Result<RevisionRecord, AuditError> {
        self.trip(FailPoint::Read)?;
        self.tables
            .read()
            .await
            .revisions
            .get(revision_id)
            .cloned()
            .ok_or_else(|| AuditError::NotFound(format!("revision {}", revision_id)))
    }
}

#[async_trait]
impl SnapshotStore for InMemoryAuditStore {
    async fn append(&self, snapshot: AuditedEntitySnapshot) -> Result<(), AuditError> {
        let mut tables = self.tables.write().await;
        let Tables { revisions, snapshots, .. } = &mut *tables;
        snapshots.append(snapshot, revisions)
    }

    fn history_of<'a>(
        &'a self,
        entity_type: &str,
        entity_id: &str,
    ) -> BoxStream<'a, Result<AuditedEntitySnapshot, AuditError>> {
        let key = EntityKey::new(entity_type, entity_id);

        stream::once(async move {
            self.trip(FailPoint::Read)?;
            let tables = self.tables.read().await;
            Ok::<_, AuditError>(tables.snapshots.history(&key))
        })
        .map(|loaded| match loaded {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::once(future::ready(Err::<AuditedEntitySnapshot, _>(e))).right_stream(),
        })
        .flatten()
        .boxed()
    }

    async fn as_of(
        &self,
        entity_type: &str,
        entity_id: &str,
        revision_id: RevisionId,
    ) -> Result<AuditedEntitySnapshot, AuditError> {
        self.trip(FailPoint::Read)?;
        let key = EntityKey::new(entity_type, entity_id);
        self.tables
            .read()
            .await
            .snapshots
            .as_of(&key, revision_id)
            .cloned()
            .ok_or_else(|| AuditError::NotFound(format!("{} as of revision {}", key, revision_id)))
    }
}

#[async_trait]
impl EntityTable for InMemoryAuditStore {
    async fn load(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>, AuditError> {
        self.trip(FailPoint::Read)?;
        let tables = self.tables.read().await;
        Ok(tables
            .entities
            .get(entity_type)
            .and_then(|rows| rows.get(entity_id))
            .cloned())
    }

    async fn load_all(&self, entity_type: &str) -> Result<Vec<(String, Value)>, AuditError> {
        self.trip(FailPoint::Read)?;
        let tables = self.tables.read().await;
        Ok(tables
            .entities
            .get(entity_type)
            .map(|rows| rows.iter().map(|(id, state)| (id.clone(), state.clone())).collect())
            .unwrap_or_default())
    }

    async fn load_where(
        &self,
        entity_type: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, AuditError> {
        let rows = self.load_all(entity_type).await?;
        Ok(rows
            .into_iter()
            .filter(|(_, state)| state.get(field) == Some(value))
            .collect())
    }
}

#[async_trait]
impl CommitSink for InMemoryAuditStore {
    async fn commit(&self, unit: CommitUnit) -> Result<(), AuditError> {
        let mut tables = self.tables.write().await;
        self.trip(FailPoint::BeforePrimaryWrite)?;

        let mut staged = tables.clone();
        for snapshot in &unit.snapshots {
            staged.apply_primary(snapshot)?;
        }

        self.trip(FailPoint::AfterPrimaryWrite)?;

        staged.revisions.insert(unit.revision)?;
        for snapshot in unit.snapshots {
            staged.snapshots.append(snapshot, &staged.revisions)?;
        }

        *tables = staged;
        tracing::debug!(tx_id = %unit.tx_id, "Commit unit applied to in-memory store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::core::RevisionStamp;
    use futures_util::TryStreamExt;
    use serde_json::json;
    use uuid::Uuid;

    fn snapshot(id: &str, rev: i64, kind: ChangeKind, name: &str) -> AuditedEntitySnapshot {
        AuditedEntitySnapshot {
            entity_type: "Company".into(),
            entity_id: id.into(),
            revision_id: RevisionId::new(rev),
            change_kind: kind,
            field_state: json!({ "id": id, "name": name }),
        }
    }

    fn unit(rev: i64, snapshots: Vec<AuditedEntitySnapshot>) -> CommitUnit {
        CommitUnit {
            tx_id: Uuid::now_v7(),
            revision: RevisionStamp::now(RevisionId::new(rev)).attribute("admin"),
            snapshots,
        }
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let store = InMemoryAuditStore::new();
        let first = store.next_revision().await.unwrap();
        let second = store.next_revision().await.unwrap();
        assert_eq!(first, RevisionId::new(1));
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_allocation_failure_is_clock_unavailable() {
        let store = InMemoryAuditStore::new();
        store.fail_at(FailPoint::AllocateRevision, 1);

        let err = store.next_revision().await.unwrap_err();
        assert!(matches!(err, AuditError::ClockUnavailable(_)));
        assert!(store.next_revision().await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_revision_rejected() {
        let store = InMemoryAuditStore::new();
        let record = RevisionStamp::now(RevisionId::new(1)).attribute("admin");

        store.insert(record.clone()).await.unwrap();
        let err = store.insert(record).await.unwrap_err();
        assert!(matches!(err, AuditError::DuplicateRevision(rev) if rev == RevisionId::new(1)));
    }

    #[tokio::test]
    async fn test_get_missing_revision() {
        let store = InMemoryAuditStore::new();
        let err = store.get(RevisionId::new(99)).await.unwrap_err();
        assert!(matches!(err, AuditError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_requires_revision_and_uniqueness() {
        let store = InMemoryAuditStore::new();

        let orphan = store.append(snapshot("1", 1, ChangeKind::Created, "Acme")).await;
        assert!(matches!(orphan, Err(AuditError::NotFound(_))));

        store.insert(RevisionStamp::now(RevisionId::new(1)).attribute("admin")).await.unwrap();
        store.append(snapshot("1", 1, ChangeKind::Created, "Acme")).await.unwrap();

        let dup = store.append(snapshot("1", 1, ChangeKind::Updated, "Other")).await;
        assert!(matches!(dup, Err(AuditError::DuplicateSnapshot { .. })));
        assert_eq!(store.snapshot_count().await, 1);
    }

    #[tokio::test]
    async fn test_as_of_returns_latest_at_or_before() {
        let store = InMemoryAuditStore::new();
        store.commit(unit(1, vec![snapshot("1", 1, ChangeKind::Created, "Acme")])).await.unwrap();
        store.commit(unit(4, vec![snapshot("1", 4, ChangeKind::Updated, "Acme Corp")])).await.unwrap();

        let at_three = store.as_of("Company", "1", RevisionId::new(3)).await.unwrap();
        assert_eq!(at_three.revision_id, RevisionId::new(1));

        let at_four = store.as_of("Company", "1", RevisionId::new(4)).await.unwrap();
        assert_eq!(at_four.field_state["name"], "Acme Corp");

        let before = store.as_of("Company", "1", RevisionId::new(0)).await;
        assert!(matches!(before, Err(AuditError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_history_is_restartable() {
        let store = InMemoryAuditStore::new();
        store.commit(unit(1, vec![snapshot("1", 1, ChangeKind::Created, "Acme")])).await.unwrap();
        store.commit(unit(2, vec![snapshot("1", 2, ChangeKind::Updated, "Acme Corp")])).await.unwrap();

        let first: Vec<_> = store.history_of("Company", "1").try_collect().await.unwrap();
        let second: Vec<_> = store.history_of("Company", "1").try_collect().await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert!(first[0].revision_id < first[1].revision_id);

        let empty: Vec<_> = store.history_of("Company", "404").try_collect().await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_history_surfaces_read_failure() {
        let store = InMemoryAuditStore::new();
        store.fail_at(FailPoint::Read, 1);

        let result: Result<Vec<_>, _> = store.history_of("Company", "1").try_collect().await;
        assert!(matches!(result, Err(AuditError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_failure_after_primary_write_leaves_no_trace() {
        let store = InMemoryAuditStore::new();
        store.fail_at(FailPoint::AfterPrimaryWrite, 1);

        let err = store
            .commit(unit(1, vec![snapshot("1", 1, ChangeKind::Created, "Acme")]))
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::StoreUnavailable(_)));
        assert_eq!(store.load("Company", "1").await.unwrap(), None);
        assert_eq!(store.revision_count().await, 0);
        assert_eq!(store.snapshot_count().await, 0);
    }

    #[tokio::test]
    async fn test_commit_rejects_state_conflicts_atomically() {
        let store = InMemoryAuditStore::new();
        store.commit(unit(1, vec![snapshot("1", 1, ChangeKind::Created, "Acme")])).await.unwrap();

        // Second entity is fine, first one cannot be created twice.
        let err = store
            .commit(unit(
                2,
                vec![
                    snapshot("2", 2, ChangeKind::Created, "Globex"),
                    snapshot("1", 2, ChangeKind::Created, "Acme again"),
                ],
            ))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AuditError::EntityStateConflict { change_kind: ChangeKind::Created, .. }
        ));
        assert_eq!(store.load("Company", "2").await.unwrap(), None);
        assert_eq!(store.revision_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_primary_row_but_keeps_history() {
        let store = InMemoryAuditStore::new();
        store.commit(unit(1, vec![snapshot("1", 1, ChangeKind::Created, "Acme")])).await.unwrap();
        store.commit(unit(2, vec![snapshot("1", 2, ChangeKind::Deleted, "Acme")])).await.unwrap();

        assert_eq!(store.load("Company", "1").await.unwrap(), None);
        assert_eq!(store.snapshot_count().await, 2);
    }

    #[tokio::test]
    async fn test_load_where_matches_field() {
        let store = InMemoryAuditStore::new();
        store
            .commit(unit(
                1,
                vec![
                    snapshot("1", 1, ChangeKind::Created, "Acme"),
                    snapshot("2", 1, ChangeKind::Created, "Globex"),
                ],
            ))
            .await
            .unwrap();

        let rows = store.load_where("Company", "name", &json!("Globex")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "2");
        assert_eq!(store.load_all("Company").await.unwrap().len(), 2);
    }
}
