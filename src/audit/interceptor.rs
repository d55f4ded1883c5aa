use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::clock::RevisionClock;
use super::core::{
    ActorResolver, AuditError, Audited, AuditedEntitySnapshot, ChangeKind, EntityKey,
    ExecutionContext, MergedChange, RevisionId, RevisionRecord,
};
use super::store::{AuditBackend, CommitUnit};
use crate::metrics::AuditMetrics;

// ============================================================================
// Audit Interceptor - Per-transaction revision orchestration
// ============================================================================
//
// Idle ──first tracked write──▶ RevisionAllocated ──commit──▶ Committing ──▶ Committed
//   │                                   │                          │
//   └──────────── rollback / error / drop ───────────────────────────▶ Aborted
//
// Writes are buffered in the transaction and only reach the store as one
// CommitUnit. Aborting therefore never needs compensating deletes: the
// buffer is simply discarded. The revision number drawn from the clock is
// not returned, it becomes a gap.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    RevisionAllocated,
    Committing,
    Committed,
    Aborted,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }

    fn as_str(self) -> &'static str {
        match self {
            TxState::Idle => "idle",
            TxState::RevisionAllocated => "revision-allocated",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transaction has buffered for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffered {
    /// The entity exists at the end of the transaction with this state.
    Present(Value),
    /// The entity does not exist at the end of the transaction.
    Removed,
}

#[derive(Debug, Clone)]
struct PendingChange {
    key: EntityKey,
    /// `None` once changes cancelled each other out.
    kind: Option<ChangeKind>,
    field_state: Value,
}

impl PendingChange {
    fn buffered(&self) -> Buffered {
        match self.kind {
            Some(ChangeKind::Created) | Some(ChangeKind::Updated) => {
                Buffered::Present(self.field_state.clone())
            }
            Some(ChangeKind::Deleted) | None => Buffered::Removed,
        }
    }
}

pub struct AuditInterceptor {
    backend: Arc<dyn AuditBackend>,
    clock: RevisionClock,
    resolver: Arc<dyn ActorResolver>,
    metrics: Option<Arc<AuditMetrics>>,
}

impl AuditInterceptor {
    pub fn new<B>(backend: Arc<B>, resolver: Arc<dyn ActorResolver>) -> Self
    where
        B: AuditBackend + 'static,
    {
        Self {
            clock: RevisionClock::new(backend.clone()),
            backend,
            resolver,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AuditMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shared handle on the store, for read paths.
    pub fn backend(&self) -> Arc<dyn AuditBackend> {
        self.backend.clone()
    }

    pub fn clock(&self) -> &RevisionClock {
        &self.clock
    }

    /// Open a new unit of work attributed through `ctx`.
    pub fn begin(self: &Arc<Self>, ctx: ExecutionContext) -> AuditTransaction {
        let tx = AuditTransaction {
            id: Uuid::now_v7(),
            interceptor: Arc::clone(self),
            ctx,
            state: TxState::Idle,
            revision: None,
            pending: Vec::new(),
            index: HashMap::new(),
        };
        tracing::debug!(tx_id = %tx.id, "Transaction started");
        tx
    }

    fn update_open_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_open_revisions(self.clock.open_allocations());
        }
    }
}

/// One unit of work. Dropping it without `commit` rolls it back.
pub struct AuditTransaction {
    id: Uuid,
    interceptor: Arc<AuditInterceptor>,
    ctx: ExecutionContext,
    state: TxState,
    revision: Option<RevisionRecord>,
    pending: Vec<PendingChange>,
    index: HashMap<EntityKey, usize>,
}

impl AuditTransaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Revision this transaction will commit under, once allocated.
    pub fn revision(&self) -> Option<&RevisionRecord> {
        self.revision.as_ref()
    }

    pub async fn created<E: Audited>(&mut self, entity: &E) -> Result<RevisionId, AuditError> {
        self.record(entity, ChangeKind::Created).await
    }

    pub async fn updated<E: Audited>(&mut self, entity: &E) -> Result<RevisionId, AuditError> {
        self.record(entity, ChangeKind::Updated).await
    }

    /// `entity` is the last-known state before deletion.
    pub async fn deleted<E: Audited>(&mut self, entity: &E) -> Result<RevisionId, AuditError> {
        self.record(entity, ChangeKind::Deleted).await
    }

    /// Buffer one tracked mutation. Any failure aborts the transaction.
    pub async fn record<E: Audited>(&mut self, entity: &E, kind: ChangeKind) -> Result<RevisionId, AuditError> {
        match self.try_record(entity, kind).await {
            Ok(revision_id) => Ok(revision_id),
            Err(e) => {
                if !self.state.is_terminal() {
                    self.abort(e.kind());
                }
                Err(e)
            }
        }
    }

    async fn try_record<E: Audited>(&mut self, entity: &E, kind: ChangeKind) -> Result<RevisionId, AuditError> {
        self.ensure_open()?;
        let key = entity.entity_key();
        let field_state = entity.field_state()?;
        let revision_id = self.allocate_revision().await?;

        let slot = self.index.get(&key).copied();
        match slot {
            None => {
                self.index.insert(key.clone(), self.pending.len());
                self.pending.push(PendingChange {
                    key: key.clone(),
                    kind: Some(kind),
                    field_state,
                });
            }
            Some(slot) => {
                let change = &mut self.pending[slot];
                let merged = match change.kind {
                    Some(previous) => previous.merge(kind),
                    // After a cancelled create the entity is back to not existing.
                    None if kind == ChangeKind::Created => MergedChange::Kind(ChangeKind::Created),
                    None => MergedChange::Invalid,
                };

                match merged {
                    MergedChange::Kind(next) => {
                        change.kind = Some(next);
                        change.field_state = field_state;
                    }
                    MergedChange::Cancelled => {
                        change.kind = None;
                        change.field_state = field_state;
                    }
                    MergedChange::Invalid => {
                        return Err(AuditError::InvalidTransition {
                            entity_type: key.entity_type,
                            entity_id: key.entity_id,
                            from: change.kind.unwrap_or(ChangeKind::Deleted),
                            to: kind,
                        });
                    }
                }
            }
        }

        tracing::debug!(
            tx_id = %self.id,
            revision_id = %revision_id,
            entity = %key,
            change_kind = %kind,
            "Buffered tracked mutation"
        );
        Ok(revision_id)
    }

    async fn allocate_revision(&mut self) -> Result<RevisionId, AuditError> {
        if let Some(record) = &self.revision {
            return Ok(record.revision_id);
        }

        let interceptor = Arc::clone(&self.interceptor);
        let stamp = interceptor
            .clock
            .begin_or_join_transaction_revision(self.id)
            .await?;
        let actor = interceptor.resolver.resolve(&self.ctx);
        let record = stamp.attribute(actor);

        tracing::info!(
            tx_id = %self.id,
            revision_id = %record.revision_id,
            actor = %record.actor,
            "Revision allocated"
        );

        let revision_id = record.revision_id;
        self.revision = Some(record);
        self.state = TxState::RevisionAllocated;
        interceptor.update_open_gauge();
        Ok(revision_id)
    }

    /// Buffered state of an entity, if this transaction touched it.
    pub fn buffered(&self, key: &EntityKey) -> Option<Buffered> {
        self.index.get(key).map(|&slot| self.pending[slot].buffered())
    }

    /// Everything buffered for one entity type, in first-touch order.
    pub fn buffered_of_type<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = (&'a str, Buffered)> + 'a {
        self.pending
            .iter()
            .filter(move |change| change.key.entity_type == entity_type)
            .map(|change| (change.key.entity_id.as_str(), change.buffered()))
    }

    /// Flush the revision, its snapshots and the primary mutations as one
    /// atomic unit. Returns the committed revision, or `None` when there was
    /// nothing to write.
    pub async fn commit(mut self) -> Result<Option<RevisionId>, AuditError> {
        self.ensure_open()?;

        let Some(revision) = self.revision.clone() else {
            self.finish(TxState::Committed);
            tracing::debug!(tx_id = %self.id, "Committed transaction without tracked writes");
            return Ok(None);
        };

        self.state = TxState::Committing;
        let snapshots: Vec<AuditedEntitySnapshot> = self
            .pending
            .iter()
            .filter_map(|change| {
                change.kind.map(|kind| AuditedEntitySnapshot {
                    entity_type: change.key.entity_type.clone(),
                    entity_id: change.key.entity_id.clone(),
                    revision_id: revision.revision_id,
                    change_kind: kind,
                    field_state: change.field_state.clone(),
                })
            })
            .collect();

        if snapshots.is_empty() {
            self.finish(TxState::Committed);
            tracing::info!(
                tx_id = %self.id,
                revision_id = %revision.revision_id,
                "All tracked changes cancelled out, revision left unused"
            );
            return Ok(None);
        }

        let labels: Vec<(String, &'static str)> = snapshots
            .iter()
            .map(|s| (s.entity_type.clone(), s.change_kind.as_str()))
            .collect();
        let unit = CommitUnit {
            tx_id: self.id,
            revision: revision.clone(),
            snapshots,
        };

        let started = Instant::now();
        let interceptor = Arc::clone(&self.interceptor);
        match interceptor.backend.commit(unit).await {
            Ok(()) => {
                self.finish(TxState::Committed);
                if let Some(metrics) = &interceptor.metrics {
                    let labels: Vec<(&str, &str)> =
                        labels.iter().map(|(t, k)| (t.as_str(), *k)).collect();
                    metrics.record_commit(&labels, started.elapsed().as_secs_f64());
                }
                tracing::info!(
                    tx_id = %self.id,
                    revision_id = %revision.revision_id,
                    actor = %revision.actor,
                    snapshots = labels.len(),
                    "✅ Committed revision with audit snapshots"
                );
                Ok(Some(revision.revision_id))
            }
            Err(e) => {
                if e.is_invariant_violation() {
                    tracing::error!(
                        tx_id = %self.id,
                        revision_id = %revision.revision_id,
                        error = %e,
                        "Audit invariant violated, transaction aborted"
                    );
                }
                self.abort(e.kind());
                Err(e)
            }
        }
    }

    /// Discard every buffered write.
    pub fn rollback(mut self) {
        if !self.state.is_terminal() {
            self.abort("rollback");
        }
    }

    fn ensure_open(&self) -> Result<(), AuditError> {
        if self.state.is_terminal() || self.state == TxState::Committing {
            return Err(AuditError::TransactionClosed(self.id, self.state.as_str()));
        }
        Ok(())
    }

    fn abort(&mut self, reason: &str) {
        let discarded = self.pending.len();
        self.finish(TxState::Aborted);
        if let Some(metrics) = &self.interceptor.metrics {
            metrics.record_abort(reason);
        }
        tracing::warn!(
            tx_id = %self.id,
            revision_id = ?self.revision.as_ref().map(|r| r.revision_id.value()),
            reason,
            discarded,
            "Transaction aborted, buffered audit writes discarded"
        );
    }

    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.pending.clear();
        self.index.clear();
        self.interceptor.clock.release(self.id);
        self.interceptor.update_open_gauge();
    }
}

impl Drop for AuditTransaction {
    fn drop(&mut self) {
        match self.state {
            // Read-only: nothing was allocated, nothing to discard.
            TxState::Idle => self.finish(TxState::Aborted),
            state if !state.is_terminal() => self.abort("dropped"),
            _ => {}
        }
    }
}
