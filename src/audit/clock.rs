use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::core::{AuditError, RevisionStamp};
use super::store::RevisionSequence;

// ============================================================================
// Revision Clock
// ============================================================================
//
// Hands out one revision per transaction. The first call for a transaction
// draws a number from the backing sequence; later calls for the same
// transaction return that same stamp until the transaction is released.
//
// The allocation table is only touched synchronously, so it can also be
// released from `Drop`.
//
// ============================================================================

pub struct RevisionClock {
    sequence: Arc<dyn RevisionSequence>,
    allocations: Mutex<HashMap<Uuid, RevisionStamp>>,
}

impl RevisionClock {
    pub fn new(sequence: Arc<dyn RevisionSequence>) -> Self {
        Self {
            sequence,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Revision of transaction `tx_id`, allocating it on first use.
    pub async fn begin_or_join_transaction_revision(&self, tx_id: Uuid) -> Result<RevisionStamp, AuditError> {
        let existing = self.allocations().get(&tx_id).copied();
        if let Some(stamp) = existing {
            return Ok(stamp);
        }

        let revision_id = self.sequence.next_revision().await?;
        let stamp = RevisionStamp::now(revision_id);

        // A concurrent call for the same transaction may have won the race;
        // its stamp stands and ours becomes a gap.
        let stamp = *self.allocations().entry(tx_id).or_insert(stamp);

        tracing::debug!(
            tx_id = %tx_id,
            revision_id = %stamp.revision_id,
            "Allocated transaction revision"
        );
        Ok(stamp)
    }

    /// Forget the allocation of a finished transaction.
    pub fn release(&self, tx_id: Uuid) -> Option<RevisionStamp> {
        self.allocations().remove(&tx_id)
    }

    /// Number of transactions currently holding a revision.
    pub fn open_allocations(&self) -> usize {
        self.allocations().len()
    }

    fn allocations(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RevisionStamp>> {
        self.allocations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::store::{FailPoint, InMemoryAuditStore};

    fn clock() -> (Arc<InMemoryAuditStore>, RevisionClock) {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = RevisionClock::new(store.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn test_same_transaction_joins_revision() {
        let (_, clock) = clock();
        let tx = Uuid::now_v7();

        let first = clock.begin_or_join_transaction_revision(tx).await.unwrap();
        let second = clock.begin_or_join_transaction_revision(tx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(clock.open_allocations(), 1);
    }

    #[tokio::test]
    async fn test_distinct_transactions_get_increasing_revisions() {
        let (_, clock) = clock();

        let a = clock.begin_or_join_transaction_revision(Uuid::now_v7()).await.unwrap();
        let b = clock.begin_or_join_transaction_revision(Uuid::now_v7()).await.unwrap();

        assert!(a.revision_id < b.revision_id);
        assert!(a.timestamp <= b.timestamp);
    }

    #[tokio::test]
    async fn test_released_revision_is_never_reused() {
        let (_, clock) = clock();
        let tx = Uuid::now_v7();

        let first = clock.begin_or_join_transaction_revision(tx).await.unwrap();
        assert_eq!(clock.release(tx), Some(first));
        assert_eq!(clock.open_allocations(), 0);

        let again = clock.begin_or_join_transaction_revision(tx).await.unwrap();
        assert!(again.revision_id > first.revision_id);
    }

    #[tokio::test]
    async fn test_unavailable_sequence() {
        let (store, clock) = clock();
        store.fail_at(FailPoint::AllocateRevision, 1);

        let err = clock
            .begin_or_join_transaction_revision(Uuid::now_v7())
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::ClockUnavailable(_)));
        assert_eq!(clock.open_allocations(), 0);
    }
}
