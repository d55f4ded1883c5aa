use futures_util::future::BoxFuture;
use futures_util::TryStreamExt;
use std::sync::Arc;

use super::errors::CompanyError;
use super::model::Company;
use super::repository::CompanyRepository;
use crate::audit::{
    AuditInterceptor, AuditTransaction, Audited, ChangeKind, ExecutionContext, RevisionId,
    RevisionRecord,
};
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// Company Service
// ============================================================================
//
// Orchestrates: call → transaction → repository → commit
//
// Every mutating call is its own audited transaction. Store outages are
// retried by replaying the whole transaction; a failed attempt leaves no
// trace, so replaying is safe.
//
// ============================================================================

/// One entry of a company's history.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyRevision {
    pub revision: RevisionRecord,
    pub change_kind: ChangeKind,
    pub company: Company,
}

pub struct CompanyService {
    interceptor: Arc<AuditInterceptor>,
    repository: CompanyRepository,
    retry: RetryConfig,
}

impl CompanyService {
    pub fn new(interceptor: Arc<AuditInterceptor>) -> Self {
        let repository = CompanyRepository::new(interceptor.backend());
        Self {
            interceptor,
            repository,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn get(&self, id: i64) -> Result<Company, CompanyError> {
        let tx = self.interceptor.begin(ExecutionContext::anonymous());
        self.repository
            .find(&tx, id)
            .await?
            .ok_or_else(|| CompanyError::NotFound(format!("id {}", id)))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Company, CompanyError> {
        let tx = self.interceptor.begin(ExecutionContext::anonymous());
        self.repository
            .find_by_name(&tx, name)
            .await?
            .ok_or_else(|| CompanyError::NotFound(format!("name {:?}", name)))
    }

    pub async fn get_all(&self) -> Result<Vec<Company>, CompanyError> {
        let tx = self.interceptor.begin(ExecutionContext::anonymous());
        self.repository.find_all(&tx).await
    }

    pub async fn create(&self, ctx: &ExecutionContext, company: Company) -> Result<(), CompanyError> {
        self.run("create", ctx, |repository, tx| {
            let company = company.clone();
            Box::pin(async move { repository.create(tx, &company).await })
        })
        .await
    }

    pub async fn update(&self, ctx: &ExecutionContext, company: Company) -> Result<Company, CompanyError> {
        self.run("update", ctx, |repository, tx| {
            let company = company.clone();
            Box::pin(async move { repository.update(tx, &company).await })
        })
        .await
    }

    pub async fn delete(&self, ctx: &ExecutionContext, id: i64) -> Result<(), CompanyError> {
        self.run("delete", ctx, |repository, tx| {
            Box::pin(async move { repository.delete(tx, id).await })
        })
        .await
    }

    pub async fn delete_entity(&self, ctx: &ExecutionContext, company: &Company) -> Result<(), CompanyError> {
        let company = company.clone();
        self.run("delete", ctx, |repository, tx| {
            let company = company.clone();
            Box::pin(async move { repository.delete_entity(tx, &company).await })
        })
        .await
    }

    /// Full history of a company, oldest revision first.
    pub async fn history(&self, id: i64) -> Result<Vec<CompanyRevision>, CompanyError> {
        let backend = self.interceptor.backend();
        let entity_id = id.to_string();
        let mut snapshots = backend.history_of(Company::ENTITY_TYPE, &entity_id);

        let mut history = Vec::new();
        while let Some(snapshot) = snapshots.try_next().await? {
            let revision = backend.get(snapshot.revision_id).await?;
            history.push(CompanyRevision {
                revision,
                change_kind: snapshot.change_kind,
                company: snapshot.decode()?,
            });
        }
        Ok(history)
    }

    /// State of a company as of `revision_id`.
    pub async fn as_of(&self, id: i64, revision_id: RevisionId) -> Result<CompanyRevision, CompanyError> {
        let backend = self.interceptor.backend();
        let snapshot = backend
            .as_of(Company::ENTITY_TYPE, &id.to_string(), revision_id)
            .await?;
        let revision = backend.get(snapshot.revision_id).await?;

        Ok(CompanyRevision {
            revision,
            change_kind: snapshot.change_kind,
            company: snapshot.decode()?,
        })
    }

    pub async fn revision(&self, revision_id: RevisionId) -> Result<RevisionRecord, CompanyError> {
        Ok(self.interceptor.backend().get(revision_id).await?)
    }

    /// Run `work` in a fresh transaction and commit it, replaying the whole
    /// transaction on transient store failures.
    async fn run<T, F>(
        &self,
        operation: &'static str,
        ctx: &ExecutionContext,
        work: F,
    ) -> Result<T, CompanyError>
    where
        F: for<'t> Fn(&'t CompanyRepository, &'t mut AuditTransaction) -> BoxFuture<'t, Result<T, CompanyError>>,
    {
        let work = &work;
        let outcome = retry_on_transient(self.retry.clone(), move |attempt| async move {
            let mut tx = self.interceptor.begin(ctx.clone());
            tracing::debug!(operation, attempt, tx_id = %tx.id(), "Running company operation");

            let value = work(&self.repository, &mut tx).await?;
            tx.commit().await?;
            Ok::<_, CompanyError>(value)
        })
        .await;

        outcome.into_result().map_err(|e| {
            tracing::warn!(operation, error = %e, "Company operation failed");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ContextActorResolver, FailPoint, FixedActorResolver, InMemoryAuditStore};
    use crate::metrics::AuditMetrics;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn setup() -> (Arc<InMemoryAuditStore>, CompanyService) {
        let store = Arc::new(InMemoryAuditStore::new());
        let interceptor = Arc::new(AuditInterceptor::new(
            store.clone(),
            Arc::new(FixedActorResolver::default()),
        ));
        (store, CompanyService::new(interceptor).with_retry(fast_retry()))
    }

    #[tokio::test]
    async fn test_company_lifecycle_scenario() {
        let (_, service) = setup();
        let ctx = ExecutionContext::anonymous();

        service.create(&ctx, Company::new(1, "Acme")).await.unwrap();
        service.update(&ctx, Company::new(1, "Acme Corp")).await.unwrap();
        service.delete(&ctx, 1).await.unwrap();

        let history = service.history(1).await.unwrap();
        let summary: Vec<_> = history
            .iter()
            .map(|h| (h.revision.revision_id.value(), h.change_kind, h.company.name.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, ChangeKind::Created, "Acme"),
                (2, ChangeKind::Updated, "Acme Corp"),
                (3, ChangeKind::Deleted, "Acme Corp"),
            ]
        );
        assert!(history.iter().all(|h| h.revision.actor == "admin"));

        let at_two = service.as_of(1, RevisionId::new(2)).await.unwrap();
        assert_eq!(at_two.change_kind, ChangeKind::Updated);
        assert_eq!(at_two.company, Company::new(1, "Acme Corp"));

        assert!(matches!(service.get(1).await, Err(CompanyError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_history_is_a_valid_lifecycle() {
        let (_, service) = setup();
        let ctx = ExecutionContext::anonymous();

        service.create(&ctx, Company::new(1, "A")).await.unwrap();
        for name in ["B", "C", "D"] {
            service.update(&ctx, Company::new(1, name)).await.unwrap();
        }
        // Rejected operations must not show up in history.
        assert!(service.create(&ctx, Company::new(1, "dup")).await.is_err());
        service.delete(&ctx, 1).await.unwrap();
        assert!(service.delete(&ctx, 1).await.is_err());
        assert!(service.update(&ctx, Company::new(1, "zombie")).await.is_err());
        assert!(matches!(
            service.create(&ctx, Company::new(1, "Reborn")).await,
            Err(CompanyError::IdRetired(1))
        ));

        let kinds: Vec<ChangeKind> = service
            .history(1)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.change_kind)
            .collect();

        assert_eq!(kinds.first(), Some(&ChangeKind::Created));
        assert_eq!(kinds.last(), Some(&ChangeKind::Deleted));
        assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::Created).count(), 1);
        assert_eq!(kinds.len(), 5);
    }

    #[tokio::test]
    async fn test_as_of_reproduces_each_update() {
        let (_, service) = setup();
        let ctx = ExecutionContext::anonymous();
        service.create(&ctx, Company::new(1, "v0")).await.unwrap();

        for i in 1..=4 {
            service.update(&ctx, Company::new(1, format!("v{i}"))).await.unwrap();
        }

        for entry in service.history(1).await.unwrap() {
            let replayed = service.as_of(1, entry.revision.revision_id).await.unwrap();
            assert_eq!(replayed.company, entry.company);
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (store, service) = setup();
        let ctx = ExecutionContext::anonymous();
        store.fail_at(FailPoint::AfterPrimaryWrite, 1);

        service.create(&ctx, Company::new(1, "Acme")).await.unwrap();

        let history = service.history(1).await.unwrap();
        assert_eq!(history.len(), 1);
        // The first attempt's revision is a gap.
        assert_eq!(history[0].revision.revision_id, RevisionId::new(2));
        assert_eq!(store.revision_count().await, 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_leaves_no_trace() {
        let (store, service) = setup();
        let ctx = ExecutionContext::anonymous();
        store.fail_at(FailPoint::AfterPrimaryWrite, 10);

        let err = service.create(&ctx, Company::new(1, "Acme")).await.unwrap_err();
        assert!(matches!(err, CompanyError::Audit(_)));

        store.fail_at(FailPoint::AfterPrimaryWrite, 0);
        assert!(service.get_all().await.unwrap().is_empty());
        assert!(service.history(1).await.unwrap().is_empty());
        assert_eq!(store.revision_count().await, 0);
    }

    #[tokio::test]
    async fn test_lookup_by_name_and_listing() {
        let (_, service) = setup();
        let ctx = ExecutionContext::anonymous();
        service.create(&ctx, Company::new(2, "Globex")).await.unwrap();
        service.create(&ctx, Company::new(1, "Acme")).await.unwrap();

        assert_eq!(service.get_by_name("Globex").await.unwrap(), Company::new(2, "Globex"));
        assert!(matches!(service.get_by_name("Nope").await, Err(CompanyError::NotFound(_))));

        let all = service.get_all().await.unwrap();
        assert_eq!(all, vec![Company::new(1, "Acme"), Company::new(2, "Globex")]);
    }

    #[tokio::test]
    async fn test_reads_are_not_counted_as_aborts() {
        let store = Arc::new(InMemoryAuditStore::new());
        let metrics = Arc::new(AuditMetrics::new().unwrap());
        let interceptor = Arc::new(
            AuditInterceptor::new(store, Arc::new(FixedActorResolver::default()))
                .with_metrics(metrics.clone()),
        );
        let service = CompanyService::new(interceptor).with_retry(fast_retry());
        let ctx = ExecutionContext::anonymous();

        service.create(&ctx, Company::new(1, "Acme")).await.unwrap();
        service.get(1).await.unwrap();
        service.get_all().await.unwrap();
        assert!(service.get_by_name("nobody").await.is_err());

        assert_eq!(metrics.transactions_aborted.with_label_values(&["dropped"]).get(), 0);
        assert_eq!(metrics.revisions_committed.get(), 1);
    }

    #[tokio::test]
    async fn test_delete_entity_and_revision_lookup() {
        let store = Arc::new(InMemoryAuditStore::new());
        let interceptor = Arc::new(AuditInterceptor::new(store, Arc::new(ContextActorResolver::default())));
        let service = CompanyService::new(interceptor).with_retry(fast_retry());

        let alice = ExecutionContext::for_principal("alice");
        let bob = ExecutionContext::for_principal("bob");
        service.create(&alice, Company::new(1, "Acme")).await.unwrap();
        service.delete_entity(&bob, &Company::new(1, "Acme")).await.unwrap();

        assert_eq!(service.revision(RevisionId::new(1)).await.unwrap().actor, "alice");
        assert_eq!(service.revision(RevisionId::new(2)).await.unwrap().actor, "bob");
        assert!(matches!(
            service.revision(RevisionId::new(3)).await,
            Err(CompanyError::Audit(_))
        ));
    }
}
