use futures_util::TryStreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::errors::CompanyError;
use super::model::Company;
use crate::audit::{AuditBackend, AuditTransaction, Audited, Buffered, EntityKey};

// ============================================================================
// Company Repository
// ============================================================================
//
// Plain CRUD over the current-state table. Writes go through the
// transaction, which is what records them in the audit trail; reads see
// the transaction's own buffered writes first.
//
// ============================================================================

pub struct CompanyRepository {
    backend: Arc<dyn AuditBackend>,
}

fn decode(state: Value) -> Result<Company, CompanyError> {
    Ok(serde_json::from_value(state)?)
}

impl CompanyRepository {
    pub fn new(backend: Arc<dyn AuditBackend>) -> Self {
        Self { backend }
    }

    pub async fn find(&self, tx: &AuditTransaction, id: i64) -> Result<Option<Company>, CompanyError> {
        let key = EntityKey::new(Company::ENTITY_TYPE, id.to_string());
        match tx.buffered(&key) {
            Some(Buffered::Present(state)) => return decode(state).map(Some),
            Some(Buffered::Removed) => return Ok(None),
            None => {}
        }

        self.backend
            .load(Company::ENTITY_TYPE, &key.entity_id)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn find_by_name(&self, tx: &AuditTransaction, name: &str) -> Result<Option<Company>, CompanyError> {
        let stored = self
            .backend
            .load_where(Company::ENTITY_TYPE, "name", &Value::String(name.to_string()))
            .await?;
        let companies = self.overlay(tx, stored, |company| company.name == name)?;
        Ok(companies.into_values().next())
    }

    pub async fn find_all(&self, tx: &AuditTransaction) -> Result<Vec<Company>, CompanyError> {
        let stored = self.backend.load_all(Company::ENTITY_TYPE).await?;
        let companies = self.overlay(tx, stored, |_| true)?;
        Ok(companies.into_values().collect())
    }

    pub async fn create(&self, tx: &mut AuditTransaction, company: &Company) -> Result<(), CompanyError> {
        company.validate()?;
        if self.find(tx, company.id).await?.is_some() {
            return Err(CompanyError::AlreadyExists(company.id));
        }
        if self.has_history(company.id).await? {
            return Err(CompanyError::IdRetired(company.id));
        }

        tx.created(company).await?;
        Ok(())
    }

    pub async fn update(&self, tx: &mut AuditTransaction, company: &Company) -> Result<Company, CompanyError> {
        company.validate()?;
        if self.find(tx, company.id).await?.is_none() {
            return Err(CompanyError::NotFound(format!("id {}", company.id)));
        }

        tx.updated(company).await?;
        Ok(company.clone())
    }

    pub async fn delete(&self, tx: &mut AuditTransaction, id: i64) -> Result<(), CompanyError> {
        let existing = self
            .find(tx, id)
            .await?
            .ok_or_else(|| CompanyError::NotFound(format!("id {}", id)))?;

        tx.deleted(&existing).await?;
        Ok(())
    }

    /// Deletes by the entity's id; the snapshot records the stored state.
    pub async fn delete_entity(&self, tx: &mut AuditTransaction, company: &Company) -> Result<(), CompanyError> {
        self.delete(tx, company.id).await
    }

    /// Whether any revision ever recorded this id. A deleted company's id
    /// is never handed out again, so its history keeps a single CREATED.
    async fn has_history(&self, id: i64) -> Result<bool, CompanyError> {
        let entity_id = id.to_string();
        let mut history = self.backend.history_of(Company::ENTITY_TYPE, &entity_id);
        Ok(history.try_next().await?.is_some())
    }

    /// Merge stored rows with what `tx` has buffered, keyed by id.
    fn overlay(
        &self,
        tx: &AuditTransaction,
        stored: Vec<(String, Value)>,
        keep: impl Fn(&Company) -> bool,
    ) -> Result<BTreeMap<i64, Company>, CompanyError> {
        let mut companies = BTreeMap::new();
        for (_, state) in stored {
            let company = decode(state)?;
            companies.insert(company.id, company);
        }

        for (id, buffered) in tx.buffered_of_type(Company::ENTITY_TYPE) {
            if let Ok(id) = id.parse::<i64>() {
                companies.remove(&id);
            }
            if let Buffered::Present(state) = buffered {
                let company = decode(state)?;
                if keep(&company) {
                    companies.insert(company.id, company);
                }
            }
        }

        Ok(companies)
    }
}
