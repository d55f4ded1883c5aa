use async_trait::async_trait;
use chrono::DateTime;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};

use super::backend::{CommitSink, CommitUnit, EntityTable, RevisionSequence, RevisionStore, SnapshotStore};
use crate::audit::core::{
    table_name, AuditError, AuditedEntitySnapshot, ChangeKind, RevisionId, RevisionRecord,
};

// ============================================================================
// Postgres Audit Store
// ============================================================================
//
// Schema (compatible with the classic REVINFO / *_AUD layout):
//
//   audit.revinfo      (rev BIGINT PK, revtstmp BIGINT epoch millis, username TEXT)
//   audit.revinfo_seq  revision numbers
//   audit.<type>_aud   (entity_id, rev FK, revtype SMALLINT, field_state JSONB)
//                      PRIMARY KEY (entity_id, rev)
//   public.<type>      (id TEXT PK, field_state JSONB)   current state
//
// A commit unit runs in a single database transaction. Dropping the
// transaction on any error rolls everything back.
//
// ============================================================================

const HISTORY_PAGE_SIZE: i64 = 256;

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AuditError> {
        tracing::info!(max_connections, "Connecting to Postgres audit store");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(store_error)?;
        Ok(Self::new(pool))
    }

    /// Create the revision table, the sequence, and the primary and history
    /// tables of every listed entity type.
    pub async fn ensure_schema(&self, entity_types: &[&str]) -> Result<(), AuditError> {
        let mut statements = vec![
            "CREATE SCHEMA IF NOT EXISTS audit".to_string(),
            "CREATE SEQUENCE IF NOT EXISTS audit.revinfo_seq".to_string(),
            "CREATE TABLE IF NOT EXISTS audit.revinfo (
                rev BIGINT PRIMARY KEY,
                revtstmp BIGINT NOT NULL,
                username TEXT NOT NULL
            )"
            .to_string(),
        ];

        for entity_type in entity_types {
            let table = table_name(entity_type)?;
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS public.{table} (
                    id TEXT PRIMARY KEY,
                    field_state JSONB NOT NULL
                )"
            ));
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS audit.{table}_aud (
                    entity_id TEXT NOT NULL,
                    rev BIGINT NOT NULL REFERENCES audit.revinfo (rev),
                    revtype SMALLINT NOT NULL CHECK (revtype IN (0, 1, 2)),
                    field_state JSONB NOT NULL,
                    PRIMARY KEY (entity_id, rev)
                )"
            ));
        }

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }

        tracing::info!(entity_types = ?entity_types, "✅ Audit schema ready");
        Ok(())
    }
}

fn store_error(e: sqlx::Error) -> AuditError {
    AuditError::StoreUnavailable(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn revision_from_row(row: &PgRow) -> Result<RevisionRecord, AuditError> {
    let rev: i64 = row.try_get("rev").map_err(store_error)?;
    let millis: i64 = row.try_get("revtstmp").map_err(store_error)?;
    let username: String = row.try_get("username").map_err(store_error)?;

    let timestamp = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        AuditError::StoreUnavailable(format!("revision {} has out-of-range timestamp {}", rev, millis))
    })?;

    Ok(RevisionRecord {
        revision_id: RevisionId::new(rev),
        timestamp,
        actor: username,
    })
}

fn snapshot_from_row(entity_type: &str, row: &PgRow) -> Result<AuditedEntitySnapshot, AuditError> {
    let entity_id: String = row.try_get("entity_id").map_err(store_error)?;
    let rev: i64 = row.try_get("rev").map_err(store_error)?;
    let revtype: i16 = row.try_get("revtype").map_err(store_error)?;
    let Json(field_state): Json<Value> = row.try_get("field_state").map_err(store_error)?;

    let change_kind = ChangeKind::from_code(revtype).ok_or_else(|| {
        AuditError::StoreUnavailable(format!("unknown revtype {} at revision {}", revtype, rev))
    })?;

    Ok(AuditedEntitySnapshot {
        entity_type: entity_type.to_string(),
        entity_id,
        revision_id: RevisionId::new(rev),
        change_kind,
        field_state,
    })
}

async fn insert_revision(conn: &mut PgConnection, record: &RevisionRecord) -> Result<(), AuditError> {
    sqlx::query("INSERT INTO audit.revinfo (rev, revtstmp, username) VALUES ($1, $2, $3)")
        .bind(record.revision_id.value())
        .bind(record.timestamp_millis())
        .bind(&record.actor)
        .execute(conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AuditError::DuplicateRevision(record.revision_id)
            } else {
                store_error(e)
            }
        })?;
    Ok(())
}

async fn append_snapshot(conn: &mut PgConnection, snapshot: &AuditedEntitySnapshot) -> Result<(), AuditError> {
    let table = table_name(&snapshot.entity_type)?;
    let sql = format!(
        "INSERT INTO audit.{table}_aud (entity_id, rev, revtype, field_state) VALUES ($1, $2, $3, $4)"
    );

    sqlx::query(&sql)
        .bind(&snapshot.entity_id)
        .bind(snapshot.revision_id.value())
        .bind(snapshot.change_kind.code())
        .bind(Json(&snapshot.field_state))
        .execute(conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AuditError::DuplicateSnapshot {
                    entity_type: snapshot.entity_type.clone(),
                    entity_id: snapshot.entity_id.clone(),
                    revision_id: snapshot.revision_id,
                }
            } else {
                store_error(e)
            }
        })?;
    Ok(())
}

/// Apply the primary-table effect of one snapshot.
async fn apply_primary(conn: &mut PgConnection, snapshot: &AuditedEntitySnapshot) -> Result<(), AuditError> {
    let table = table_name(&snapshot.entity_type)?;
    let conflict = || AuditError::EntityStateConflict {
        entity_type: snapshot.entity_type.clone(),
        entity_id: snapshot.entity_id.clone(),
        change_kind: snapshot.change_kind,
    };

    let result = match snapshot.change_kind {
        ChangeKind::Created => {
            let sql = format!("INSERT INTO public.{table} (id, field_state) VALUES ($1, $2)");
            sqlx::query(&sql)
                .bind(&snapshot.entity_id)
                .bind(Json(&snapshot.field_state))
                .execute(conn)
                .await
        }
        ChangeKind::Updated => {
            let sql = format!("UPDATE public.{table} SET field_state = $2 WHERE id = $1");
            sqlx::query(&sql)
                .bind(&snapshot.entity_id)
                .bind(Json(&snapshot.field_state))
                .execute(conn)
                .await
        }
        ChangeKind::Deleted => {
            let sql = format!("DELETE FROM public.{table} WHERE id = $1");
            sqlx::query(&sql)
                .bind(&snapshot.entity_id)
                .execute(conn)
                .await
        }
    };

    match result {
        Ok(done) if done.rows_affected() == 1 => Ok(()),
        Ok(_) => Err(conflict()),
        Err(e) if is_unique_violation(&e) => Err(conflict()),
        Err(e) => Err(store_error(e)),
    }
}

#[async_trait]
impl RevisionSequence for PgAuditStore {
    async fn next_revision(&self) -> Result<RevisionId, AuditError> {
        let row = sqlx::query("SELECT nextval('audit.revinfo_seq') AS rev")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AuditError::ClockUnavailable(e.to_string()))?;
        let rev: i64 = row
            .try_get("rev")
            .map_err(|e| AuditError::ClockUnavailable(e.to_string()))?;
        Ok(RevisionId::new(rev))
    }
}

#[async_trait]
impl RevisionStore for PgAuditStore {
    async fn insert(&self, record: RevisionRecord) -> Result<(), AuditError> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        insert_revision(&mut conn, &record).await
    }

    async fn get(&self, revision_id: RevisionId) -> Result<RevisionRecord, AuditError> {
        let row = sqlx::query("SELECT rev, revtstmp, username FROM audit.revinfo WHERE rev = $1")
            .bind(revision_id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or_else(|| AuditError::NotFound(format!("revision {}", revision_id)))?;
        revision_from_row(&row)
    }
}

#[async_trait]
impl SnapshotStore for PgAuditStore {
    async fn append(&self, snapshot: AuditedEntitySnapshot) -> Result<(), AuditError> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        append_snapshot(&mut conn, &snapshot).await
    }

    fn history_of<'a>(
        &'a self,
        entity_type: &str,
        entity_id: &str,
    ) -> BoxStream<'a, Result<AuditedEntitySnapshot, AuditError>> {
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();

        // Keyset pagination: each page resumes after the last revision seen.
        let pages = stream::unfold(Some(0i64), move |cursor| {
            let entity_type = entity_type.clone();
            let entity_id = entity_id.clone();
            async move {
                let after = cursor?;
                let page = self.history_page(&entity_type, &entity_id, after).await;
                let next = match &page {
                    Ok(rows) if rows.len() as i64 == HISTORY_PAGE_SIZE => {
                        rows.last().map(|s| s.revision_id.value())
                    }
                    _ => None,
                };
                Some((page, next))
            }
        });

        pages
            .map(|page| match page {
                Ok(rows) => stream::iter(rows.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::iter(vec![Err::<AuditedEntitySnapshot, _>(e)]).right_stream(),
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
        let table = table_name(entity_type)?;
        let sql = format!(
            "SELECT entity_id, rev, revtype, field_state FROM audit.{table}_aud
             WHERE entity_id = $1 AND rev <= $2
             ORDER BY rev DESC LIMIT 1"
        );

        let row = sqlx::query(&sql)
            .bind(entity_id)
            .bind(revision_id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                AuditError::NotFound(format!(
                    "{}#{} as of revision {}",
                    entity_type, entity_id, revision_id
                ))
            })?;
        snapshot_from_row(entity_type, &row)
    }
}

impl PgAuditStore {
    async fn history_page(
        &self,
        entity_type: &str,
        entity_id: &str,
        after: i64,
    ) -> Result<Vec<AuditedEntitySnapshot>, AuditError> {
        let table = table_name(entity_type)?;
        let sql = format!(
            "SELECT entity_id, rev, revtype, field_state FROM audit.{table}_aud
             WHERE entity_id = $1 AND rev > $2
             ORDER BY rev ASC LIMIT $3"
        );

        let rows = sqlx::query(&sql)
            .bind(entity_id)
            .bind(after)
            .bind(HISTORY_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        tracing::debug!(entity_type, entity_id, after, rows = rows.len(), "Loaded history page");
        rows.iter().map(|row| snapshot_from_row(entity_type, row)).collect()
    }
}

fn entity_rows(rows: Vec<PgRow>) -> Result<Vec<(String, Value)>, AuditError> {
    rows.iter()
        .map(|row| {
            let id: String = row.try_get("id").map_err(store_error)?;
            let Json(state): Json<Value> = row.try_get("field_state").map_err(store_error)?;
            Ok((id, state))
        })
        .collect()
}

#[async_trait]
impl EntityTable for PgAuditStore {
    async fn load(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>, AuditError> {
        let table = table_name(entity_type)?;
        let sql = format!("SELECT field_state FROM public.{table} WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        row.map(|row| {
            let Json(state): Json<Value> = row.try_get("field_state").map_err(store_error)?;
            Ok(state)
        })
        .transpose()
    }

    async fn load_all(&self, entity_type: &str) -> Result<Vec<(String, Value)>, AuditError> {
        let table = table_name(entity_type)?;
        let sql = format!("SELECT id, field_state FROM public.{table} ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        entity_rows(rows)
    }

    async fn load_where(
        &self,
        entity_type: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, AuditError> {
        let table = table_name(entity_type)?;
        // Field names are bound as parameters, never spliced in.
        let sql = format!(
            "SELECT id, field_state FROM public.{table}
             WHERE field_state -> $1 = $2
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(field)
            .bind(Json(value))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        entity_rows(rows)
    }
}

#[async_trait]
impl CommitSink for PgAuditStore {
    async fn commit(&self, unit: CommitUnit) -> Result<(), AuditError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        for snapshot in &unit.snapshots {
            apply_primary(&mut tx, snapshot).await?;
        }

        insert_revision(&mut tx, &unit.revision).await?;
        for snapshot in &unit.snapshots {
            append_snapshot(&mut tx, snapshot).await?;
        }

        tx.commit().await.map_err(store_error)?;

        tracing::debug!(
            tx_id = %unit.tx_id,
            revision_id = %unit.revision.revision_id,
            snapshots = unit.snapshots.len(),
            "Commit unit applied to Postgres"
        );
        Ok(())
    }
}
