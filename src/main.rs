use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use company_audit::audit::{
    AuditInterceptor, Audited, ChangeKind, ExecutionContext, InMemoryAuditStore, PgAuditStore,
};
use company_audit::config::AuditConfig;
use company_audit::domain::company::{Company, CompanyService};
use company_audit::metrics::{self, AuditMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,company_audit=debug"))
        )
        .init();

    tracing::info!("🚀 Starting Company audit demo");

    // === 1. Load configuration ===
    let config = AuditConfig::from_env()?;

    // === 2. Initialize Prometheus metrics ===
    let metrics = Arc::new(AuditMetrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    if config.metrics_enabled() {
        // Start metrics HTTP server in background thread
        let metrics_registry = Arc::new(metrics.registry().clone());
        let port = config.metrics_port;
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Metrics runtime error: {}", e);
                    return;
                }
            };
            rt.block_on(async {
                if let Err(e) = metrics::start_metrics_server(metrics_registry, port).await {
                    tracing::error!("Metrics server error: {}", e);
                }
            });
        });
    }

    // === 3. Pick the audit store ===
    let resolver = config.actor_resolver();
    let interceptor = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to Postgres...");
            let store = PgAuditStore::connect(url, config.max_connections).await?;
            store.ensure_schema(&[Company::ENTITY_TYPE]).await?;
            AuditInterceptor::new(Arc::new(store), resolver)
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory audit store");
            AuditInterceptor::new(Arc::new(InMemoryAuditStore::new()), resolver)
        }
    };
    let interceptor = Arc::new(interceptor.with_metrics(metrics.clone()));

    let service = CompanyService::new(interceptor).with_retry(config.retry_config());

    // === 4. Demonstrate a full company lifecycle ===
    tracing::info!("📝 Demonstrating company lifecycle with revision history");
    let ctx = ExecutionContext::for_principal(config.default_actor.clone());
    // Deleted ids are never reused, so every run starts a fresh company
    let id = chrono::Utc::now().timestamp_millis();

    service.create(&ctx, Company::new(id, "Acme")).await?;
    tracing::info!("✅ Company created: {}", id);

    let renamed = service.update(&ctx, service.get(id).await?.renamed("Acme Corp")).await?;
    tracing::info!("✅ Company renamed: {}", renamed.name);

    service.delete(&ctx, id).await?;
    tracing::info!("✅ Company deleted: {}", id);

    // === 5. Read the history back ===
    let history = service.history(id).await?;
    for entry in &history {
        tracing::info!(
            revision_id = %entry.revision.revision_id,
            actor = %entry.revision.actor,
            timestamp = %entry.revision.timestamp,
            change_kind = %entry.change_kind,
            name = %entry.company.name,
            "📜 Revision"
        );
    }

    // Replay the latest rename
    let Some(rename) = history.iter().rev().find(|entry| entry.change_kind == ChangeKind::Updated) else {
        return Err(anyhow::anyhow!("No rename recorded for company {}", id));
    };
    let snapshot = service.as_of(id, rename.revision.revision_id).await?;
    tracing::info!(
        revision_id = %rename.revision.revision_id,
        change_kind = %snapshot.change_kind,
        name = %snapshot.company.name,
        "🔎 State as of revision"
    );

    tracing::info!("🎉 Demo complete!");

    Ok(())
}
