use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

// ============================================================================
// Metrics HTTP endpoint
// ============================================================================
//
// GET /metrics  Prometheus text exposition of the audit registry
// GET /health   liveness plus the number of transactions holding a revision
//
// ============================================================================

/// Serve the audit registry on `0.0.0.0:port` until the server stops.
///
/// The binary runs this on its own thread with a dedicated runtime, so a
/// slow scrape never competes with audited transactions.
pub async fn start_metrics_server(registry: Arc<Registry>, port: u16) -> std::io::Result<()> {
    tracing::info!(port, "📊 Audit metrics available at http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .configure(routes)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_handler))
        .route("/health", web::get().to(health_handler));
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode audit metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

/// Current value of the open-revisions gauge, if registered.
fn open_revisions(registry: &Registry) -> Option<f64> {
    registry
        .gather()
        .iter()
        .find(|family| family.name() == "audit_open_revisions")
        .and_then(|family| family.metric.first())
        .and_then(|metric| metric.gauge.value)
}

async fn health_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "company-audit",
        "open_revisions": open_revisions(&registry),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AuditMetrics;
    use actix_web::test;

    fn registry_of(metrics: &AuditMetrics) -> web::Data<Arc<Registry>> {
        web::Data::new(Arc::new(metrics.registry().clone()))
    }

    #[actix_web::test]
    async fn test_metrics_endpoint_exposes_audit_counters() {
        let metrics = AuditMetrics::new().unwrap();
        metrics.record_abort("rollback");

        let app = test::init_service(App::new().app_data(registry_of(&metrics)).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert!(resp.status().is_success());

        let body = test::read_body(resp).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("audit_transactions_aborted_total"));
    }

    #[actix_web::test]
    async fn test_health_reports_open_revisions() {
        let metrics = AuditMetrics::new().unwrap();
        metrics.set_open_revisions(2);

        let app = test::init_service(App::new().app_data(registry_of(&metrics)).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["open_revisions"], 2.0);
    }
}
