// Private module declaration
mod server;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the audit trail
// ============================================================================
//
// Provides metrics for:
// - Revisions committed and snapshots written per entity type
// - Aborted transactions by reason
// - Commit latency
// - Transactions currently holding a revision
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

pub struct AuditMetrics {
    registry: Registry,

    pub revisions_committed: IntCounter,
    pub snapshots_written: IntCounterVec,
    pub transactions_aborted: IntCounterVec,
    pub commit_duration: Histogram,
    pub open_revisions: IntGauge,
}

impl AuditMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let revisions_committed = IntCounter::new(
            "audit_revisions_committed_total",
            "Total revisions durably committed",
        )?;
        registry.register(Box::new(revisions_committed.clone()))?;

        let snapshots_written = IntCounterVec::new(
            Opts::new("audit_snapshots_written_total", "Total entity snapshots written"),
            &["entity_type", "change_kind"],
        )?;
        registry.register(Box::new(snapshots_written.clone()))?;

        let transactions_aborted = IntCounterVec::new(
            Opts::new("audit_transactions_aborted_total", "Transactions rolled back, by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(transactions_aborted.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("audit_commit_duration_seconds", "Atomic flush duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        let open_revisions = IntGauge::new(
            "audit_open_revisions",
            "Transactions holding an allocated but uncommitted revision",
        )?;
        registry.register(Box::new(open_revisions.clone()))?;

        Ok(Self {
            registry,
            revisions_committed,
            snapshots_written,
            transactions_aborted,
            commit_duration,
            open_revisions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_commit(&self, snapshots: &[(&str, &str)], duration_secs: f64) {
        self.revisions_committed.inc();
        for (entity_type, change_kind) in snapshots {
            self.snapshots_written
                .with_label_values(&[*entity_type, *change_kind])
                .inc();
        }
        self.commit_duration.observe(duration_secs);
    }

    pub fn record_abort(&self, reason: &str) {
        self.transactions_aborted.with_label_values(&[reason]).inc();
    }

    pub fn set_open_revisions(&self, open: usize) {
        self.open_revisions.set(open as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = AuditMetrics::new().unwrap();
        metrics.record_abort("rollback");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_commit() {
        let metrics = AuditMetrics::new().unwrap();
        metrics.record_commit(&[("Company", "CREATED"), ("Company", "UPDATED")], 0.002);
        metrics.record_commit(&[("Company", "CREATED")], 0.003);

        let gathered = metrics.registry.gather();
        let revisions = gathered
            .iter()
            .find(|m| m.name() == "audit_revisions_committed_total")
            .unwrap();
        assert_eq!(revisions.metric[0].counter.value, Some(2.0));

        let snapshots = gathered
            .iter()
            .find(|m| m.name() == "audit_snapshots_written_total")
            .unwrap();
        assert_eq!(snapshots.metric.len(), 2); // CREATED and UPDATED labels
    }

    #[test]
    fn test_record_abort() {
        let metrics = AuditMetrics::new().unwrap();
        metrics.record_abort("store_unavailable");
        metrics.record_abort("store_unavailable");

        let gathered = metrics.registry.gather();
        let aborted = gathered
            .iter()
            .find(|m| m.name() == "audit_transactions_aborted_total")
            .unwrap();
        assert_eq!(aborted.metric[0].counter.value, Some(2.0));
    }

    #[test]
    fn test_open_revisions_gauge() {
        let metrics = AuditMetrics::new().unwrap();
        metrics.set_open_revisions(3);

        let gathered = metrics.registry.gather();
        let open = gathered.iter().find(|m| m.name() == "audit_open_revisions").unwrap();
        assert_eq!(open.metric[0].gauge.value, Some(3.0));
    }
}
