//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use freetun_common::GatewayOperation;

/// Coordinator metrics.
#[derive(Default)]
pub struct Metrics {
    /// Projects posted.
    pub projects_posted: AtomicU64,
    /// Projects cancelled without escrow.
    pub projects_cancelled: AtomicU64,
    /// Proposals submitted.
    pub proposals_submitted: AtomicU64,
    /// Proposals accepted.
    pub proposals_accepted: AtomicU64,
    /// Escrows funded.
    pub escrows_funded: AtomicU64,
    /// Escrows released to the freelancer.
    pub escrows_released: AtomicU64,
    /// Escrows refunded to the client.
    pub escrows_refunded: AtomicU64,
    /// Captures declined.
    pub escrows_failed: AtomicU64,
    /// Disputes raised.
    pub disputes_raised: AtomicU64,
    /// Disputes resolved by an admin.
    pub disputes_resolved: AtomicU64,
    /// Gateway calls made.
    pub gateway_calls: AtomicU64,
    /// Gateway calls declined.
    pub gateway_declines: AtomicU64,
    /// Gateway calls with unknown outcome.
    pub gateway_unconfirmed: AtomicU64,
    /// Transactions currently awaiting reconciliation.
    pub reconciliations_pending: AtomicU64,
    /// Reconciliations completed.
    pub reconciliations_completed: AtomicU64,
    /// Release/refund calls answered from the stored terminal record.
    pub idempotent_replays: AtomicU64,
    /// Actions denied by the verification gate.
    pub authorization_denied: AtomicU64,
    /// Version conflicts retried.
    pub persistence_conflicts: AtomicU64,
    /// Project lock timeouts.
    pub lock_timeouts: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn project_posted(&self) {
        Self::incr(&self.projects_posted);
    }

    pub fn project_cancelled(&self) {
        Self::incr(&self.projects_cancelled);
    }

    pub fn proposal_submitted(&self) {
        Self::incr(&self.proposals_submitted);
    }

    pub fn proposal_accepted(&self) {
        Self::incr(&self.proposals_accepted);
    }

    pub fn dispute_raised(&self) {
        Self::incr(&self.disputes_raised);
    }

    pub fn dispute_resolved(&self) {
        Self::incr(&self.disputes_resolved);
    }

    pub fn idempotent_replay(&self) {
        Self::incr(&self.idempotent_replays);
    }

    pub fn authorization_denied(&self) {
        Self::incr(&self.authorization_denied);
    }

    pub fn persistence_conflict(&self) {
        Self::incr(&self.persistence_conflicts);
    }

    pub fn lock_timeout(&self) {
        Self::incr(&self.lock_timeouts);
    }

    /// Record a gateway call before it is made.
    pub fn gateway_called(&self) {
        Self::incr(&self.gateway_calls);
    }

    /// Record a confirmed gateway operation.
    pub fn gateway_confirmed(&self, operation: GatewayOperation) {
        match operation {
            GatewayOperation::Capture => Self::incr(&self.escrows_funded),
            GatewayOperation::Payout => Self::incr(&self.escrows_released),
            GatewayOperation::Refund => Self::incr(&self.escrows_refunded),
        }
    }

    /// Record a declined gateway operation.
    pub fn gateway_declined(&self, operation: GatewayOperation) {
        Self::incr(&self.gateway_declines);
        if operation == GatewayOperation::Capture {
            Self::incr(&self.escrows_failed);
        }
    }

    /// Record a gateway call left for reconciliation.
    pub fn gateway_unconfirmed(&self) {
        Self::incr(&self.gateway_unconfirmed);
        self.reconciliations_pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished reconciliation.
    pub fn reconciliation_completed(&self) {
        Self::incr(&self.reconciliations_completed);
        let _ = self.reconciliations_pending.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            projects_posted: load(&self.projects_posted),
            projects_cancelled: load(&self.projects_cancelled),
            proposals_submitted: load(&self.proposals_submitted),
            proposals_accepted: load(&self.proposals_accepted),
            escrows_funded: load(&self.escrows_funded),
            escrows_released: load(&self.escrows_released),
            escrows_refunded: load(&self.escrows_refunded),
            escrows_failed: load(&self.escrows_failed),
            disputes_raised: load(&self.disputes_raised),
            disputes_resolved: load(&self.disputes_resolved),
            gateway_calls: load(&self.gateway_calls),
            gateway_declines: load(&self.gateway_declines),
            gateway_unconfirmed: load(&self.gateway_unconfirmed),
            reconciliations_pending: load(&self.reconciliations_pending),
            reconciliations_completed: load(&self.reconciliations_completed),
            idempotent_replays: load(&self.idempotent_replays),
            authorization_denied: load(&self.authorization_denied),
            persistence_conflicts: load(&self.persistence_conflicts),
            lock_timeouts: load(&self.lock_timeouts),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let series: [(&str, &str, &str, u64); 19] = [
            ("projects_posted", "counter", "Total projects posted", s.projects_posted),
            ("projects_cancelled", "counter", "Total projects cancelled", s.projects_cancelled),
            ("proposals_submitted", "counter", "Total proposals submitted", s.proposals_submitted),
            ("proposals_accepted", "counter", "Total proposals accepted", s.proposals_accepted),
            ("escrows_funded", "counter", "Total escrows funded", s.escrows_funded),
            ("escrows_released", "counter", "Total escrows released", s.escrows_released),
            ("escrows_refunded", "counter", "Total escrows refunded", s.escrows_refunded),
            ("escrows_failed", "counter", "Total captures declined", s.escrows_failed),
            ("disputes_raised", "counter", "Total disputes raised", s.disputes_raised),
            ("disputes_resolved", "counter", "Total disputes resolved", s.disputes_resolved),
            ("gateway_calls", "counter", "Total gateway calls", s.gateway_calls),
            ("gateway_declines", "counter", "Total gateway calls declined", s.gateway_declines),
            ("gateway_unconfirmed", "counter", "Total gateway calls with unknown outcome", s.gateway_unconfirmed),
            ("reconciliations_pending", "gauge", "Transactions awaiting reconciliation", s.reconciliations_pending),
            ("reconciliations_completed", "counter", "Total reconciliations completed", s.reconciliations_completed),
            ("idempotent_replays", "counter", "Total release/refund replays", s.idempotent_replays),
            ("authorization_denied", "counter", "Total actions denied", s.authorization_denied),
            ("persistence_conflicts", "counter", "Total version conflicts retried", s.persistence_conflicts),
            ("lock_timeouts", "counter", "Total project lock timeouts", s.lock_timeouts),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            out.push_str(&format!(
                "# HELP freetun_{name} {help}\n# TYPE freetun_{name} {kind}\nfreetun_{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub projects_posted: u64,
    pub projects_cancelled: u64,
    pub proposals_submitted: u64,
    pub proposals_accepted: u64,
    pub escrows_funded: u64,
    pub escrows_released: u64,
    pub escrows_refunded: u64,
    pub escrows_failed: u64,
    pub disputes_raised: u64,
    pub disputes_resolved: u64,
    pub gateway_calls: u64,
    pub gateway_declines: u64,
    pub gateway_unconfirmed: u64,
    pub reconciliations_pending: u64,
    pub reconciliations_completed: u64,
    pub idempotent_replays: u64,
    pub authorization_denied: u64,
    pub persistence_conflicts: u64,
    pub lock_timeouts: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.gateway_called();
        metrics.gateway_confirmed(GatewayOperation::Capture);
        metrics.gateway_called();
        metrics.gateway_declined(GatewayOperation::Capture);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gateway_calls, 2);
        assert_eq!(snapshot.escrows_funded, 1);
        assert_eq!(snapshot.escrows_failed, 1);
    }

    #[test]
    fn test_reconciliation_gauge_never_underflows() {
        let metrics = Metrics::new();
        metrics.reconciliation_completed();
        assert_eq!(metrics.snapshot().reconciliations_pending, 0);

        metrics.gateway_unconfirmed();
        metrics.gateway_unconfirmed();
        metrics.reconciliation_completed();
        assert_eq!(metrics.snapshot().reconciliations_pending, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.project_posted();

        let output = metrics.to_prometheus();
        assert!(output.contains("freetun_projects_posted 1"));
        assert!(output.contains("# TYPE freetun_reconciliations_pending gauge"));
    }
}
