/// Per-client replication counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    pub updates_applied: u64,
    pub deletes_applied: u64,
    pub snapshots_served: u64,
    pub snapshots_applied: u64,
    pub audits_run: u64,
}

impl SyncMetrics {
    pub fn log_summary(&self, client: &str) {
        tracing::info!(
            target: "influence_sync::metrics",
            client,
            sent = self.messages_sent,
            received = self.messages_received,
            send_failures = self.send_failures,
            updates = self.updates_applied,
            deletes = self.deletes_applied,
            snapshots_served = self.snapshots_served,
            snapshots_applied = self.snapshots_applied,
            audits = self.audits_run,
            "metrics.summary"
        );
    }
}
