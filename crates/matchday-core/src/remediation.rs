//! Remediation actions: emitted as a structured log event and a counter in
//! the shared store, never persisted as rows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::KeyValueStore;

pub const METRICS_PREFIX: &str = "metrics:remediation:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    /// Emergency tier: keep only the newest fraction of a queue.
    EmergencyPurge,
    /// Critical tier: drop expired or unreadable items, then halve.
    CriticalCleanup,
    /// Warning tier: alert only.
    WarningAlert,
    SchedulerLeaseCleanup,
    WorkerLeaseCleanup,
    ResultCleanup,
}

impl RemediationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationKind::EmergencyPurge => "emergency_purge",
            RemediationKind::CriticalCleanup => "critical_cleanup",
            RemediationKind::WarningAlert => "warning_alert",
            RemediationKind::SchedulerLeaseCleanup => "scheduler_lease_cleanup",
            RemediationKind::WorkerLeaseCleanup => "worker_lease_cleanup",
            RemediationKind::ResultCleanup => "result_cleanup",
        }
    }

    pub fn metric_key(&self) -> String {
        format!("{METRICS_PREFIX}{}", self.as_str())
    }
}

impl fmt::Display for RemediationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub kind: RemediationKind,
    /// Queue name, or key pattern for lease and result cleanups.
    pub target: String,
    pub before: u64,
    pub after: u64,
    /// Items that could not be processed and were skipped.
    #[serde(default)]
    pub failures: u64,
    pub timestamp: DateTime<Utc>,
}

impl RemediationAction {
    pub fn new(kind: RemediationKind, target: impl Into<String>, before: u64, after: u64) -> Self {
        Self {
            kind,
            target: target.into(),
            before,
            after,
            failures: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = failures;
        self
    }

    pub fn removed(&self) -> u64 {
        self.before.saturating_sub(self.after)
    }

    /// Log the action and bump its counter. A counter failure is logged and
    /// otherwise ignored.
    pub fn emit(&self, store: &dyn KeyValueStore) {
        tracing::warn!(
            kind = %self.kind,
            target = %self.target,
            before = self.before,
            after = self.after,
            removed = self.removed(),
            failures = self.failures,
            "remediation"
        );
        if let Err(e) = store.incr(&self.kind.metric_key()) {
            tracing::warn!(kind = %self.kind, error = %e, "remediation counter not updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn emit_counts_per_kind() {
        let store = MemoryStore::new();
        RemediationAction::new(RemediationKind::EmergencyPurge, "live-reporting", 120, 24).emit(&store);
        RemediationAction::new(RemediationKind::EmergencyPurge, "sync", 300, 60).emit(&store);
        assert_eq!(
            store.get("metrics:remediation:emergency_purge").unwrap().as_deref(),
            Some("2")
        );
    }

    #[test]
    fn emit_survives_store_outage() {
        let store = MemoryStore::new();
        store.set_available(false);
        let action = RemediationAction::new(RemediationKind::CriticalCleanup, "primary", 250, 100);
        action.emit(&store);
        assert_eq!(action.removed(), 150);
    }
}
