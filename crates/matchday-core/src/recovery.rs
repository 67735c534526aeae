//! Emergency Recovery: the global last-resort sweep.
//!
//! Runs only when the system as a whole is backed up (aggregate depth over
//! the limit, or any single queue past its emergency threshold). Each action
//! is isolated: one failing step is logged and recorded, and the rest still
//! run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{ExecutionBackend, Schedule, Submission, TaskHandle, WorkItem};
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::lease::{sweep_leaked, SweepOutcome};
use crate::queue::QueueName;
use crate::queue_health::{QueueHealthMonitor, QueueSummary};
use crate::remediation::{RemediationAction, RemediationKind};
use crate::store::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub name: String,
    /// Keys cleared or queue items removed.
    pub cleared: u64,
    pub failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryStep {
    fn failed(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            cleared: 0,
            failures: 1,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub emergency_triggered: bool,
    pub before_total: u64,
    pub after_total: u64,
    pub tasks_removed: u64,
    pub actions: Vec<RecoveryStep>,
    pub timestamp: DateTime<Utc>,
}

pub struct EmergencyRecovery {
    store: Arc<dyn KeyValueStore>,
    monitor: Arc<QueueHealthMonitor>,
    backend: Arc<dyn ExecutionBackend>,
    cfg: RecoveryConfig,
}

impl EmergencyRecovery {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        monitor: Arc<QueueHealthMonitor>,
        backend: Arc<dyn ExecutionBackend>,
        cfg: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            backend,
            cfg,
        }
    }

    pub fn should_trigger(&self, summary: &QueueSummary) -> bool {
        summary.total_tasks > self.cfg.aggregate_limit
            || summary
                .queues
                .iter()
                .any(|(q, depth)| *depth > self.monitor.thresholds_for(*q).emergency)
    }

    /// Check the trigger and, if met, run every recovery action. Errors only
    /// when queue depths cannot be read at all.
    pub fn run(&self) -> Result<RecoveryReport> {
        let before = self.monitor.get_summary()?;
        if !self.should_trigger(&before) {
            tracing::debug!(total = before.total_tasks, "emergency recovery not needed");
            return Ok(RecoveryReport {
                emergency_triggered: false,
                before_total: before.total_tasks,
                after_total: before.total_tasks,
                tasks_removed: 0,
                actions: Vec::new(),
                timestamp: Utc::now(),
            });
        }

        tracing::error!(
            total = before.total_tasks,
            limit = self.cfg.aggregate_limit,
            "system-wide backlog, running emergency recovery"
        );

        let mut actions = Vec::with_capacity(4);
        actions.push(self.sweep_step(
            "clear_scheduler_leases",
            RemediationKind::SchedulerLeaseCleanup,
            &self.cfg.scheduler_lease_pattern,
            Duration::from_secs(self.cfg.scheduler_lease_max_ttl_secs),
            None,
        ));
        actions.push(self.sweep_step(
            "clear_worker_leases",
            RemediationKind::WorkerLeaseCleanup,
            &self.cfg.worker_lease_pattern,
            Duration::from_secs(self.cfg.worker_lease_max_ttl_secs),
            None,
        ));

        let queue_report = self.monitor.check_health();
        let tasks_removed = queue_report.tasks_removed();
        actions.push(RecoveryStep {
            name: "queue_remediation".to_string(),
            cleared: tasks_removed,
            failures: queue_report.remediation_failures + queue_report.unreadable.len() as u64,
            error: None,
        });

        actions.push(self.sweep_step(
            "clear_stale_results",
            RemediationKind::ResultCleanup,
            &self.cfg.result_pattern,
            Duration::from_secs(self.cfg.result_max_ttl_secs),
            Some(self.cfg.result_sample),
        ));

        let after_total = match self.monitor.get_summary() {
            Ok(s) => s.total_tasks,
            Err(e) => {
                tracing::warn!(error = %e, "could not recompute depth after recovery");
                before.total_tasks.saturating_sub(tasks_removed)
            }
        };

        tracing::warn!(
            before = before.total_tasks,
            after = after_total,
            removed = tasks_removed,
            "emergency recovery finished"
        );
        Ok(RecoveryReport {
            emergency_triggered: true,
            before_total: before.total_tasks,
            after_total,
            tasks_removed,
            actions,
            timestamp: Utc::now(),
        })
    }

    fn sweep_step(
        &self,
        name: &str,
        kind: RemediationKind,
        pattern: &str,
        ceiling: Duration,
        limit: Option<usize>,
    ) -> RecoveryStep {
        match sweep_leaked(self.store.as_ref(), pattern, ceiling, limit) {
            Ok(SweepOutcome {
                scanned,
                cleared,
                failures,
            }) => {
                RemediationAction::new(kind, pattern, scanned, scanned - cleared)
                    .with_failures(failures)
                    .emit(self.store.as_ref());
                RecoveryStep {
                    name: name.to_string(),
                    cleared,
                    failures,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(step = name, error = %e, "recovery step failed");
                RecoveryStep::failed(name, e.to_string())
            }
        }
    }

    /// Entry point for an `EmergencyRecovery { attempt }` unit of work. A
    /// failed run is resubmitted after the retry delay while attempts remain.
    pub fn handle(&self, attempt: u32) -> Result<RecoveryReport> {
        match self.run() {
            Ok(report) => Ok(report),
            Err(e) => {
                if attempt < self.cfg.max_retries {
                    match self.schedule_retry(attempt + 1) {
                        Ok(handle) => tracing::warn!(
                            attempt,
                            error = %e,
                            handle = %handle,
                            "emergency recovery failed, retry scheduled"
                        ),
                        Err(submit_err) => tracing::error!(
                            attempt,
                            error = %e,
                            submit_error = %submit_err,
                            "emergency recovery failed and retry could not be scheduled"
                        ),
                    }
                } else {
                    tracing::error!(attempt, error = %e, "emergency recovery failed, giving up");
                }
                Err(e)
            }
        }
    }

    fn schedule_retry(&self, attempt: u32) -> Result<TaskHandle> {
        self.backend.submit(
            Submission::new(WorkItem::EmergencyRecovery { attempt }, QueueName::Primary)
                .with_schedule(Schedule::Countdown(Duration::from_secs(self.cfg.retry_delay_secs))),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::queue::default_threshold_table;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        backend: Arc<MemoryBackend>,
        recovery: EmergencyRecovery,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemoryBackend::new());
        let monitor = Arc::new(QueueHealthMonitor::new(store.clone(), default_threshold_table()));
        let recovery = EmergencyRecovery::new(
            store.clone(),
            monitor,
            backend.clone(),
            RecoveryConfig::default(),
        );
        Fixture {
            store,
            backend,
            recovery,
        }
    }

    fn fill(store: &MemoryStore, queue: QueueName, n: usize) {
        for i in 0..n {
            store.rpush(queue.key(), &format!("item-{i}")).unwrap();
        }
    }

    #[test]
    fn below_trigger_is_a_noop() {
        let f = fixture();
        fill(&f.store, QueueName::Primary, 50);
        f.store.set("worker-lease:stuck", "x").unwrap();

        let report = f.recovery.run().unwrap();
        assert!(!report.emergency_triggered);
        assert!(report.actions.is_empty());
        assert_eq!(report.before_total, 50);
        assert_eq!(report.after_total, 50);
        assert!(f.store.get("worker-lease:stuck").unwrap().is_some());
    }

    #[test]
    fn single_queue_past_emergency_triggers() {
        let f = fixture();
        fill(&f.store, QueueName::LiveReporting, 120);
        f.store.set("scheduler-lease:orchestrator", "x").unwrap();
        f.store.set("worker-lease:stuck", "x").unwrap();
        f.store
            .setex("worker-lease:busy", Duration::from_secs(60), "x")
            .unwrap();
        f.store.set("task-meta:old", "{}").unwrap();

        let report = f.recovery.run().unwrap();
        assert!(report.emergency_triggered);
        assert_eq!(report.before_total, 120);
        assert_eq!(report.after_total, 24);
        assert_eq!(report.tasks_removed, 96);
        assert_eq!(report.actions.len(), 4);
        assert_eq!(report.actions[0].cleared, 1);
        assert_eq!(report.actions[1].cleared, 1);
        assert_eq!(report.actions[3].cleared, 1);

        assert!(f.store.get("scheduler-lease:orchestrator").unwrap().is_none());
        assert!(f.store.get("worker-lease:busy").unwrap().is_some());
    }

    #[test]
    fn aggregate_over_limit_triggers() {
        let f = fixture();
        // Each queue stays below its own emergency threshold.
        fill(&f.store, QueueName::Primary, 450);
        fill(&f.store, QueueName::Integration, 560);
        let summary = QueueHealthMonitor::new(f.store.clone(), default_threshold_table())
            .get_summary()
            .unwrap();
        assert!(f.recovery.should_trigger(&summary));
    }

    #[test]
    fn failure_schedules_exactly_one_retry() {
        let f = fixture();
        f.store.set_available(false);

        assert!(f.recovery.handle(0).is_err());
        let (_, sub) = f.backend.last_submission().unwrap();
        assert_eq!(sub.work, WorkItem::EmergencyRecovery { attempt: 1 });
        assert_eq!(sub.schedule, Schedule::Countdown(Duration::from_secs(300)));

        assert!(f.recovery.handle(1).is_err());
        assert_eq!(f.backend.submissions().len(), 1);
    }
}
