//! Reconciliation Monitor: compares what the ledger says should happen with
//! what the execution backend reports, and repairs the difference.
//!
//! Drift is not an error. Every correction is listed in the report and the
//! ledger is updated so the next pass sees a consistent picture.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, TaskHandle, TaskStatus};
use crate::config::ReconciliationConfig;
use crate::error::Result;
use crate::ledger::{Ledger, ScheduledTaskRecord, TaskState, WorkType};
use crate::scheduler::submission_for;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Repair {
    InSync,
    MarkedRunning,
    MarkedCompleted,
    Expired,
    Resubmitted {
        previous: Option<TaskHandle>,
        handle: TaskHandle,
    },
    /// The repair itself failed; the record is left for the next pass.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCheck {
    pub record_id: Uuid,
    pub work_type: WorkType,
    /// Backend status, when the record had a handle to ask about.
    pub status: Option<TaskStatus>,
    pub repair: Repair,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub subject_id: i64,
    pub checked: usize,
    pub repaired: usize,
    /// Scheduled records already past their time when the pass began.
    #[serde(default)]
    pub overdue: usize,
    pub records: Vec<RecordCheck>,
}

pub struct ReconciliationMonitor {
    ledger: Arc<Ledger>,
    backend: Arc<dyn ExecutionBackend>,
    expire_after: chrono::Duration,
}

impl ReconciliationMonitor {
    pub fn new(
        ledger: Arc<Ledger>,
        backend: Arc<dyn ExecutionBackend>,
        cfg: &ReconciliationConfig,
    ) -> Self {
        Self {
            ledger,
            backend,
            expire_after: chrono::Duration::seconds(
                i64::try_from(cfg.expire_after_secs).unwrap_or(i64::MAX / 1_000),
            ),
        }
    }

    /// Check every active record for one subject.
    pub fn verify(&self, subject_id: i64) -> Result<ReconciliationReport> {
        let now = Utc::now();
        let pending = self.ledger.get_pending(now, None)?;
        self.verify_at(subject_id, now, &pending)
    }

    fn verify_at(
        &self,
        subject_id: i64,
        now: DateTime<Utc>,
        pending: &[ScheduledTaskRecord],
    ) -> Result<ReconciliationReport> {
        let overdue = pending.iter().filter(|r| r.subject_id == subject_id).count();
        let mut records = Vec::new();
        for record in self.ledger.list_for_subject(subject_id)? {
            if !record.state.is_active() {
                continue;
            }
            records.push(self.check(&record, now));
        }

        let repaired = records
            .iter()
            .filter(|c| !matches!(c.repair, Repair::InSync | Repair::Failed { .. }))
            .count();
        if repaired > 0 {
            tracing::warn!(subject_id, repaired, "reconciliation repaired drift");
        }
        Ok(ReconciliationReport {
            subject_id,
            checked: records.len(),
            repaired,
            overdue,
            records,
        })
    }

    /// Verify every subject that has an active record. A subject that fails
    /// to verify is logged and skipped.
    pub fn sweep(&self) -> Result<BTreeMap<i64, ReconciliationReport>> {
        let now = Utc::now();
        let pending = self.ledger.get_pending(now, None)?;
        if !pending.is_empty() {
            tracing::warn!(overdue = pending.len(), "scheduled work past due");
        }

        let mut subjects: Vec<i64> = self
            .ledger
            .list_active()?
            .into_iter()
            .map(|r| r.subject_id)
            .collect();
        subjects.sort_unstable();
        subjects.dedup();

        let mut reports = BTreeMap::new();
        for subject_id in subjects {
            match self.verify_at(subject_id, now, &pending) {
                Ok(report) => {
                    reports.insert(subject_id, report);
                }
                Err(e) => tracing::error!(subject_id, error = %e, "reconciliation failed"),
            }
        }
        tracing::info!(subjects = reports.len(), "reconciliation sweep finished");
        Ok(reports)
    }

    fn check(&self, record: &ScheduledTaskRecord, now: DateTime<Utc>) -> RecordCheck {
        let mut status = None;
        let outcome = match &record.external_handle {
            None => self.resubmit(record, now, None),
            Some(handle) => match self.backend.status(handle) {
                Err(e) => Err(e),
                Ok(s) => {
                    status = Some(s);
                    self.apply_status(record, handle, s, now)
                }
            },
        };

        let repair = outcome.unwrap_or_else(|e| {
            tracing::error!(id = %record.id, subject_id = record.subject_id, error = %e, "repair failed");
            Repair::Failed {
                error: e.to_string(),
            }
        });
        RecordCheck {
            record_id: record.id,
            work_type: record.work_type,
            status,
            repair,
        }
    }

    fn apply_status(
        &self,
        record: &ScheduledTaskRecord,
        handle: &TaskHandle,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Repair> {
        match status {
            s if s.needs_resubmission() => {
                if s == TaskStatus::Failed {
                    return self.resubmit(record, now, Some("execution failed"));
                }
                tracing::warn!(id = %record.id, handle = %handle, ?status, "scheduled work lost");
                self.resubmit(record, now, None)
            }
            TaskStatus::Running if record.state == TaskState::Running => Ok(Repair::InSync),
            TaskStatus::Running => {
                self.ledger.mark_running(record.id, None)?;
                Ok(Repair::MarkedRunning)
            }
            TaskStatus::Succeeded => {
                self.ledger.mark_completed(record.id)?;
                Ok(Repair::MarkedCompleted)
            }
            _ => Ok(Repair::InSync),
        }
    }

    /// Replace lost or failed work, or expire the record when it is too far
    /// past its time to matter.
    fn resubmit(
        &self,
        record: &ScheduledTaskRecord,
        now: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<Repair> {
        if now - record.scheduled_time > self.expire_after {
            if let Some(handle) = &record.external_handle {
                if let Err(e) = self.backend.revoke(handle) {
                    tracing::warn!(handle = %handle, error = %e, "revoke of expired work failed");
                }
            }
            self.ledger.mark_expired(record.id)?;
            tracing::info!(id = %record.id, subject_id = record.subject_id, "record expired");
            return Ok(Repair::Expired);
        }

        let handle = self.backend.submit(submission_for(
            record.work_type,
            record.subject_id,
            record.scheduled_time,
            now,
        ))?;
        self.ledger.reschedule(record.id, handle.clone(), error)?;
        tracing::info!(
            id = %record.id,
            subject_id = record.subject_id,
            work_type = %record.work_type,
            handle = %handle,
            "work resubmitted"
        );
        Ok(Repair::Resubmitted {
            previous: record.external_handle.clone(),
            handle,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Schedule, WorkItem};
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<Ledger>,
        backend: Arc<MemoryBackend>,
        monitor: ReconciliationMonitor,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&dir.path().join("ledger.redb")).unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let monitor = ReconciliationMonitor::new(
            ledger.clone(),
            backend.clone(),
            &ReconciliationConfig::default(),
        );
        Fixture {
            _dir: dir,
            ledger,
            backend,
            monitor,
        }
    }

    fn scheduled_with_handle(f: &Fixture, subject: i64, at: DateTime<Utc>) -> (Uuid, TaskHandle) {
        let record = f
            .ledger
            .create_if_absent(subject, WorkType::LiveReportingStart, at)
            .unwrap();
        let handle = f
            .backend
            .submit(submission_for(record.work_type, subject, at, Utc::now()))
            .unwrap();
        f.ledger.attach_handle(record.id, handle.clone()).unwrap();
        (record.id, handle)
    }

    #[test]
    fn pending_work_is_in_sync() {
        let f = fixture();
        scheduled_with_handle(&f, 1, Utc::now() + Duration::hours(1));
        let report = f.monitor.verify(1).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.repaired, 0);
        assert_eq!(report.records[0].repair, Repair::InSync);
    }

    #[test]
    fn lost_work_is_resubmitted_for_original_eta() {
        let f = fixture();
        let at = Utc::now() + Duration::hours(1);
        let (id, handle) = scheduled_with_handle(&f, 2, at);
        f.backend.forget(&handle);

        let report = f.monitor.verify(2).unwrap();
        assert_eq!(report.repaired, 1);
        let Repair::Resubmitted { previous, handle: new } = &report.records[0].repair else {
            panic!("expected resubmission, got {:?}", report.records[0].repair);
        };
        assert_eq!(previous.as_ref(), Some(&handle));

        let (_, sub) = f.backend.last_submission().unwrap();
        assert_eq!(sub.schedule, Schedule::Eta(at));
        assert_eq!(sub.work, WorkItem::StartLiveReporting { match_id: 2 });

        let record = f.ledger.get(id).unwrap().unwrap();
        assert_eq!(record.external_handle.as_ref(), Some(new));
        assert_eq!(record.state, TaskState::Scheduled);
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn failed_work_counts_a_retry_and_runs_now() {
        let f = fixture();
        let (id, handle) = scheduled_with_handle(&f, 3, Utc::now() - Duration::minutes(10));
        f.backend.set_status(&handle, TaskStatus::Failed);

        f.monitor.verify(3).unwrap();
        let (_, sub) = f.backend.last_submission().unwrap();
        assert_eq!(sub.schedule, Schedule::Now);

        let record = f.ledger.get(id).unwrap().unwrap();
        assert!(record.state.is_active());
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.is_some());
    }

    #[test]
    fn record_without_handle_is_submitted() {
        let f = fixture();
        let record = f
            .ledger
            .create_if_absent(4, WorkType::ThreadCreation, Utc::now() + Duration::days(1))
            .unwrap();
        let report = f.monitor.verify(4).unwrap();
        assert!(matches!(
            report.records[0].repair,
            Repair::Resubmitted { previous: None, .. }
        ));
        assert!(f
            .ledger
            .get(record.id)
            .unwrap()
            .unwrap()
            .external_handle
            .is_some());
    }

    #[test]
    fn revoked_work_is_resubmitted_without_a_retry() {
        let f = fixture();
        let (id, handle) = scheduled_with_handle(&f, 11, Utc::now() + Duration::hours(2));
        f.backend.set_status(&handle, TaskStatus::Revoked);

        let report = f.monitor.verify(11).unwrap();
        assert_eq!(report.records[0].status, Some(TaskStatus::Revoked));
        assert!(matches!(report.records[0].repair, Repair::Resubmitted { .. }));
        let record = f.ledger.get(id).unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
        assert_ne!(record.external_handle, Some(handle));
    }

    #[test]
    fn backend_progress_moves_the_ledger() {
        let f = fixture();
        let (id, handle) = scheduled_with_handle(&f, 5, Utc::now() - Duration::minutes(1));
        f.backend.set_status(&handle, TaskStatus::Running);
        assert_eq!(
            f.monitor.verify(5).unwrap().records[0].repair,
            Repair::MarkedRunning
        );
        assert_eq!(f.ledger.get(id).unwrap().unwrap().state, TaskState::Running);

        f.backend.set_status(&handle, TaskStatus::Succeeded);
        assert_eq!(
            f.monitor.verify(5).unwrap().records[0].repair,
            Repair::MarkedCompleted
        );
        assert_eq!(f.ledger.get(id).unwrap().unwrap().state, TaskState::Completed);
    }

    #[test]
    fn long_overdue_records_expire_instead() {
        let f = fixture();
        let (id, handle) = scheduled_with_handle(&f, 6, Utc::now() - Duration::hours(7));
        f.backend.forget(&handle);
        let before = f.backend.submissions().len();

        let report = f.monitor.verify(6).unwrap();
        assert_eq!(report.records[0].repair, Repair::Expired);
        assert_eq!(f.backend.submissions().len(), before);
        assert_eq!(f.ledger.get(id).unwrap().unwrap().state, TaskState::Expired);
    }

    #[test]
    fn submit_failure_is_reported_not_raised() {
        let f = fixture();
        let (_, handle) = scheduled_with_handle(&f, 7, Utc::now() + Duration::hours(1));
        f.backend.forget(&handle);
        f.backend.set_rejecting(true);
        let report = f.monitor.verify(7).unwrap();
        assert!(matches!(report.records[0].repair, Repair::Failed { .. }));
        assert_eq!(report.repaired, 0);
    }

    #[test]
    fn sweep_counts_overdue_work_per_subject() {
        let f = fixture();
        scheduled_with_handle(&f, 12, Utc::now() - Duration::minutes(20));
        scheduled_with_handle(&f, 13, Utc::now() + Duration::hours(1));

        let reports = f.monitor.sweep().unwrap();
        assert_eq!(reports[&12].overdue, 1);
        assert_eq!(reports[&12].records[0].repair, Repair::InSync);
        assert_eq!(reports[&13].overdue, 0);
    }

    #[test]
    fn sweep_covers_every_active_subject() {
        let f = fixture();
        scheduled_with_handle(&f, 8, Utc::now() + Duration::hours(1));
        scheduled_with_handle(&f, 9, Utc::now() + Duration::hours(1));
        let done = f
            .ledger
            .create_if_absent(10, WorkType::ThreadCreation, Utc::now())
            .unwrap();
        f.ledger.mark_completed(done.id).unwrap();

        let reports = f.monitor.sweep().unwrap();
        assert_eq!(reports.keys().copied().collect::<Vec<_>>(), vec![8, 9]);
    }
}
