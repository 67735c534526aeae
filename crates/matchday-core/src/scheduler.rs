//! Match scheduler: turns a kickoff time into ledger records and submitted
//! work for thread creation and live-reporting start.
//!
//! ```text
//! kickoff - 48h    thread creation       (discarded if not started within 2h)
//! kickoff - 5min   live-reporting start  (discarded if not started within 30min)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, Schedule, Submission, TaskHandle, WorkItem};
use crate::error::Result;
use crate::ledger::{Ledger, ScheduledTaskRecord, TaskState, WorkType};
use crate::queue::QueueName;

fn lead_time(work_type: WorkType) -> Duration {
    match work_type {
        WorkType::ThreadCreation => Duration::hours(48),
        WorkType::LiveReportingStart => Duration::minutes(5),
    }
}

fn expiry_window(work_type: WorkType) -> Duration {
    match work_type {
        WorkType::ThreadCreation => Duration::hours(2),
        WorkType::LiveReportingStart => Duration::minutes(30),
    }
}

/// When `work_type` should run for a match kicking off at `kickoff`.
pub fn window_start(work_type: WorkType, kickoff: DateTime<Utc>) -> DateTime<Utc> {
    kickoff - lead_time(work_type)
}

/// The submission that carries out a ledger record. Work due in the past
/// runs immediately; the expiry window counts from when it becomes due.
pub fn submission_for(
    work_type: WorkType,
    match_id: i64,
    scheduled_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Submission {
    let (work, queue) = match work_type {
        WorkType::ThreadCreation => (WorkItem::CreateThread { match_id }, QueueName::Primary),
        WorkType::LiveReportingStart => (
            WorkItem::StartLiveReporting { match_id },
            QueueName::LiveReporting,
        ),
    };
    let (schedule, due) = if scheduled_time > now {
        (Schedule::Eta(scheduled_time), scheduled_time)
    } else {
        (Schedule::Now, now)
    };
    Submission::new(work, queue)
        .with_schedule(schedule)
        .with_expires(Some(due + expiry_window(work_type)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub work_type: WorkType,
    pub scheduled_time: DateTime<Utc>,
    pub record_id: Option<Uuid>,
    pub handle: Option<TaskHandle>,
    /// Why nothing was submitted, when nothing was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

pub struct MatchScheduler {
    ledger: Arc<Ledger>,
    backend: Arc<dyn ExecutionBackend>,
}

impl MatchScheduler {
    pub fn new(ledger: Arc<Ledger>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { ledger, backend }
    }

    /// Record and submit both windows for a match. Calling this again for
    /// the same match does not submit duplicate work.
    pub fn schedule_match(&self, match_id: i64, kickoff: DateTime<Utc>) -> Result<Vec<ScheduledEntry>> {
        let now = Utc::now();
        let mut entries = Vec::with_capacity(2);

        for work_type in [WorkType::ThreadCreation, WorkType::LiveReportingStart] {
            let scheduled_time = window_start(work_type, kickoff);
            if scheduled_time <= now {
                tracing::info!(match_id, %work_type, %scheduled_time, "window already passed, skipping");
                entries.push(ScheduledEntry {
                    work_type,
                    scheduled_time,
                    record_id: None,
                    handle: None,
                    skipped: Some("window already passed".into()),
                });
                continue;
            }

            let record = self.ledger.create_if_absent(match_id, work_type, scheduled_time)?;
            if record.state != TaskState::Scheduled || record.external_handle.is_some() {
                entries.push(ScheduledEntry {
                    work_type,
                    scheduled_time: record.scheduled_time,
                    record_id: Some(record.id),
                    handle: record.external_handle.clone(),
                    skipped: Some(format!("already {}", record.state)),
                });
                continue;
            }

            let handle = self
                .backend
                .submit(submission_for(work_type, match_id, record.scheduled_time, now))?;
            self.ledger.attach_handle(record.id, handle.clone())?;
            tracing::info!(match_id, %work_type, handle = %handle, %scheduled_time, "match work scheduled");
            entries.push(ScheduledEntry {
                work_type,
                scheduled_time: record.scheduled_time,
                record_id: Some(record.id),
                handle: Some(handle),
                skipped: None,
            });
        }
        Ok(entries)
    }

    /// Pause every active record for a match, revoking its submitted work.
    pub fn pause_match(&self, match_id: i64) -> Result<Vec<ScheduledTaskRecord>> {
        let mut paused = Vec::new();
        for record in self.ledger.list_for_subject(match_id)? {
            if !record.state.is_active() {
                continue;
            }
            let record = self.ledger.mark_paused(record.id)?;
            if let Some(handle) = &record.paused_external_handle {
                if let Err(e) = self.backend.revoke(handle) {
                    tracing::warn!(match_id, handle = %handle, error = %e, "revoke failed");
                }
            }
            tracing::info!(match_id, work_type = %record.work_type, "paused");
            paused.push(record);
        }
        Ok(paused)
    }

    /// Resume every paused record for a match with freshly submitted work.
    pub fn resume_match(&self, match_id: i64) -> Result<Vec<ScheduledTaskRecord>> {
        let now = Utc::now();
        let mut resumed = Vec::new();
        for record in self.ledger.list_for_subject(match_id)? {
            if record.state != TaskState::Paused {
                continue;
            }
            let handle = self.backend.submit(submission_for(
                record.work_type,
                match_id,
                record.scheduled_time,
                now,
            ))?;
            let record = self.ledger.mark_resumed(record.id, handle)?;
            tracing::info!(match_id, work_type = %record.work_type, "resumed");
            resumed.push(record);
        }
        Ok(resumed)
    }
}
