//! Data model for the scheduling ledger.
//!
//! A `ScheduledTaskRecord` is the durable statement "this unit of work should
//! happen for this match at this time". Cache markers may expire; the record
//! does not.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::TaskHandle;

/// Longest `last_error` kept on a record.
pub const MAX_ERROR_LEN: usize = 500;

// ---------------------------------------------------------------------------
// WorkType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    ThreadCreation,
    LiveReportingStart,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::ThreadCreation => "thread_creation",
            WorkType::LiveReportingStart => "live_reporting_start",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Lifecycle state of a record.
///
/// ```text
/// Scheduled ──▶ Running ──▶ Completed
///     │  ▲         │
///     │  └─resume──┼──── Paused
///     │            ▼
///     └──────▶ Failed | Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduled,
    Running,
    Completed,
    Failed,
    Expired,
    Paused,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Expired => "expired",
            TaskState::Paused => "paused",
        }
    }

    /// Scheduled or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Scheduled | TaskState::Running)
    }

    /// States that hold the (subject, work-type) slot. A paused record keeps
    /// its slot so that resuming it can never produce a second active record.
    pub fn holds_slot(&self) -> bool {
        self.is_active() || matches!(self, TaskState::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Expired
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ScheduledTaskRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskRecord {
    pub id: Uuid,
    pub work_type: WorkType,
    /// The match this work is for.
    pub subject_id: i64,
    pub external_handle: Option<TaskHandle>,
    pub scheduled_time: DateTime<Utc>,
    pub execution_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Handle captured by `mark_paused`, kept until `mark_resumed`.
    pub paused_external_handle: Option<TaskHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTaskRecord {
    pub fn new(subject_id: i64, work_type: WorkType, scheduled_time: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            work_type,
            subject_id,
            external_handle: None,
            scheduled_time,
            execution_time: None,
            completion_time: None,
            state: TaskState::Scheduled,
            retry_count: 0,
            last_error: None,
            paused_external_handle: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Truncate to `MAX_ERROR_LEN` characters on a char boundary.
pub fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_scheduled() {
        let r = ScheduledTaskRecord::new(42, WorkType::ThreadCreation, Utc::now());
        assert_eq!(r.state, TaskState::Scheduled);
        assert_eq!(r.retry_count, 0);
        assert!(r.external_handle.is_none());
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN + 20);
        let t = truncate_error(&long);
        assert_eq!(t.chars().count(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn state_classification() {
        assert!(TaskState::Scheduled.is_active());
        assert!(TaskState::Running.is_active());
        assert!(!TaskState::Paused.is_active());
        assert!(TaskState::Paused.holds_slot());
        assert!(TaskState::Expired.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
    }
}
