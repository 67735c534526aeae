//! Execution backend: where units of work are submitted, revoked and
//! inspected.
//!
//! Two implementations ship with the crate:
//! - [`StoreBackend`] serializes each submission as a [`QueuedWork`]
//!   envelope onto the named queue list in the shared store, and tracks
//!   status under `task-meta:<id>`. This is what the server runs on.
//! - [`MemoryBackend`] records submissions in memory with scriptable
//!   statuses, for tests.

pub mod memory;
pub mod store_backend;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::QueueName;

pub use memory::MemoryBackend;
pub use store_backend::{StoreBackend, TaskMeta};

// ---------------------------------------------------------------------------
// TaskHandle / TaskStatus
// ---------------------------------------------------------------------------

/// Opaque reference to a submitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: String,
}

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Revoked,
    /// The backend has no record of the handle (expired metadata, lost
    /// message, or never submitted).
    Unknown,
}

impl TaskStatus {
    /// Statuses after which the ledger's intent is no longer being served.
    pub fn needs_resubmission(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Revoked | TaskStatus::Unknown
        )
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// What a unit of work does when executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    /// One orchestration pass. `retries` counts consecutive failed passes.
    Orchestrate { retries: u32 },
    /// Poll and publish live events for one match.
    ProcessMatch { match_id: i64 },
    /// Create the discussion thread ahead of a match.
    CreateThread { match_id: i64 },
    /// Open the live-reporting session for a match.
    StartLiveReporting { match_id: i64 },
    /// Global recovery sweep. `attempt` starts at 0.
    EmergencyRecovery { attempt: u32 },
}

impl WorkItem {
    pub fn name(&self) -> &'static str {
        match self {
            WorkItem::Orchestrate { .. } => "orchestrate",
            WorkItem::ProcessMatch { .. } => "process_match",
            WorkItem::CreateThread { .. } => "create_thread",
            WorkItem::StartLiveReporting { .. } => "start_live_reporting",
            WorkItem::EmergencyRecovery { .. } => "emergency_recovery",
        }
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// When a submitted unit of work becomes eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Now,
    Countdown(Duration),
    Eta(DateTime<Utc>),
}

impl Schedule {
    /// Absolute ETA relative to `now`, or `None` for immediate execution.
    pub fn eta(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Now => None,
            Schedule::Countdown(d) => Some(now + to_chrono(*d)),
            Schedule::Eta(at) => Some(*at),
        }
    }
}

/// Soft limit asks the work to wrap up; hard limit terminates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl TimeLimits {
    pub const fn new(soft: Duration, hard: Duration) -> Self {
        Self { soft, hard }
    }
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(90))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub work: WorkItem,
    pub schedule: Schedule,
    pub queue: QueueName,
    pub limits: TimeLimits,
    /// Discard the work if it has not started by this time.
    pub expires: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(work: WorkItem, queue: QueueName) -> Self {
        Self {
            work,
            schedule: Schedule::Now,
            queue,
            limits: TimeLimits::default(),
            expires: None,
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_limits(mut self, limits: TimeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_expires(mut self, expires: Option<DateTime<Utc>>) -> Self {
        self.expires = expires;
        self
    }
}

// ---------------------------------------------------------------------------
// QueuedWork envelope
// ---------------------------------------------------------------------------

/// Serialized form of a submission as it sits in a queue list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWork {
    pub id: String,
    pub work: WorkItem,
    pub queue: QueueName,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    pub soft_limit_secs: u64,
    pub hard_limit_secs: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedWork {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    pub fn limits(&self) -> TimeLimits {
        TimeLimits::new(
            Duration::from_secs(self.soft_limit_secs),
            Duration::from_secs(self.hard_limit_secs),
        )
    }
}

// ---------------------------------------------------------------------------
// ExecutionBackend
// ---------------------------------------------------------------------------

pub trait ExecutionBackend: Send + Sync {
    fn submit(&self, submission: Submission) -> Result<TaskHandle>;
    fn revoke(&self, handle: &TaskHandle) -> Result<()>;
    fn status(&self, handle: &TaskHandle) -> Result<TaskStatus>;
}

/// Millisecond-precision conversion; saturates instead of failing.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 1_000))
}
