use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{MatchdayError, Result};

use super::{ExecutionBackend, Submission, TaskHandle, TaskStatus};

/// Records submissions instead of running them. Statuses default to
/// `Pending` and can be overridden per handle.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    submitted: Mutex<Vec<(TaskHandle, Submission)>>,
    statuses: Mutex<HashMap<String, TaskStatus>>,
    revoked: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    reject_submissions: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `submit` fail.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.reject_submissions.store(rejecting, Ordering::SeqCst);
    }

    pub fn set_status(&self, handle: &TaskHandle, status: TaskStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id.clone(), status);
    }

    /// Drop all knowledge of a handle, as if its metadata expired.
    pub fn forget(&self, handle: &TaskHandle) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id);
    }

    pub fn submissions(&self) -> Vec<(TaskHandle, Submission)> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_submission(&self) -> Option<(TaskHandle, Submission)> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    pub fn is_revoked(&self, handle: &TaskHandle) -> bool {
        self.revoked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&handle.id)
    }
}

impl ExecutionBackend for MemoryBackend {
    fn submit(&self, submission: Submission) -> Result<TaskHandle> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(MatchdayError::Backend("submission rejected".into()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = TaskHandle::new(format!("task-{n}"));
        self.set_status(&handle, TaskStatus::Pending);
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle.clone(), submission));
        Ok(handle)
    }

    fn revoke(&self, handle: &TaskHandle) -> Result<()> {
        self.revoked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id.clone());
        self.set_status(handle, TaskStatus::Revoked);
        Ok(())
    }

    fn status(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&handle.id)
            .copied()
            .unwrap_or(TaskStatus::Unknown))
    }
}
