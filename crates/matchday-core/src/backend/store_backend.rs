//! Queue-list execution backend on top of the shared key-value store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::store::KeyValueStore;

use super::{ExecutionBackend, QueuedWork, Submission, TaskHandle, TaskStatus};

pub const TASK_META_PREFIX: &str = "task-meta:";
pub const REVOKED_PREFIX: &str = "revoked:";

/// How long status metadata and revocation markers are kept.
const META_TTL: Duration = Duration::from_secs(3600);

/// Status record stored under `task-meta:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct StoreBackend {
    store: Arc<dyn KeyValueStore>,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn meta_key(id: &str) -> String {
        format!("{TASK_META_PREFIX}{id}")
    }

    fn revoked_key(id: &str) -> String {
        format!("{REVOKED_PREFIX}{id}")
    }

    /// Record a status transition reported by whoever executes the work.
    pub fn record_status(&self, id: &str, status: TaskStatus, error: Option<String>) -> Result<()> {
        self.write_meta(id, status, error, META_TTL)
    }

    fn write_meta(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
        ttl: Duration,
    ) -> Result<()> {
        let meta = TaskMeta {
            status,
            updated_at: Utc::now(),
            error,
        };
        let value = serde_json::to_string(&meta)?;
        self.store.setex(&Self::meta_key(id), ttl, &value)
    }

    pub fn is_revoked(&self, id: &str) -> Result<bool> {
        Ok(self.store.get(&Self::revoked_key(id))?.is_some())
    }

    pub fn meta(&self, id: &str) -> Result<Option<TaskMeta>> {
        match self.store.get(&Self::meta_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

impl ExecutionBackend for StoreBackend {
    fn submit(&self, submission: Submission) -> Result<TaskHandle> {
        let now = Utc::now();
        let envelope = QueuedWork {
            id: Uuid::new_v4().to_string(),
            work: submission.work,
            queue: submission.queue,
            eta: submission.schedule.eta(now),
            expires: submission.expires,
            soft_limit_secs: submission.limits.soft.as_secs(),
            hard_limit_secs: submission.limits.hard.as_secs(),
            enqueued_at: now,
        };
        let payload = serde_json::to_string(&envelope)?;
        self.store.rpush(envelope.queue.key(), &payload)?;
        self.write_meta(
            &envelope.id,
            TaskStatus::Pending,
            None,
            pending_ttl(envelope.eta, envelope.expires, now),
        )?;
        tracing::debug!(
            id = %envelope.id,
            work = envelope.work.name(),
            queue = %envelope.queue,
            eta = ?envelope.eta,
            "submitted work"
        );
        Ok(TaskHandle::new(envelope.id))
    }

    fn revoke(&self, handle: &TaskHandle) -> Result<()> {
        self.store
            .setex(&Self::revoked_key(&handle.id), META_TTL, "1")?;
        self.record_status(&handle.id, TaskStatus::Revoked, None)
    }

    fn status(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        Ok(self
            .meta(&handle.id)?
            .map_or(TaskStatus::Unknown, |m| m.status))
    }
}

/// Pending status has to outlive the wait for the ETA (or the expiry, when
/// later), otherwise held work reads as Unknown before it ever runs.
fn pending_ttl(
    eta: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let horizon = eta.into_iter().chain(expires).max().unwrap_or(now);
    let wait = (horizon - now).to_std().unwrap_or(Duration::ZERO);
    META_TTL.saturating_add(wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Schedule, WorkItem};
    use crate::queue::QueueName;
    use crate::store::{MemoryStore, Ttl};

    fn backend() -> (Arc<MemoryStore>, StoreBackend) {
        let store = Arc::new(MemoryStore::new());
        let backend = StoreBackend::new(store.clone());
        (store, backend)
    }

    #[test]
    fn submit_pushes_envelope_onto_queue_tail() {
        let (store, backend) = backend();
        let first = backend
            .submit(Submission::new(
                WorkItem::ProcessMatch { match_id: 1 },
                QueueName::LiveReporting,
            ))
            .unwrap();
        let second = backend
            .submit(
                Submission::new(WorkItem::Orchestrate { retries: 0 }, QueueName::LiveReporting)
                    .with_schedule(Schedule::Countdown(Duration::from_secs(30))),
            )
            .unwrap();

        assert_eq!(store.llen("live-reporting").unwrap(), 2);
        let tail: QueuedWork =
            serde_json::from_str(&store.lindex("live-reporting", -1).unwrap().unwrap()).unwrap();
        assert_eq!(tail.id, second.id);
        assert!(tail.eta.is_some());
        let head: QueuedWork =
            serde_json::from_str(&store.lindex("live-reporting", 0).unwrap().unwrap()).unwrap();
        assert_eq!(head.id, first.id);
        assert_eq!(head.eta, None);
    }

    #[test]
    fn status_lifecycle_and_unknown_handles() {
        let (_store, backend) = backend();
        let handle = backend
            .submit(Submission::new(
                WorkItem::CreateThread { match_id: 9 },
                QueueName::Primary,
            ))
            .unwrap();
        assert_eq!(backend.status(&handle).unwrap(), TaskStatus::Pending);

        backend
            .record_status(&handle.id, TaskStatus::Failed, Some("boom".into()))
            .unwrap();
        assert_eq!(backend.status(&handle).unwrap(), TaskStatus::Failed);
        assert_eq!(
            backend.meta(&handle.id).unwrap().unwrap().error.as_deref(),
            Some("boom")
        );

        assert_eq!(
            backend.status(&TaskHandle::new("missing")).unwrap(),
            TaskStatus::Unknown
        );
    }

    #[test]
    fn pending_status_outlives_a_distant_eta() {
        let (store, backend) = backend();
        let eta = Utc::now() + chrono::Duration::days(2);
        let handle = backend
            .submit(
                Submission::new(WorkItem::CreateThread { match_id: 4 }, QueueName::Primary)
                    .with_schedule(Schedule::Eta(eta))
                    .with_expires(Some(eta + chrono::Duration::hours(2))),
            )
            .unwrap();

        let Ttl::Expires(remaining) = store.ttl(&StoreBackend::meta_key(&handle.id)).unwrap() else {
            panic!("pending status should carry a TTL");
        };
        assert!(remaining > Duration::from_secs(50 * 3600));
        assert_eq!(backend.status(&handle).unwrap(), TaskStatus::Pending);
    }

    #[test]
    fn immediate_work_keeps_the_default_ttl() {
        let now = Utc::now();
        assert_eq!(pending_ttl(None, None, now), META_TTL);
        assert_eq!(
            pending_ttl(Some(now - chrono::Duration::minutes(5)), None, now),
            META_TTL
        );
    }

    #[test]
    fn revoke_marks_handle() {
        let (_store, backend) = backend();
        let handle = backend
            .submit(Submission::new(
                WorkItem::StartLiveReporting { match_id: 3 },
                QueueName::LiveReporting,
            ))
            .unwrap();
        backend.revoke(&handle).unwrap();
        assert!(backend.is_revoked(&handle.id).unwrap());
        assert_eq!(backend.status(&handle).unwrap(), TaskStatus::Revoked);
    }
}
