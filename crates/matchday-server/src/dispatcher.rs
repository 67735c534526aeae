//! In-process worker for the queue lists.
//!
//! Each poll pops a batch from every queue. Work with a future ETA is held on
//! a timer until due; everything else runs on the blocking pool under the
//! envelope's hard time limit. Status is recorded under `task-meta:<id>` so
//! the backend's `status` and reconciliation can see it, and each running
//! unit holds a `worker-lease:<worker>:<id>` lease for its duration.
//!
//! A blocking thread cannot be killed. Past the hard limit the unit is
//! reported timed out and abandoned, but its closure may still finish; ledger
//! work re-checks its record before any terminal transition, so a late finish
//! never overwrites a record that was rescheduled in the meantime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use matchday_core::backend::{QueuedWork, TaskHandle, TaskStatus};
use matchday_core::heartbeat;
use matchday_core::lease::{self, Lease, WORKER_LEASE_PREFIX};
use matchday_core::queue::QueueName;
use matchday_core::services::Services;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Envelopes popped per queue per poll.
const BATCH: usize = 32;

/// Added to the hard limit for the worker lease TTL.
const LEASE_GRACE: Duration = Duration::from_secs(30);

pub const SERVICE: &str = "dispatcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// Revoked before it started.
    Revoked,
    /// Not started before its expiry.
    Expired,
    /// Killed by the hard time limit.
    TimedOut,
    /// Another worker already holds this unit's lease.
    Busy,
}

#[derive(Clone)]
pub struct Dispatcher {
    services: Arc<Services>,
    worker_id: Arc<str>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>, worker_id: Arc<str>) -> Self {
        Self {
            services,
            worker_id,
        }
    }

    /// Poll forever, beating the dispatcher heartbeat between polls.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let cfg = self.services.config.dispatcher.clone();
            let mut poll = tokio::time::interval(Duration::from_millis(cfg.poll_interval_ms.max(1)));
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut beat = tokio::time::interval(Duration::from_secs(cfg.heartbeat_interval_secs.max(1)));
            beat.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(worker = %self.worker_id, "dispatcher started");
            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        let mut running = self.poll_once().await;
                        running.detach_all();
                    }
                    _ = beat.tick() => self.beat().await,
                }
            }
        })
    }

    async fn beat(&self) {
        let services = self.services.clone();
        let worker = self.worker_id.clone();
        let ttl = services.config.dispatcher.heartbeat_ttl();
        let res = tokio::task::spawn_blocking(move || {
            heartbeat::beat(services.store.as_ref(), SERVICE, &worker, ttl)
        })
        .await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "dispatcher heartbeat failed"),
            Err(e) => tracing::warn!(error = %e, "dispatcher heartbeat task failed"),
        }
    }

    /// Pop one batch from every queue and start each envelope. Due work and
    /// held work both end up in the returned set.
    pub async fn poll_once(&self) -> JoinSet<Outcome> {
        let mut set = JoinSet::new();
        for &queue in QueueName::all() {
            for envelope in self.take(queue).await {
                let this = self.clone();
                match envelope.eta.filter(|eta| *eta > Utc::now()) {
                    Some(eta) => {
                        tracing::debug!(id = %envelope.id, %eta, "holding work until due");
                        set.spawn(async move {
                            let wait = (eta - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                            tokio::time::sleep(wait).await;
                            this.run(envelope).await
                        });
                    }
                    None => {
                        set.spawn(async move { this.run(envelope).await });
                    }
                }
            }
        }
        set
    }

    async fn take(&self, queue: QueueName) -> Vec<QueuedWork> {
        let store = self.services.store.clone();
        let popped = tokio::task::spawn_blocking(move || {
            let mut raw = Vec::new();
            while raw.len() < BATCH {
                match store.lpop(queue.key()) {
                    Ok(Some(item)) => raw.push(item),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(%queue, error = %e, "queue pop failed");
                        break;
                    }
                }
            }
            raw
        })
        .await
        .unwrap_or_default();

        popped
            .into_iter()
            .filter_map(|raw| match serde_json::from_str::<QueuedWork>(&raw) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    tracing::warn!(%queue, error = %e, "dropping unparseable queue item");
                    None
                }
            })
            .collect()
    }

    /// Execute one envelope to completion.
    pub async fn run(&self, envelope: QueuedWork) -> Outcome {
        let services = self.services.clone();
        let worker = self.worker_id.clone();
        let prepared = {
            let envelope = envelope.clone();
            tokio::task::spawn_blocking(move || prepare(&services, &worker, &envelope)).await
        };
        let lease = match prepared {
            Ok(Ok(lease)) => lease,
            Ok(Err(outcome)) => return outcome,
            Err(e) => {
                tracing::error!(id = %envelope.id, error = %e, "dispatch preparation failed");
                return Outcome::Failed;
            }
        };

        let limits = envelope.limits();
        let started = Instant::now();
        let services = self.services.clone();
        let handle = TaskHandle::new(envelope.id.clone());
        let work = envelope.work.clone();
        let task = tokio::task::spawn_blocking(move || services.execute(&handle, &work));

        let (outcome, status, error) = match tokio::time::timeout(limits.hard, task).await {
            Ok(Ok(Ok(_))) => (Outcome::Succeeded, TaskStatus::Succeeded, None),
            Ok(Ok(Err(e))) => {
                tracing::error!(id = %envelope.id, work = envelope.work.name(), error = %e, "work failed");
                (Outcome::Failed, TaskStatus::Failed, Some(e.to_string()))
            }
            Ok(Err(e)) => {
                tracing::error!(id = %envelope.id, work = envelope.work.name(), error = %e, "work panicked");
                (Outcome::Failed, TaskStatus::Failed, Some(format!("panicked: {e}")))
            }
            Err(_) => {
                tracing::error!(
                    id = %envelope.id,
                    work = envelope.work.name(),
                    hard_limit_secs = limits.hard.as_secs(),
                    "hard time limit exceeded"
                );
                (
                    Outcome::TimedOut,
                    TaskStatus::Failed,
                    Some("hard time limit exceeded".to_string()),
                )
            }
        };

        let elapsed = started.elapsed();
        if outcome != Outcome::TimedOut && elapsed > limits.soft {
            tracing::warn!(
                id = %envelope.id,
                work = envelope.work.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                soft_limit_secs = limits.soft.as_secs(),
                "soft time limit exceeded"
            );
        }

        let services = self.services.clone();
        let id = envelope.id.clone();
        let finished = tokio::task::spawn_blocking(move || {
            if let Err(e) = services.backend.record_status(&id, status, error) {
                tracing::warn!(%id, error = %e, "status not recorded");
            }
            if let Err(e) = lease::release(services.store.as_ref(), &lease) {
                tracing::warn!(%id, error = %e, "worker lease not released");
            }
        })
        .await;
        if let Err(e) = finished {
            tracing::warn!(id = %envelope.id, error = %e, "dispatch bookkeeping failed");
        }
        tracing::debug!(id = %envelope.id, work = envelope.work.name(), ?outcome, "dispatched");
        outcome
    }
}

/// Checks that must pass before a unit starts. On success the unit is marked
/// running under a fresh worker lease.
fn prepare(services: &Services, worker: &str, envelope: &QueuedWork) -> Result<Lease, Outcome> {
    let backend = &services.backend;
    match backend.is_revoked(&envelope.id) {
        Ok(true) => {
            tracing::info!(id = %envelope.id, work = envelope.work.name(), "skipping revoked work");
            return Err(Outcome::Revoked);
        }
        Ok(false) => {}
        Err(e) => tracing::warn!(id = %envelope.id, error = %e, "revocation check failed, running anyway"),
    }

    if envelope.is_expired(Utc::now()) {
        tracing::warn!(id = %envelope.id, work = envelope.work.name(), "work expired before start");
        if let Err(e) = backend.record_status(
            &envelope.id,
            TaskStatus::Failed,
            Some("expired before start".to_string()),
        ) {
            tracing::warn!(id = %envelope.id, error = %e, "status not recorded");
        }
        return Err(Outcome::Expired);
    }

    let key = format!("{WORKER_LEASE_PREFIX}{worker}:{}", envelope.id);
    let ttl = envelope.limits().hard + LEASE_GRACE;
    let lease = match lease::acquire(services.store.as_ref(), &key, worker, ttl) {
        Ok(Some(lease)) => lease,
        Ok(None) => {
            tracing::warn!(id = %envelope.id, "work already leased, skipping");
            return Err(Outcome::Busy);
        }
        Err(e) => {
            tracing::error!(id = %envelope.id, error = %e, "worker lease unavailable");
            requeue(services, envelope);
            return Err(Outcome::Failed);
        }
    };

    if let Err(e) = backend.record_status(&envelope.id, TaskStatus::Running, None) {
        tracing::warn!(id = %envelope.id, error = %e, "status not recorded");
    }
    Ok(lease)
}

/// Put an envelope back at the tail of its queue.
fn requeue(services: &Services, envelope: &QueuedWork) {
    let pushed = serde_json::to_string(envelope)
        .map_err(matchday_core::MatchdayError::from)
        .and_then(|raw| services.store.rpush(envelope.queue.key(), &raw));
    if let Err(e) = pushed {
        tracing::error!(id = %envelope.id, error = %e, "work lost: requeue failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchday_core::backend::{ExecutionBackend, Schedule, Submission, WorkItem};
    use matchday_core::config::Config;
    use matchday_core::reporter::RecordingReporter;
    use matchday_core::session::MemorySessionSource;
    use matchday_core::store::{KeyValueStore, MemoryStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        reporter: Arc<RecordingReporter>,
        services: Arc<Services>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.ledger.path = dir.path().join("ledger.redb");
        let store = Arc::new(MemoryStore::new());
        let reporter = Arc::new(RecordingReporter::new());
        let services = Arc::new(
            Services::build(
                config,
                store.clone(),
                Arc::new(MemorySessionSource::new()),
                reporter.clone(),
            )
            .unwrap(),
        );
        let dispatcher = Dispatcher::new(services.clone(), Arc::from("test-worker"));
        Fixture {
            _dir: dir,
            store,
            reporter,
            services,
            dispatcher,
        }
    }

    async fn drain(mut set: JoinSet<Outcome>) -> Vec<Outcome> {
        let mut out = Vec::new();
        while let Some(res) = set.join_next().await {
            out.push(res.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn due_work_runs_and_records_success() {
        let f = fixture();
        let handle = f
            .services
            .backend
            .submit(Submission::new(
                WorkItem::ProcessMatch { match_id: 7 },
                QueueName::LiveReporting,
            ))
            .unwrap();

        let outcomes = drain(f.dispatcher.poll_once().await).await;
        assert_eq!(outcomes, vec![Outcome::Succeeded]);
        assert_eq!(f.reporter.calls("process_match", 7), 1);
        assert_eq!(f.services.backend.status(&handle).unwrap(), TaskStatus::Succeeded);
        assert!(f.store.keys("worker-lease:*").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_work_records_error() {
        let f = fixture();
        f.reporter.fail_with(Some("feed down"));
        let handle = f
            .services
            .backend
            .submit(Submission::new(
                WorkItem::ProcessMatch { match_id: 8 },
                QueueName::LiveReporting,
            ))
            .unwrap();

        let outcomes = drain(f.dispatcher.poll_once().await).await;
        assert_eq!(outcomes, vec![Outcome::Failed]);
        let meta = f.services.backend.meta(&handle.id).unwrap().unwrap();
        assert_eq!(meta.status, TaskStatus::Failed);
        assert!(meta.error.unwrap().contains("feed down"));
    }

    #[tokio::test]
    async fn revoked_and_expired_work_do_not_run() {
        let f = fixture();
        let revoked = f
            .services
            .backend
            .submit(Submission::new(
                WorkItem::ProcessMatch { match_id: 9 },
                QueueName::LiveReporting,
            ))
            .unwrap();
        f.services.backend.revoke(&revoked).unwrap();
        f.services
            .backend
            .submit(
                Submission::new(WorkItem::ProcessMatch { match_id: 10 }, QueueName::LiveReporting)
                    .with_expires(Some(Utc::now() - chrono::Duration::seconds(1))),
            )
            .unwrap();

        let outcomes = drain(f.dispatcher.poll_once().await).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.contains(&Outcome::Revoked));
        assert!(outcomes.contains(&Outcome::Expired));
        assert_eq!(f.reporter.calls("process_match", 9), 0);
        assert_eq!(f.reporter.calls("process_match", 10), 0);
    }

    #[tokio::test]
    async fn future_work_is_held_not_run() {
        let f = fixture();
        let handle = f
            .services
            .backend
            .submit(
                Submission::new(WorkItem::ProcessMatch { match_id: 11 }, QueueName::LiveReporting)
                    .with_schedule(Schedule::Countdown(Duration::from_secs(3600))),
            )
            .unwrap();

        let set = f.dispatcher.poll_once().await;
        assert_eq!(set.len(), 1);
        tokio::task::yield_now().await;
        assert_eq!(f.reporter.calls("process_match", 11), 0);
        assert_eq!(f.services.backend.status(&handle).unwrap(), TaskStatus::Pending);
        assert_eq!(f.store.llen(QueueName::LiveReporting.key()).unwrap(), 0);
    }

    #[tokio::test]
    async fn unparseable_items_are_dropped() {
        let f = fixture();
        f.store.rpush(QueueName::Primary.key(), "not json").unwrap();
        let set = f.dispatcher.poll_once().await;
        assert!(set.is_empty());
        assert_eq!(f.store.llen(QueueName::Primary.key()).unwrap(), 0);
    }
}
