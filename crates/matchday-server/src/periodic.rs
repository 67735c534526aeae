//! Periodic maintenance loops: queue health (which also restarts a stopped
//! orchestrator chain while sessions remain), reconciliation and the
//! emergency check. Each loop beats its own heartbeat and takes a
//! `scheduler-lease:<service>` lease around every run so that only one
//! process runs a given pass at a time.

use std::sync::Arc;
use std::time::Duration;

use matchday_core::heartbeat;
use matchday_core::lease::{self, SCHEDULER_LEASE_PREFIX};
use matchday_core::services::Services;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy)]
pub struct Job {
    pub service: &'static str,
    pub every: Duration,
    pub run: fn(&Services),
}

pub fn jobs(services: &Services) -> Vec<Job> {
    let d = &services.config.dispatcher;
    vec![
        Job {
            service: "queue-health",
            every: Duration::from_secs(d.queue_health_interval_secs),
            run: queue_health,
        },
        Job {
            service: "reconciliation",
            every: Duration::from_secs(d.reconcile_interval_secs),
            run: reconciliation,
        },
        Job {
            service: "emergency-recovery",
            every: Duration::from_secs(d.emergency_interval_secs),
            run: emergency,
        },
    ]
}

pub fn spawn_all(services: Arc<Services>, worker_id: Arc<str>) -> Vec<JoinHandle<()>> {
    jobs(&services)
        .into_iter()
        .map(|job| spawn(job, services.clone(), worker_id.clone()))
        .collect()
}

fn spawn(job: Job, services: Arc<Services>, worker_id: Arc<str>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut work = tokio::time::interval(job.every.max(Duration::from_secs(1)));
        work.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let beat_every = Duration::from_secs(services.config.dispatcher.heartbeat_interval_secs.max(1));
        let mut beat = tokio::time::interval(beat_every);
        beat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(service = job.service, every_secs = job.every.as_secs(), "periodic loop started");
        loop {
            let services = services.clone();
            let worker_id = worker_id.clone();
            let res = tokio::select! {
                _ = work.tick() => tokio::task::spawn_blocking(move || run_leased(&job, &services, &worker_id)).await,
                _ = beat.tick() => tokio::task::spawn_blocking(move || {
                    let ttl = services.config.dispatcher.heartbeat_ttl();
                    if let Err(e) = heartbeat::beat(services.store.as_ref(), job.service, &worker_id, ttl) {
                        tracing::warn!(service = job.service, error = %e, "heartbeat failed");
                    }
                }).await,
            };
            if let Err(e) = res {
                tracing::error!(service = job.service, error = %e, "periodic task panicked");
            }
        }
    })
}

/// Run `job` once if this process can take its lease.
pub fn run_leased(job: &Job, services: &Services, worker_id: &str) {
    let key = format!("{SCHEDULER_LEASE_PREFIX}{}", job.service);
    let store = services.store.as_ref();
    let held = match lease::acquire(store, &key, worker_id, job.every) {
        Ok(Some(held)) => held,
        Ok(None) => {
            tracing::debug!(service = job.service, "pass running elsewhere, skipping");
            return;
        }
        Err(e) => {
            tracing::warn!(service = job.service, error = %e, "scheduler lease unavailable, skipping");
            return;
        }
    };
    (job.run)(services);
    if let Err(e) = lease::release(store, &held) {
        tracing::warn!(service = job.service, error = %e, "scheduler lease not released");
    }
}

fn queue_health(services: &Services) {
    let report = services.queue_health.check_health();
    tracing::info!(
        worst = %report.worst_tier(),
        alerts = report.alerts.len(),
        removed = report.tasks_removed(),
        unreadable = report.unreadable.len(),
        "queue health poll"
    );
    if let Err(e) = services.orchestrator.ensure_running() {
        tracing::warn!(error = %e, "orchestrator restart check failed");
    }
}

fn reconciliation(services: &Services) {
    match services.reconciliation.sweep() {
        Ok(reports) => {
            let repaired: usize = reports.values().map(|r| r.repaired).sum();
            tracing::info!(subjects = reports.len(), repaired, "reconciliation sweep");
        }
        Err(e) => tracing::error!(error = %e, "reconciliation sweep failed"),
    }
}

fn emergency(services: &Services) {
    match services.recovery.handle(0) {
        Ok(report) if report.emergency_triggered => tracing::warn!(
            before = report.before_total,
            after = report.after_total,
            removed = report.tasks_removed,
            "emergency recovery ran"
        ),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "emergency check failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchday_core::config::Config;
    use matchday_core::reporter::LoggingReporter;
    use matchday_core::session::{LiveSession, MemorySessionSource, SessionSource};
    use matchday_core::store::{KeyValueStore, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    fn count(_: &Services) {
        RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn services(dir: &TempDir, store: Arc<MemoryStore>) -> Services {
        let mut config = Config::default();
        config.ledger.path = dir.path().join("ledger.redb");
        Services::build(
            config,
            store,
            Arc::new(MemorySessionSource::new()),
            Arc::new(LoggingReporter),
        )
        .unwrap()
    }

    #[test]
    fn leased_run_is_skipped_while_another_holder_has_it() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let services = services(&dir, store.clone());
        let job = Job {
            service: "counting",
            every: Duration::from_secs(60),
            run: count,
        };

        run_leased(&job, &services, "node-a");
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
        assert!(store.get("scheduler-lease:counting").unwrap().is_none());

        store
            .set_nx_ex("scheduler-lease:counting", Duration::from_secs(60), "node-b")
            .unwrap();
        run_leased(&job, &services, "node-a");
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_periodic_service_has_a_job() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir, Arc::new(MemoryStore::new()));
        let names: Vec<_> = jobs(&services).iter().map(|j| j.service).collect();
        for name in names {
            assert!(heartbeat::SERVICES.contains(&name));
        }
    }

    #[test]
    fn queue_health_pass_restarts_a_stopped_chain() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(MemorySessionSource::new());
        let mut config = Config::default();
        config.ledger.path = dir.path().join("ledger.redb");
        let services = Services::build(
            config,
            store.clone(),
            sessions.clone(),
            Arc::new(LoggingReporter),
        )
        .unwrap();

        queue_health(&services);
        assert!(!services.orchestrator.chain_active());

        sessions.open(LiveSession::new(5)).unwrap();
        queue_health(&services);
        assert!(services.orchestrator.chain_active());
        assert_eq!(store.llen("primary").unwrap(), 1);
    }
}
