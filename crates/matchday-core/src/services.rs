//! Wiring: every component built once from a `Config`, plus the handler
//! table that executes a unit of work by kind.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::backend::{ExecutionBackend, StoreBackend, TaskHandle, TimeLimits, WorkItem};
use crate::config::Config;
use crate::error::Result;
use crate::health::{combine, CombinedHealth};
use crate::heartbeat::{self, WorkerHealth};
use crate::ledger::{Ledger, TaskState, WorkType};
use crate::orchestrator::Orchestrator;
use crate::queue_health::QueueHealthMonitor;
use crate::reconcile::ReconciliationMonitor;
use crate::recovery::EmergencyRecovery;
use crate::reporter::MatchReporter;
use crate::scheduler::MatchScheduler;
use crate::session::{LiveSession, LiveSessionTracker, SessionSource};
use crate::store::KeyValueStore;

pub struct Services {
    pub config: Config,
    pub store: Arc<dyn KeyValueStore>,
    pub backend: Arc<StoreBackend>,
    pub ledger: Arc<Ledger>,
    pub sessions: Arc<dyn SessionSource>,
    pub tracker: Arc<LiveSessionTracker>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue_health: Arc<QueueHealthMonitor>,
    pub recovery: Arc<EmergencyRecovery>,
    pub reconciliation: Arc<ReconciliationMonitor>,
    pub scheduler: Arc<MatchScheduler>,
    pub reporter: Arc<dyn MatchReporter>,
}

impl Services {
    /// Open the ledger and build every component on top of `store`.
    pub fn build(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        sessions: Arc<dyn SessionSource>,
        reporter: Arc<dyn MatchReporter>,
    ) -> Result<Self> {
        let ledger = Arc::new(Ledger::open(&config.ledger.path)?);
        let backend = Arc::new(StoreBackend::new(store.clone()));
        let exec: Arc<dyn ExecutionBackend> = backend.clone();

        let limits = TimeLimits::new(
            std::time::Duration::from_secs(config.orchestrator.soft_limit_secs),
            std::time::Duration::from_secs(config.orchestrator.hard_limit_secs),
        );
        let tracker = Arc::new(
            LiveSessionTracker::new(sessions.clone(), exec.clone(), store.clone(), &config.admission)
                .with_limits(limits),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            tracker.clone(),
            exec.clone(),
            store.clone(),
            config.orchestrator.clone(),
        ));
        let queue_health = Arc::new(QueueHealthMonitor::new(store.clone(), config.thresholds()));
        let recovery = Arc::new(EmergencyRecovery::new(
            store.clone(),
            queue_health.clone(),
            exec.clone(),
            config.recovery.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationMonitor::new(
            ledger.clone(),
            exec.clone(),
            &config.reconciliation,
        ));
        let scheduler = Arc::new(MatchScheduler::new(ledger.clone(), exec));

        Ok(Self {
            config,
            store,
            backend,
            ledger,
            sessions,
            tracker,
            orchestrator,
            queue_health,
            recovery,
            reconciliation,
            scheduler,
            reporter,
        })
    }

    // -----------------------------------------------------------------------
    // Work execution
    // -----------------------------------------------------------------------

    /// Run one unit of work. The returned JSON is the handler's report.
    pub fn execute(&self, handle: &TaskHandle, work: &WorkItem) -> Result<Value> {
        match work {
            WorkItem::Orchestrate { retries } => {
                Ok(serde_json::to_value(self.orchestrator.handle(*retries)?)?)
            }
            WorkItem::EmergencyRecovery { attempt } => {
                Ok(serde_json::to_value(self.recovery.handle(*attempt)?)?)
            }
            WorkItem::ProcessMatch { match_id } => {
                let outcome = self.reporter.process_match(*match_id);
                self.tracker.record_outcome(outcome.is_ok());
                outcome?;
                self.sessions.touch(*match_id, chrono::Utc::now())?;
                Ok(json!({ "match_id": match_id, "processed": true }))
            }
            WorkItem::CreateThread { match_id } => {
                self.run_scheduled(handle, *match_id, WorkType::ThreadCreation, || {
                    self.reporter.create_thread(*match_id)
                })
            }
            WorkItem::StartLiveReporting { match_id } => {
                self.run_scheduled(handle, *match_id, WorkType::LiveReportingStart, || {
                    self.reporter.start_live_reporting(*match_id)?;
                    self.sessions.open(LiveSession::new(*match_id))?;
                    let active = self.sessions.active_sessions()?.len();
                    self.orchestrator.start(active)?;
                    Ok(())
                })
            }
        }
    }

    /// Run ledger-tracked work, moving its record through Running to
    /// Completed or Failed. Work whose handle no longer matches the active
    /// record was superseded (paused, rescheduled) and is skipped.
    fn run_scheduled(
        &self,
        handle: &TaskHandle,
        match_id: i64,
        work_type: WorkType,
        f: impl FnOnce() -> Result<()>,
    ) -> Result<Value> {
        let Some(record) = self.ledger.find_active(match_id, work_type)? else {
            tracing::info!(match_id, %work_type, handle = %handle, "no active record, skipping");
            return Ok(json!({ "match_id": match_id, "skipped": "no active record" }));
        };
        if record.external_handle.as_ref() != Some(handle) {
            tracing::info!(match_id, %work_type, handle = %handle, "superseded work, skipping");
            return Ok(json!({ "match_id": match_id, "skipped": "superseded" }));
        }

        self.ledger.mark_running(record.id, None)?;
        let outcome = f();

        // Work abandoned by the dispatcher's hard limit can finish late, after
        // reconciliation has handed the record to a fresh handle.
        let current = self.ledger.get(record.id)?;
        let still_ours = current.is_some_and(|r| {
            r.state == TaskState::Running && r.external_handle.as_ref() == Some(handle)
        });
        if !still_ours {
            tracing::warn!(match_id, %work_type, handle = %handle, ok = outcome.is_ok(), "record moved on while running, leaving it");
            return outcome.map(|()| json!({ "match_id": match_id, "skipped": "superseded" }));
        }

        match outcome {
            Ok(()) => {
                self.ledger.mark_completed(record.id)?;
                Ok(json!({ "match_id": match_id, "record_id": record.id, "completed": true }))
            }
            Err(e) => {
                self.ledger.mark_failed(record.id, &e.to_string())?;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    pub fn worker_health(&self) -> WorkerHealth {
        heartbeat::worker_health(self.store.as_ref(), heartbeat::SERVICES)
    }

    /// Read-only aggregate of queue tiers, heartbeats and the breaker.
    pub fn combined_health(&self) -> CombinedHealth {
        combine(
            &self.queue_health.observe(),
            &self.worker_health(),
            self.tracker.circuit_state(),
        )
    }
}
