//! The self-perpetuating control loop.
//!
//! One orchestration pass asks the session tracker to process every active
//! session, then decides whether another pass is needed. Continuation is an
//! explicit tail submission of `WorkItem::Orchestrate` with a countdown; a
//! pass never sleeps. The chain ends as soon as a pass finds no sessions or
//! schedules nothing, and restarts only through `start`.
//!
//! A live chain holds `scheduler-lease:orchestrator`, refreshed by every link
//! for as long as its successor is pending. `start` is a no-op while the
//! lease is held, so starting a second session never forks a second chain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::CircuitState;
use crate::backend::{ExecutionBackend, Schedule, Submission, TaskHandle, TimeLimits, WorkItem};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::lease::{self, SCHEDULER_LEASE_PREFIX};
use crate::queue::QueueName;
use crate::session::{ProcessingStats, SessionTracker, TrackerHealth};
use crate::store::KeyValueStore;

/// Grace added to a chain lease beyond the next link's delay and hard limit.
const LEASE_GRACE: Duration = Duration::from_secs(30);

pub fn chain_lease_key() -> String {
    format!("{SCHEDULER_LEASE_PREFIX}orchestrator")
}

// ---------------------------------------------------------------------------
// ChainDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoSessions,
    NothingScheduled,
    SessionsGone,
    RetriesExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::NoSessions => "no active sessions",
            StopReason::NothingScheduled => "no work scheduled",
            StopReason::SessionsGone => "no sessions left after failure",
            StopReason::RetriesExhausted => "retry limit reached",
        })
    }
}

/// Whether the chain re-enqueues itself, and after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ChainDecision {
    Continue {
        #[serde(with = "secs")]
        delay: Duration,
    },
    Stop {
        reason: StopReason,
    },
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Outcome of one orchestration invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationReport {
    /// Present when the pass itself succeeded.
    pub stats: Option<ProcessingStats>,
    pub retries: u32,
    pub decision: ChainDecision,
    /// Handle of the next link in the chain, if one was submitted.
    pub next: Option<TaskHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorHealth {
    pub circuit_state: CircuitState,
    pub circuit_failures: u32,
    pub queue_size: Option<u64>,
    pub max_queue_size: u64,
    /// `queue_size / max_queue_size` as a percentage.
    pub queue_utilization: Option<f64>,
    pub active_sessions: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl From<TrackerHealth> for OrchestratorHealth {
    fn from(h: TrackerHealth) -> Self {
        let queue_utilization = h
            .queue_size
            .filter(|_| h.max_queue_size > 0)
            .map(|size| size as f64 * 100.0 / h.max_queue_size as f64);
        Self {
            circuit_state: h.circuit_breaker.state,
            circuit_failures: h.circuit_breaker.failure_count,
            queue_size: h.queue_size,
            max_queue_size: h.max_queue_size,
            queue_utilization,
            active_sessions: h.active_sessions,
            timestamp: h.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    tracker: Arc<dyn SessionTracker>,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn KeyValueStore>,
    cfg: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        tracker: Arc<dyn SessionTracker>,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn KeyValueStore>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            tracker,
            backend,
            store,
            cfg,
        }
    }

    fn lease_ttl(&self, delay: Duration) -> Duration {
        delay + Duration::from_secs(self.cfg.hard_limit_secs) + LEASE_GRACE
    }

    /// Extend the chain lease to cover the next link.
    fn hold_chain(&self, delay: Duration) {
        if let Err(e) = self
            .store
            .setex(&chain_lease_key(), self.lease_ttl(delay), "orchestrator")
        {
            tracing::warn!(error = %e, "orchestrator: chain lease not refreshed");
        }
    }

    fn release_chain(&self) {
        if let Err(e) = self.store.delete(&chain_lease_key()) {
            tracing::warn!(error = %e, "orchestrator: chain lease not released");
        }
    }

    /// Whether a chain is currently alive.
    pub fn chain_active(&self) -> bool {
        self.store
            .get(&chain_lease_key())
            .map(|v| v.is_some())
            .unwrap_or(false)
    }

    fn limits(&self) -> TimeLimits {
        TimeLimits::new(
            Duration::from_secs(self.cfg.soft_limit_secs),
            Duration::from_secs(self.cfg.hard_limit_secs),
        )
    }

    fn submit(&self, retries: u32, schedule: Schedule) -> Result<TaskHandle> {
        let submission = Submission::new(WorkItem::Orchestrate { retries }, QueueName::Primary)
            .with_schedule(schedule)
            .with_limits(self.limits());
        self.backend.submit(submission)
    }

    /// Kick off the chain. No sessions, or a chain already running, means
    /// nothing to do.
    pub fn start(&self, session_count: usize) -> Result<Option<TaskHandle>> {
        if session_count == 0 {
            tracing::debug!("orchestrator: no sessions, not starting");
            return Ok(None);
        }
        let acquired = lease::acquire(
            self.store.as_ref(),
            &chain_lease_key(),
            "orchestrator",
            self.lease_ttl(Duration::ZERO),
        )?;
        if acquired.is_none() {
            tracing::debug!(session_count, "orchestrator: chain already running");
            return Ok(None);
        }
        let handle = match self.submit(0, Schedule::Now) {
            Ok(h) => h,
            Err(e) => {
                self.release_chain();
                return Err(e);
            }
        };
        tracing::info!(session_count, handle = %handle, "orchestrator: chain started");
        Ok(Some(handle))
    }

    /// Restart a chain that stopped while sessions were still live, e.g.
    /// after a pass where every session was blocked by admission control.
    /// The stop rule is untouched; this only gives stopped sessions another
    /// pass later.
    pub fn ensure_running(&self) -> Result<Option<TaskHandle>> {
        if self.chain_active() {
            return Ok(None);
        }
        let active = self.tracker.get_active_sessions()?.len();
        let started = self.start(active)?;
        if started.is_some() {
            tracing::warn!(sessions = active, "orchestrator: restarted stopped chain");
        }
        Ok(started)
    }

    /// Next delay for a successful pass.
    pub fn compute_delay(&self, stats: &ProcessingStats) -> Duration {
        let base = self.cfg.base_delay_secs;
        let min = self.cfg.min_delay_secs;
        let max = self.cfg.max_delay_secs;

        let secs = match stats.circuit_breaker_state {
            CircuitState::Open => (base * 4).min(max),
            CircuitState::HalfOpen => base * 2,
            CircuitState::Closed if stats.blocked_by_backpressure > 0 => {
                let factor = (1 + stats.blocked_by_backpressure as u64 / 10).min(3);
                base * factor
            }
            CircuitState::Closed if stats.total_sessions > 5 => base.saturating_sub(10).max(min),
            CircuitState::Closed => base,
        };
        Duration::from_secs(secs.clamp(min, max))
    }

    /// Termination predicate for a successful pass.
    pub fn decide(&self, stats: &ProcessingStats) -> ChainDecision {
        if stats.total_sessions == 0 {
            ChainDecision::Stop {
                reason: StopReason::NoSessions,
            }
        } else if stats.scheduled_tasks == 0 {
            ChainDecision::Stop {
                reason: StopReason::NothingScheduled,
            }
        } else {
            ChainDecision::Continue {
                delay: self.compute_delay(stats),
            }
        }
    }

    /// Delay before retrying after a failed pass.
    pub fn retry_delay(&self, retries: u32) -> Duration {
        let secs = self
            .cfg
            .base_delay_secs
            .saturating_mul(u64::from(retries) + 1)
            .min(self.cfg.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// One successful-path pass: process sessions, then continue or stop.
    pub fn run_once(&self) -> Result<OrchestrationReport> {
        let stats = self.tracker.process_active_sessions()?;
        let decision = self.decide(&stats);

        let next = match decision {
            ChainDecision::Continue { delay } => {
                let handle = self.submit(0, Schedule::Countdown(delay))?;
                self.hold_chain(delay);
                tracing::info!(
                    total_sessions = stats.total_sessions,
                    scheduled = stats.scheduled_tasks,
                    circuit = %stats.circuit_breaker_state,
                    delay_secs = delay.as_secs(),
                    "orchestrator: next pass scheduled"
                );
                Some(handle)
            }
            ChainDecision::Stop { reason } => {
                self.release_chain();
                tracing::info!(
                    total_sessions = stats.total_sessions,
                    %reason,
                    "orchestrator: chain stopped"
                );
                None
            }
        };

        Ok(OrchestrationReport {
            stats: Some(stats),
            retries: 0,
            decision,
            next,
            error: None,
        })
    }

    /// Entry point for an `Orchestrate { retries }` unit of work. Failures
    /// are retried with a growing delay while sessions remain, up to
    /// `max_retries` consecutive failures.
    pub fn handle(&self, retries: u32) -> Result<OrchestrationReport> {
        let err = match self.run_once() {
            Ok(report) => return Ok(report),
            Err(e) => e,
        };
        tracing::error!(retries, error = %err, "orchestrator: pass failed");

        let next_retries = retries + 1;
        let stop = |reason| {
            self.release_chain();
            OrchestrationReport {
                stats: None,
                retries,
                decision: ChainDecision::Stop { reason },
                next: None,
                error: Some(err.to_string()),
            }
        };

        if next_retries > self.cfg.max_retries {
            tracing::error!(
                retries,
                max_retries = self.cfg.max_retries,
                "orchestrator: retry limit reached, dropping chain"
            );
            return Ok(stop(StopReason::RetriesExhausted));
        }

        let active = match self.tracker.get_active_sessions() {
            Ok(sessions) => sessions.len(),
            Err(e) => {
                tracing::error!(error = %e, "orchestrator: cannot count sessions, dropping chain");
                0
            }
        };
        if active == 0 {
            return Ok(stop(StopReason::SessionsGone));
        }

        let delay = self.retry_delay(retries);
        let handle = match self.submit(next_retries, Schedule::Countdown(delay)) {
            Ok(h) => h,
            Err(e) => {
                self.release_chain();
                return Err(e);
            }
        };
        self.hold_chain(delay);
        tracing::warn!(
            retries = next_retries,
            delay_secs = delay.as_secs(),
            handle = %handle,
            "orchestrator: retry scheduled"
        );
        Ok(OrchestrationReport {
            stats: None,
            retries: next_retries,
            decision: ChainDecision::Continue { delay },
            next: Some(handle),
            error: Some(err.to_string()),
        })
    }

    pub fn health_check(&self) -> OrchestratorHealth {
        self.tracker.health_check().into()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::AdmissionConfig;
    use crate::session::{LiveSession, LiveSessionTracker, MemorySessionSource, SessionSource};
    use crate::store::MemoryStore;

    fn stats(state: CircuitState, total: usize, scheduled: usize, blocked_bp: usize) -> ProcessingStats {
        ProcessingStats {
            total_sessions: total,
            scheduled_tasks: scheduled,
            blocked_by_circuit_breaker: 0,
            blocked_by_backpressure: blocked_bp,
            failed_submissions: 0,
            deactivated_sessions: 0,
            circuit_breaker_state: state,
            processing_time: 0.0,
        }
    }

    struct Fixture {
        source: Arc<MemorySessionSource>,
        backend: Arc<MemoryBackend>,
        store: Arc<MemoryStore>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(MemorySessionSource::new());
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(LiveSessionTracker::new(
            source.clone(),
            backend.clone(),
            store.clone(),
            &AdmissionConfig::default(),
        ));
        let orchestrator = Orchestrator::new(
            tracker,
            backend.clone(),
            store.clone(),
            OrchestratorConfig::default(),
        );
        Fixture {
            source,
            backend,
            store,
            orchestrator,
        }
    }

    #[test]
    fn open_circuit_delay_is_120() {
        let f = fixture();
        let d = f
            .orchestrator
            .compute_delay(&stats(CircuitState::Open, 3, 1, 0));
        assert_eq!(d, Duration::from_secs(120));
        // Regardless of backpressure or session count.
        let d = f
            .orchestrator
            .compute_delay(&stats(CircuitState::Open, 40, 1, 55));
        assert_eq!(d, Duration::from_secs(120));
    }

    #[test]
    fn delay_table() {
        let o = fixture().orchestrator;
        assert_eq!(o.compute_delay(&stats(CircuitState::HalfOpen, 3, 1, 0)).as_secs(), 60);
        assert_eq!(o.compute_delay(&stats(CircuitState::Closed, 3, 1, 0)).as_secs(), 30);
        assert_eq!(o.compute_delay(&stats(CircuitState::Closed, 6, 1, 0)).as_secs(), 20);
        assert_eq!(o.compute_delay(&stats(CircuitState::Closed, 3, 1, 1)).as_secs(), 30);
        assert_eq!(o.compute_delay(&stats(CircuitState::Closed, 3, 1, 10)).as_secs(), 60);
        assert_eq!(o.compute_delay(&stats(CircuitState::Closed, 3, 1, 25)).as_secs(), 90);
        assert_eq!(o.compute_delay(&stats(CircuitState::Closed, 3, 1, 500)).as_secs(), 90);
    }

    #[test]
    fn delay_is_bounded_and_monotonic_in_backpressure() {
        let o = fixture().orchestrator;
        for state in [CircuitState::Closed, CircuitState::HalfOpen, CircuitState::Open] {
            let mut prev = Duration::ZERO;
            for blocked in 0..200 {
                for total in [1, 5, 6, 50] {
                    let d = o.compute_delay(&stats(state, total, 1, blocked));
                    assert!(d >= Duration::from_secs(20) && d <= Duration::from_secs(300));
                }
                let d = o.compute_delay(&stats(state, 3, 1, blocked));
                assert!(d >= prev, "delay decreased at blocked={blocked}");
                prev = d;
            }
        }
    }

    #[test]
    fn start_without_sessions_is_noop() {
        let f = fixture();
        assert!(f.orchestrator.start(0).unwrap().is_none());
        assert!(f.backend.submissions().is_empty());

        let handle = f.orchestrator.start(2).unwrap().unwrap();
        let (h, sub) = f.backend.last_submission().unwrap();
        assert_eq!(h, handle);
        assert_eq!(sub.work, WorkItem::Orchestrate { retries: 0 });
        assert_eq!(sub.queue, QueueName::Primary);
        assert_eq!(sub.limits, TimeLimits::default());
    }

    #[test]
    fn chain_stopped_by_admission_restarts_once_capacity_returns() {
        let f = fixture();
        f.source.open(LiveSession::new(1)).unwrap();
        for i in 0..100 {
            f.store.rpush(QueueName::LiveReporting.key(), &format!("item-{i}")).unwrap();
        }

        f.orchestrator.start(1).unwrap().unwrap();
        let report = f.orchestrator.handle(0).unwrap();
        assert_eq!(
            report.decision,
            ChainDecision::Stop {
                reason: StopReason::NothingScheduled
            }
        );
        assert!(!f.orchestrator.chain_active());

        while f.store.lpop(QueueName::LiveReporting.key()).unwrap().is_some() {}
        let before = f.backend.submissions().len();
        let handle = f.orchestrator.ensure_running().unwrap().unwrap();
        assert!(f.orchestrator.chain_active());
        assert_eq!(f.backend.submissions().len(), before + 1);
        assert_eq!(f.backend.last_submission().unwrap().0, handle);

        let report = f.orchestrator.handle(0).unwrap();
        assert!(matches!(report.decision, ChainDecision::Continue { .. }));
    }

    #[test]
    fn ensure_running_leaves_live_or_empty_chains_alone() {
        let f = fixture();
        assert!(f.orchestrator.ensure_running().unwrap().is_none());

        f.source.open(LiveSession::new(2)).unwrap();
        f.orchestrator.start(1).unwrap().unwrap();
        assert!(f.orchestrator.ensure_running().unwrap().is_none());
        assert_eq!(f.backend.submissions().len(), 1);
    }

    #[test]
    fn second_start_does_not_fork_the_chain() {
        let f = fixture();
        f.source.open(LiveSession::new(1)).unwrap();
        assert!(f.orchestrator.start(1).unwrap().is_some());
        assert!(f.orchestrator.start(2).unwrap().is_none());
        assert_eq!(f.backend.submissions().len(), 1);
        assert!(f.orchestrator.chain_active());

        f.source.deactivate(1, "finished").unwrap();
        f.orchestrator.handle(0).unwrap();
        assert!(!f.orchestrator.chain_active());
        assert!(f.store.get(&chain_lease_key()).unwrap().is_none());
        assert!(f.orchestrator.start(1).unwrap().is_some());
    }

    #[test]
    fn pass_with_sessions_reenqueues_itself() {
        let f = fixture();
        f.source.open(LiveSession::new(1)).unwrap();
        let report = f.orchestrator.run_once().unwrap();
        assert_eq!(
            report.decision,
            ChainDecision::Continue {
                delay: Duration::from_secs(30)
            }
        );
        let (_, sub) = f.backend.last_submission().unwrap();
        assert_eq!(sub.work, WorkItem::Orchestrate { retries: 0 });
        assert_eq!(sub.schedule, Schedule::Countdown(Duration::from_secs(30)));
    }

    #[test]
    fn pass_without_sessions_stops() {
        let f = fixture();
        let report = f.orchestrator.run_once().unwrap();
        assert_eq!(
            report.decision,
            ChainDecision::Stop {
                reason: StopReason::NoSessions
            }
        );
        assert!(report.next.is_none());
        assert!(f.backend.submissions().is_empty());
    }

    #[test]
    fn chain_terminates_once_sessions_end() {
        let f = fixture();
        f.source.open(LiveSession::new(1)).unwrap();
        let mut links = 0;
        for pass in 0..100 {
            if pass == 3 {
                f.source.deactivate(1, "finished").unwrap();
            }
            let report = f.orchestrator.handle(0).unwrap();
            if report.next.is_none() {
                break;
            }
            links += 1;
        }
        assert_eq!(links, 3);
    }

    #[test]
    fn failed_pass_retries_while_sessions_exist_then_gives_up() {
        let source = Arc::new(MemorySessionSource::new());
        source.open(LiveSession::new(5)).unwrap();

        struct FailingTracker(Arc<MemorySessionSource>);
        impl SessionTracker for FailingTracker {
            fn get_active_sessions(&self) -> Result<Vec<LiveSession>> {
                self.0.active_sessions()
            }
            fn process_active_sessions(&self) -> Result<ProcessingStats> {
                Err(crate::error::MatchdayError::SessionSource("db down".into()))
            }
            fn health_check(&self) -> TrackerHealth {
                unreachable!()
            }
        }

        let backend = Arc::new(MemoryBackend::new());
        let o = Orchestrator::new(
            Arc::new(FailingTracker(source.clone())),
            backend.clone(),
            Arc::new(MemoryStore::new()),
            OrchestratorConfig::default(),
        );

        let report = o.handle(0).unwrap();
        assert_eq!(report.retries, 1);
        let (_, sub) = backend.last_submission().unwrap();
        assert_eq!(sub.work, WorkItem::Orchestrate { retries: 1 });
        assert_eq!(sub.schedule, Schedule::Countdown(Duration::from_secs(30)));

        let report = o.handle(3).unwrap();
        assert_eq!(
            report.decision,
            ChainDecision::Continue {
                delay: Duration::from_secs(120)
            }
        );

        let report = o.handle(5).unwrap();
        assert_eq!(
            report.decision,
            ChainDecision::Stop {
                reason: StopReason::RetriesExhausted
            }
        );

        source.deactivate(5, "done").unwrap();
        let report = o.handle(0).unwrap();
        assert_eq!(
            report.decision,
            ChainDecision::Stop {
                reason: StopReason::SessionsGone
            }
        );
    }

    #[test]
    fn retry_delay_is_capped() {
        let o = fixture().orchestrator;
        assert_eq!(o.retry_delay(0).as_secs(), 30);
        assert_eq!(o.retry_delay(1).as_secs(), 60);
        assert_eq!(o.retry_delay(20).as_secs(), 300);
    }

    #[test]
    fn health_check_does_not_submit() {
        let f = fixture();
        f.source.open(LiveSession::new(1)).unwrap();
        let h = f.orchestrator.health_check();
        assert_eq!(h.circuit_state, CircuitState::Closed);
        assert_eq!(h.active_sessions, Some(1));
        assert_eq!(h.queue_utilization, Some(0.0));
        assert!(f.backend.submissions().is_empty());
    }
}
