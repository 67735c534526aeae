//! Live reporting sessions and the tracker that turns them into work.
//!
//! A `SessionSource` is the collaborator owning session rows (persistence is
//! somebody else's concern). `LiveSessionTracker` walks the active sessions,
//! gates each one through the circuit breaker and backpressure, and submits
//! `ProcessMatch` work for the ones admitted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::{BackpressureGate, CircuitBreaker, CircuitBreakerState, CircuitState};
use crate::backend::{ExecutionBackend, Submission, TimeLimits, WorkItem};
use crate::config::AdmissionConfig;
use crate::error::{MatchdayError, Result};
use crate::queue::QueueName;
use crate::store::KeyValueStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    pub match_id: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl LiveSession {
    pub fn new(match_id: i64) -> Self {
        Self {
            match_id,
            started_at: Utc::now(),
            last_update: None,
        }
    }

    /// A session with no update for `stale_after` is stale. Sessions that
    /// never reported an update are not.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.last_update.is_some_and(|at| now - at > stale_after)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_sessions: usize,
    pub scheduled_tasks: usize,
    pub blocked_by_circuit_breaker: usize,
    pub blocked_by_backpressure: usize,
    #[serde(default)]
    pub failed_submissions: usize,
    #[serde(default)]
    pub deactivated_sessions: usize,
    pub circuit_breaker_state: CircuitState,
    /// Seconds spent in the pass.
    pub processing_time: f64,
}

impl ProcessingStats {
    fn empty(state: CircuitState) -> Self {
        Self {
            total_sessions: 0,
            scheduled_tasks: 0,
            blocked_by_circuit_breaker: 0,
            blocked_by_backpressure: 0,
            failed_submissions: 0,
            deactivated_sessions: 0,
            circuit_breaker_state: state,
            processing_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerHealth {
    pub circuit_breaker: CircuitBreakerState,
    pub queue: QueueName,
    /// `None` when the store could not be read.
    pub queue_size: Option<u64>,
    pub max_queue_size: u64,
    pub active_sessions: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait SessionSource: Send + Sync {
    fn active_sessions(&self) -> Result<Vec<LiveSession>>;
    /// Start tracking a session. Opening an already active session is a
    /// no-op.
    fn open(&self, session: LiveSession) -> Result<()>;
    /// Record that events were processed for a session.
    fn touch(&self, match_id: i64, at: DateTime<Utc>) -> Result<()>;
    fn deactivate(&self, match_id: i64, reason: &str) -> Result<()>;
}

pub trait SessionTracker: Send + Sync {
    fn get_active_sessions(&self) -> Result<Vec<LiveSession>>;
    fn process_active_sessions(&self) -> Result<ProcessingStats>;
    /// Read-only snapshot; never mutates tracker state.
    fn health_check(&self) -> TrackerHealth;
}

// ---------------------------------------------------------------------------
// MemorySessionSource
// ---------------------------------------------------------------------------

/// In-process session registry, keyed by match id.
#[derive(Debug, Default)]
pub struct MemorySessionSource {
    sessions: Mutex<BTreeMap<i64, LiveSession>>,
    deactivated: Mutex<Vec<(i64, String)>>,
    failing: AtomicBool,
}

impl MemorySessionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `active_sessions` fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn deactivated(&self) -> Vec<(i64, String)> {
        self.deactivated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SessionSource for MemorySessionSource {
    fn active_sessions(&self) -> Result<Vec<LiveSession>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MatchdayError::SessionSource("session source unavailable".into()));
        }
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn open(&self, session: LiveSession) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session.match_id)
            .or_insert(session);
        Ok(())
    }

    fn touch(&self, match_id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(s) = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&match_id)
        {
            s.last_update = Some(at);
        }
        Ok(())
    }

    fn deactivate(&self, match_id: i64, reason: &str) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&match_id);
        self.deactivated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((match_id, reason.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LiveSessionTracker
// ---------------------------------------------------------------------------

enum Admission {
    Scheduled,
    BlockedByCircuit,
    BlockedByBackpressure,
    SubmitFailed,
}

pub struct LiveSessionTracker {
    source: Arc<dyn SessionSource>,
    backend: Arc<dyn ExecutionBackend>,
    breaker: Mutex<CircuitBreaker>,
    gate: BackpressureGate,
    stale_after: chrono::Duration,
    limits: TimeLimits,
}

impl LiveSessionTracker {
    pub fn new(
        source: Arc<dyn SessionSource>,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn KeyValueStore>,
        cfg: &AdmissionConfig,
    ) -> Self {
        Self {
            source,
            backend,
            breaker: Mutex::new(CircuitBreaker::new("live_reporting", cfg)),
            gate: BackpressureGate::new(store, cfg),
            stale_after: chrono::Duration::seconds(
                i64::try_from(cfg.stale_session_secs).unwrap_or(i64::MAX / 1_000),
            ),
            limits: TimeLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: TimeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner()).state()
    }

    /// Feed an outcome observed elsewhere (e.g. by the dispatcher) into the
    /// breaker.
    pub fn record_outcome(&self, ok: bool) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        if ok {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    fn admit(&self, session: &LiveSession) -> Admission {
        if !self
            .breaker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .can_execute()
        {
            tracing::info!(match_id = session.match_id, "circuit breaker blocking match");
            return Admission::BlockedByCircuit;
        }
        if self.gate.should_apply() {
            tracing::warn!(match_id = session.match_id, "backpressure blocking match");
            return Admission::BlockedByBackpressure;
        }

        let submission = Submission::new(
            WorkItem::ProcessMatch {
                match_id: session.match_id,
            },
            QueueName::LiveReporting,
        )
        .with_limits(self.limits);

        let outcome = self.backend.submit(submission);
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(handle) => {
                tracing::info!(match_id = session.match_id, handle = %handle, "scheduled match processing");
                breaker.record_success();
                Admission::Scheduled
            }
            Err(e) => {
                tracing::error!(match_id = session.match_id, error = %e, "failed to schedule match");
                breaker.record_failure();
                Admission::SubmitFailed
            }
        }
    }
}

impl SessionTracker for LiveSessionTracker {
    fn get_active_sessions(&self) -> Result<Vec<LiveSession>> {
        self.source.active_sessions()
    }

    fn process_active_sessions(&self) -> Result<ProcessingStats> {
        let started = Instant::now();
        let mut stats = ProcessingStats::empty(self.circuit_state());

        let sessions = match self.source.active_sessions() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "could not list active sessions");
                self.breaker
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_failure();
                return Err(e);
            }
        };
        stats.total_sessions = sessions.len();
        if sessions.is_empty() {
            tracing::info!("no active live reporting sessions");
            stats.processing_time = started.elapsed().as_secs_f64();
            return Ok(stats);
        }

        tracing::info!(count = sessions.len(), "processing active sessions");
        let now = Utc::now();
        for session in &sessions {
            if session.is_stale(now, self.stale_after) {
                tracing::warn!(match_id = session.match_id, "deactivating stale session");
                if let Err(e) = self
                    .source
                    .deactivate(session.match_id, "session stale: no updates in 2 hours")
                {
                    tracing::warn!(match_id = session.match_id, error = %e, "deactivate failed");
                }
                stats.deactivated_sessions += 1;
                continue;
            }
            match self.admit(session) {
                Admission::Scheduled => stats.scheduled_tasks += 1,
                Admission::BlockedByCircuit => stats.blocked_by_circuit_breaker += 1,
                Admission::BlockedByBackpressure => stats.blocked_by_backpressure += 1,
                Admission::SubmitFailed => stats.failed_submissions += 1,
            }
        }

        stats.circuit_breaker_state = self.circuit_state();
        stats.processing_time = started.elapsed().as_secs_f64();
        Ok(stats)
    }

    fn health_check(&self) -> TrackerHealth {
        let circuit_breaker = self
            .breaker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot();
        TrackerHealth {
            circuit_breaker,
            queue: self.gate.queue(),
            queue_size: self.gate.queue_depth().ok(),
            max_queue_size: self.gate.max_queue_size(),
            active_sessions: self.source.active_sessions().ok().map(|s| s.len()),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
