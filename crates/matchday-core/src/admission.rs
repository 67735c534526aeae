//! Admission control consulted before more live-reporting work is admitted:
//! a circuit breaker isolating a failing downstream, and a backpressure gate
//! on queue depth.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::queue::QueueName;
use crate::store::KeyValueStore;

// ---------------------------------------------------------------------------
// CircuitState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Serializable view of a breaker, as reported by health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition: DateTime<Utc>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Process-local failure isolation.
///
/// Closed admits everything and opens after `failure_threshold` consecutive
/// failures. Open rejects until `recovery_timeout` has elapsed, then the next
/// `can_execute` moves it to HalfOpen. HalfOpen closes after
/// `success_threshold` successes and reopens on any failure.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: chrono::Duration,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_transition: DateTime<Utc>,
    last_failure: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: &AdmissionConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: cfg.failure_threshold.max(1),
            success_threshold: cfg.success_threshold.max(1),
            recovery_timeout: chrono::Duration::seconds(
                i64::try_from(cfg.recovery_timeout_secs).unwrap_or(i64::MAX / 1_000),
            ),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_transition: Utc::now(),
            last_failure: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            name: self.name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_transition: self.last_transition,
            last_failure: self.last_failure,
        }
    }

    pub fn can_execute(&mut self) -> bool {
        self.can_execute_at(Utc::now())
    }

    pub fn can_execute_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map_or(true, |at| now - at >= self.recovery_timeout);
                if elapsed {
                    self.transition(CircuitState::HalfOpen, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Utc::now());
    }

    pub fn record_success_at(&mut self, now: DateTime<Utc>) {
        match self.state {
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.transition(CircuitState::Closed, now);
                }
            }
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        self.failure_count += 1;
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed if self.failure_count >= self.failure_threshold => {
                self.transition(CircuitState::Open, now);
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open, now);
            }
            _ => {}
        }
    }

    fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) {
        let from = self.state;
        self.state = to;
        self.last_transition = now;
        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
            }
            CircuitState::Open => {}
        }
        if to == CircuitState::Open {
            tracing::warn!(
                breaker = %self.name,
                from = %from,
                failures = self.failure_count,
                "circuit breaker opened"
            );
        } else {
            tracing::info!(breaker = %self.name, from = %from, to = %to, "circuit breaker transition");
        }
    }
}

// ---------------------------------------------------------------------------
// BackpressureGate
// ---------------------------------------------------------------------------

/// Blocks admission while the gated queue holds `max_queue_size` items or
/// more.
pub struct BackpressureGate {
    store: Arc<dyn KeyValueStore>,
    queue: QueueName,
    max_queue_size: u64,
}

impl BackpressureGate {
    pub fn new(store: Arc<dyn KeyValueStore>, cfg: &AdmissionConfig) -> Self {
        Self {
            store,
            queue: cfg.gated_queue,
            max_queue_size: cfg.max_queue_size,
        }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn max_queue_size(&self) -> u64 {
        self.max_queue_size
    }

    pub fn queue_depth(&self) -> Result<u64> {
        self.store.llen(self.queue.key())
    }

    /// Whether admission should be blocked. An unreadable depth does not
    /// block.
    pub fn should_apply(&self) -> bool {
        match self.queue_depth() {
            Ok(depth) => depth >= self.max_queue_size,
            Err(e) => {
                tracing::warn!(queue = %self.queue, error = %e, "backpressure: depth unreadable");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
