//! Combined health: queue tiers, worker heartbeats and the circuit breaker
//! folded into one status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::CircuitState;
use crate::heartbeat::WorkerHealth;
use crate::queue::Tier;
use crate::queue_health::QueueHealthReport;

/// Overall status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Warning => "warning",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedHealth {
    pub status: OverallStatus,
    pub broker_reachable: bool,
    pub worst_queue_tier: Tier,
    pub circuit_state: CircuitState,
    pub missing_services: Vec<String>,
    /// One line per condition that lowered the status.
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// critical: broker down or any queue in Emergency.
/// degraded: circuit not closed, a queue Critical or unreadable, or a
/// service without a heartbeat.
/// warning: a queue in Warning.
pub fn combine(queues: &QueueHealthReport, workers: &WorkerHealth, circuit: CircuitState) -> CombinedHealth {
    let mut status = OverallStatus::Healthy;
    let mut reasons = Vec::new();
    let mut raise = |to: OverallStatus, reason: String| {
        status = status.max(to);
        reasons.push(reason);
    };

    if !workers.broker_reachable {
        raise(OverallStatus::Critical, "broker unreachable".into());
    }
    for q in &queues.queues {
        match q.tier {
            Tier::Emergency => raise(OverallStatus::Critical, format!("{} in emergency ({})", q.name, q.depth)),
            Tier::Critical => raise(OverallStatus::Degraded, format!("{} critical ({})", q.name, q.depth)),
            Tier::Warning => raise(OverallStatus::Warning, format!("{} above warning ({})", q.name, q.depth)),
            Tier::Healthy => {}
        }
    }
    for q in &queues.unreadable {
        raise(OverallStatus::Degraded, format!("{q} depth unreadable"));
    }
    if circuit != CircuitState::Closed {
        raise(OverallStatus::Degraded, format!("circuit breaker {circuit}"));
    }
    let missing: Vec<String> = workers.missing_services().into_iter().map(String::from).collect();
    if workers.broker_reachable && !missing.is_empty() {
        raise(
            OverallStatus::Degraded,
            format!("no heartbeat from {}", missing.join(", ")),
        );
    }

    CombinedHealth {
        status,
        broker_reachable: workers.broker_reachable,
        worst_queue_tier: queues.worst_tier(),
        circuit_state: circuit,
        missing_services: missing,
        reasons,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::ServiceStatus;
    use crate::queue::{QueueName, QueueSnapshot};
    use std::collections::BTreeMap;

    fn queues(tiers: &[(QueueName, Tier)]) -> QueueHealthReport {
        QueueHealthReport {
            timestamp: Utc::now(),
            queues: tiers
                .iter()
                .map(|(name, tier)| QueueSnapshot {
                    name: *name,
                    depth: 0,
                    tier: *tier,
                })
                .collect(),
            alerts: Vec::new(),
            actions: Vec::new(),
            unreadable: Vec::new(),
            remediation_failures: 0,
        }
    }

    fn workers(reachable: bool, alive: bool) -> WorkerHealth {
        let mut services = BTreeMap::new();
        services.insert(
            "dispatcher".to_string(),
            ServiceStatus {
                alive,
                worker_id: alive.then(|| "node-1".to_string()),
                last_seen: alive.then(Utc::now),
            },
        );
        WorkerHealth {
            broker_reachable: reachable,
            services,
            roster: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn all_green_is_healthy() {
        let h = combine(
            &queues(&[(QueueName::Primary, Tier::Healthy)]),
            &workers(true, true),
            CircuitState::Closed,
        );
        assert_eq!(h.status, OverallStatus::Healthy);
        assert!(h.reasons.is_empty());
    }

    #[test]
    fn status_takes_the_worst_condition() {
        let q = queues(&[(QueueName::Primary, Tier::Warning)]);
        assert_eq!(combine(&q, &workers(true, true), CircuitState::Closed).status, OverallStatus::Warning);
        assert_eq!(combine(&q, &workers(true, true), CircuitState::Open).status, OverallStatus::Degraded);
        assert_eq!(combine(&q, &workers(true, false), CircuitState::Closed).status, OverallStatus::Degraded);
        assert_eq!(combine(&q, &workers(false, false), CircuitState::Closed).status, OverallStatus::Critical);

        let q = queues(&[
            (QueueName::Primary, Tier::Critical),
            (QueueName::LiveReporting, Tier::Emergency),
        ]);
        let h = combine(&q, &workers(true, true), CircuitState::Closed);
        assert_eq!(h.status, OverallStatus::Critical);
        assert_eq!(h.worst_queue_tier, Tier::Emergency);
        assert_eq!(h.reasons.len(), 2);
    }
}
