//! Queue Health Monitor: polls every named queue, classifies it into a tier
//! and applies the remediation that tier calls for.
//!
//! | tier      | action                                                    |
//! |-----------|-----------------------------------------------------------|
//! | Emergency | keep the newest `floor(depth * 0.2)` items, drop the rest |
//! | Critical  | drop expired and unreadable items, then halve if needed   |
//! | Warning   | alert only                                                |
//! | Healthy   | nothing                                                   |
//!
//! Remediation reads and rewrites the list non-atomically. Items pushed
//! while a queue is being rewritten can be lost; ordering is best effort.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::QueuedWork;
use crate::error::{MatchdayError, Result};
use crate::queue::{default_thresholds, QueueName, QueueSnapshot, Thresholds, Tier};
use crate::remediation::{RemediationAction, RemediationKind};
use crate::retry::with_backoff;
use crate::store::KeyValueStore;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAlert {
    pub queue: QueueName,
    pub tier: Tier,
    pub depth: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealthReport {
    pub timestamp: DateTime<Utc>,
    pub queues: Vec<QueueSnapshot>,
    pub alerts: Vec<QueueAlert>,
    pub actions: Vec<RemediationAction>,
    /// Queues whose depth could not be read this poll.
    pub unreadable: Vec<QueueName>,
    /// Per-item or per-queue remediation failures, skipped and counted.
    pub remediation_failures: u64,
}

impl QueueHealthReport {
    /// Most severe tier seen this poll.
    pub fn worst_tier(&self) -> Tier {
        self.queues
            .iter()
            .map(|q| q.tier)
            .max()
            .unwrap_or(Tier::Healthy)
    }

    pub fn tasks_removed(&self) -> u64 {
        self.actions.iter().map(|a| a.removed()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total_tasks: u64,
    pub queues: BTreeMap<QueueName, u64>,
}

// ---------------------------------------------------------------------------
// QueueHealthMonitor
// ---------------------------------------------------------------------------

pub struct QueueHealthMonitor {
    store: Arc<dyn KeyValueStore>,
    thresholds: BTreeMap<QueueName, Thresholds>,
}

impl QueueHealthMonitor {
    pub fn new(store: Arc<dyn KeyValueStore>, thresholds: BTreeMap<QueueName, Thresholds>) -> Self {
        Self { store, thresholds }
    }

    pub fn thresholds_for(&self, queue: QueueName) -> Thresholds {
        self.thresholds
            .get(&queue)
            .copied()
            .unwrap_or_else(|| default_thresholds(queue))
    }

    pub fn depth(&self, queue: QueueName) -> Result<u64> {
        with_backoff("llen", || self.store.llen(queue.key()))
    }

    pub fn snapshot(&self, queue: QueueName) -> Result<QueueSnapshot> {
        let depth = self.depth(queue)?;
        Ok(QueueSnapshot {
            name: queue,
            depth,
            tier: self.thresholds_for(queue).classify(depth),
        })
    }

    /// Depth of every queue. Side-effect free.
    pub fn get_summary(&self) -> Result<QueueSummary> {
        let mut queues = BTreeMap::new();
        for queue in QueueName::all() {
            queues.insert(*queue, self.depth(*queue)?);
        }
        Ok(QueueSummary {
            total_tasks: queues.values().sum(),
            queues,
        })
    }

    /// Poll and remediate every queue. A failure on one queue never stops
    /// the sweep.
    pub fn check_health(&self) -> QueueHealthReport {
        self.poll(true)
    }

    /// Classify every queue without touching any of them.
    pub fn observe(&self) -> QueueHealthReport {
        self.poll(false)
    }

    fn poll(&self, remediate: bool) -> QueueHealthReport {
        let mut report = QueueHealthReport {
            timestamp: Utc::now(),
            queues: Vec::new(),
            alerts: Vec::new(),
            actions: Vec::new(),
            unreadable: Vec::new(),
            remediation_failures: 0,
        };

        for queue in QueueName::all().iter().copied() {
            let snapshot = match self.snapshot(queue) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "queue depth unreadable");
                    report.unreadable.push(queue);
                    continue;
                }
            };

            let thresholds = self.thresholds_for(queue);
            if snapshot.tier != Tier::Healthy {
                report.alerts.push(QueueAlert {
                    queue,
                    tier: snapshot.tier,
                    depth: snapshot.depth,
                    message: format!(
                        "{} queue at {} depth {} (warning {}, critical {}, emergency {})",
                        snapshot.tier, queue, snapshot.depth, thresholds.warning,
                        thresholds.critical, thresholds.emergency
                    ),
                });
            }

            if !remediate {
                report.queues.push(snapshot);
                continue;
            }

            let outcome = match snapshot.tier {
                Tier::Emergency => self.emergency_purge(queue, snapshot.depth).map(Some),
                Tier::Critical => self.critical_cleanup(queue, &thresholds).map(Some),
                Tier::Warning => {
                    tracing::warn!(queue = %queue, depth = snapshot.depth, "queue above warning threshold");
                    let action = RemediationAction::new(
                        RemediationKind::WarningAlert,
                        queue.as_str(),
                        snapshot.depth,
                        snapshot.depth,
                    );
                    action.emit(self.store.as_ref());
                    Ok(None)
                }
                Tier::Healthy => Ok(None),
            };

            match outcome {
                Ok(Some(action)) => {
                    report.remediation_failures += action.failures;
                    report.actions.push(action);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "remediation failed");
                    report.remediation_failures += 1;
                }
            }
            report.queues.push(snapshot);
        }

        report
    }

    // -----------------------------------------------------------------------
    // Remediation
    // -----------------------------------------------------------------------

    /// Keep the newest `floor(depth * 0.2)` items in their relative order.
    pub fn emergency_purge(&self, queue: QueueName, depth: u64) -> Result<RemediationAction> {
        let key = queue.key();
        let keep = depth / 5;
        let kept = if keep == 0 {
            Vec::new()
        } else {
            let start = -i64::try_from(keep).unwrap_or(i64::MAX);
            with_backoff("lrange", || self.store.lrange(key, start, -1))?
        };

        with_backoff("delete", || self.store.delete(key))?;
        let failures = self.reinsert(queue, &kept);

        let after = kept.len() as u64 - failures;
        let action = RemediationAction::new(RemediationKind::EmergencyPurge, queue.as_str(), depth, after)
            .with_failures(failures);
        action.emit(self.store.as_ref());
        Ok(action)
    }

    /// Drop expired and unreadable items. If more than `warning` items
    /// remain, keep only the newest half of them.
    pub fn critical_cleanup(&self, queue: QueueName, thresholds: &Thresholds) -> Result<RemediationAction> {
        let key = queue.key();
        let items = with_backoff("lrange", || self.store.lrange(key, 0, -1))?;
        let before = items.len() as u64;
        let now = Utc::now();

        let mut survivors: Vec<String> = items
            .into_iter()
            .filter(|raw| match serde_json::from_str::<QueuedWork>(raw) {
                Ok(work) => !work.is_expired(now),
                Err(e) => {
                    tracing::debug!(queue = %queue, error = %e, "dropping unreadable queue item");
                    false
                }
            })
            .collect();

        if survivors.len() as u64 > thresholds.warning {
            let drop = survivors.len() - survivors.len() / 2;
            survivors.drain(..drop);
        }

        with_backoff("delete", || self.store.delete(key))?;
        let failures = self.reinsert(queue, &survivors);

        let after = survivors.len() as u64 - failures;
        let action = RemediationAction::new(RemediationKind::CriticalCleanup, queue.as_str(), before, after)
            .with_failures(failures);
        action.emit(self.store.as_ref());
        Ok(action)
    }

    /// Push items back onto the tail in order; returns how many failed.
    fn reinsert(&self, queue: QueueName, items: &[String]) -> u64 {
        let mut failures = 0;
        for item in items {
            if let Err(e) = with_backoff("rpush", || self.store.rpush(queue.key(), item)) {
                let e = MatchdayError::RemediationFailure {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %e, "queue item skipped");
                failures += 1;
            }
        }
        failures
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
