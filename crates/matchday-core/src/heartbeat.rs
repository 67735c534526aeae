//! Worker heartbeats and the worker-health view built from them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::KeyValueStore;

pub const HEARTBEAT_PREFIX: &str = "heartbeat:";

/// Services expected to heartbeat in a running deployment.
pub const SERVICES: &[&str] = &["dispatcher", "queue-health", "reconciliation", "emergency-recovery"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub service: String,
    pub worker_id: String,
    pub at: DateTime<Utc>,
}

pub fn heartbeat_key(service: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{service}")
}

/// Record that `worker_id` is alive and serving `service`.
pub fn beat(store: &dyn KeyValueStore, service: &str, worker_id: &str, ttl: Duration) -> Result<()> {
    let hb = WorkerHeartbeat {
        service: service.to_string(),
        worker_id: worker_id.to_string(),
        at: Utc::now(),
    };
    store.setex(&heartbeat_key(service), ttl, &serde_json::to_string(&hb)?)
}

pub fn read(store: &dyn KeyValueStore, service: &str) -> Result<Option<WorkerHeartbeat>> {
    match store.get(&heartbeat_key(service))? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub alive: bool,
    pub worker_id: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub broker_reachable: bool,
    pub services: BTreeMap<String, ServiceStatus>,
    /// Distinct workers with a live heartbeat.
    pub roster: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkerHealth {
    pub fn missing_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, s)| !s.alive)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Broker reachability plus per-service heartbeat freshness. A heartbeat
/// is fresh while its key exists; the key's TTL does the ageing.
pub fn worker_health(store: &dyn KeyValueStore, services: &[&str]) -> WorkerHealth {
    let broker_reachable = match store.ping() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "broker unreachable");
            false
        }
    };

    let mut roster = BTreeSet::new();
    let mut statuses = BTreeMap::new();
    for service in services {
        let hb = if broker_reachable {
            read(store, service).unwrap_or_else(|e| {
                tracing::warn!(service, error = %e, "heartbeat unreadable");
                None
            })
        } else {
            None
        };
        if let Some(hb) = &hb {
            roster.insert(hb.worker_id.clone());
        }
        statuses.insert(
            service.to_string(),
            ServiceStatus {
                alive: hb.is_some(),
                worker_id: hb.as_ref().map(|h| h.worker_id.clone()),
                last_seen: hb.map(|h| h.at),
            },
        );
    }

    WorkerHealth {
        broker_reachable,
        services: statuses,
        roster: roster.into_iter().collect(),
        timestamp: Utc::now(),
    }
}
