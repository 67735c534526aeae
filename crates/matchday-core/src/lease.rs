//! TTL leases in the shared store.
//!
//! A lease is a key written with `SET NX EX`: whoever writes it holds it
//! until it is released or expires. A lease with no expiry, or one far
//! beyond its expected lifetime, was leaked by a crashed holder and is
//! removed by emergency recovery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::KeyValueStore;

pub const SCHEDULER_LEASE_PREFIX: &str = "scheduler-lease:";
pub const WORKER_LEASE_PREFIX: &str = "worker-lease:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
}

/// Try to take `key` for `ttl`. `None` when somebody else holds it.
pub fn acquire(
    store: &dyn KeyValueStore,
    key: &str,
    holder: &str,
    ttl: Duration,
) -> Result<Option<Lease>> {
    if store.set_nx_ex(key, ttl, holder)? {
        Ok(Some(Lease {
            key: key.to_string(),
            holder: holder.to_string(),
        }))
    } else {
        Ok(None)
    }
}

/// Release a lease if it is still ours. Returns whether a key was removed.
pub fn release(store: &dyn KeyValueStore, lease: &Lease) -> Result<bool> {
    match store.get(&lease.key)? {
        Some(holder) if holder == lease.holder => store.delete(&lease.key),
        _ => Ok(false),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub scanned: u64,
    pub cleared: u64,
    pub failures: u64,
}

/// Delete keys matching `pattern` that have no expiry or an expiry beyond
/// `ceiling`. At most `limit` keys are inspected when given. Per-key errors
/// are counted and skipped.
pub fn sweep_leaked(
    store: &dyn KeyValueStore,
    pattern: &str,
    ceiling: Duration,
    limit: Option<usize>,
) -> Result<SweepOutcome> {
    let mut keys = store.keys(pattern)?;
    if let Some(limit) = limit {
        keys.truncate(limit);
    }

    let mut outcome = SweepOutcome::default();
    for key in keys {
        outcome.scanned += 1;
        let leaked = match store.ttl(&key) {
            Ok(ttl) => ttl.is_leaked(ceiling),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "ttl unreadable, skipping");
                outcome.failures += 1;
                continue;
            }
        };
        if !leaked {
            continue;
        }
        match store.delete(&key) {
            Ok(true) => {
                tracing::debug!(key = %key, "cleared leaked key");
                outcome.cleared += 1;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "delete failed, skipping");
                outcome.failures += 1;
            }
        }
    }
    Ok(outcome)
}
