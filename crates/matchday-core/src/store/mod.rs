//! Shared key-value store abstraction.
//!
//! Every worker coordinates through one low-latency store: existence markers,
//! counters, leases, and the work queues themselves (as lists). The trait
//! mirrors the small subset of Redis semantics the rest of the crate relies
//! on, so a networked implementation can be dropped in behind it.
//!
//! List convention: producers `rpush` onto the tail, consumers `lpop` from
//! the head. The head is therefore the oldest item and the tail the newest.

pub mod memory;

use std::time::Duration;

use regex::Regex;

use crate::error::{MatchdayError, Result};

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Ttl
// ---------------------------------------------------------------------------

/// Remaining lifetime of a key, as reported by `ttl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl Ttl {
    /// A lease is considered leaked when it has no expiry at all, or an
    /// expiry beyond `ceiling`.
    pub fn is_leaked(&self, ceiling: Duration) -> bool {
        match self {
            Ttl::Missing => false,
            Ttl::Persistent => true,
            Ttl::Expires(remaining) => *remaining > ceiling,
        }
    }
}

// ---------------------------------------------------------------------------
// KeyValueStore
// ---------------------------------------------------------------------------

pub trait KeyValueStore: Send + Sync {
    /// Round-trip check used for broker reachability.
    fn ping(&self) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;

    /// Set `key` only if it does not exist, with an expiry. Returns whether
    /// the key was written.
    fn set_nx_ex(&self, key: &str, ttl: Duration, value: &str) -> Result<bool>;

    /// Returns whether a key was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob pattern (`*` and `?` wildcards), sorted.
    fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    fn ttl(&self, key: &str) -> Result<Ttl>;
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically increment an integer counter, creating it at 0 first.
    fn incr(&self, key: &str) -> Result<i64>;

    fn llen(&self, key: &str) -> Result<u64>;
    fn lpop(&self, key: &str) -> Result<Option<String>>;
    /// Append to the tail; returns the new length.
    fn rpush(&self, key: &str, value: &str) -> Result<u64>;
    /// Negative indices count from the tail (`-1` is the last element).
    fn lindex(&self, key: &str, index: i64) -> Result<Option<String>>;
    /// Inclusive range with Redis index semantics.
    fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compile a glob pattern (`*`, `?`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| MatchdayError::Config(format!("bad key pattern '{pattern}': {e}")))
}

/// Resolve a Redis-style inclusive `[start, stop]` range against a list of
/// `len` elements. Returns `None` when the range is empty.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let norm = |i: i64| if i < 0 { len_i + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len_i - 1);
    if start > stop || start >= len_i {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_prefix_wildcard() {
        let re = glob_to_regex("lease:worker:*").unwrap();
        assert!(re.is_match("lease:worker:abc"));
        assert!(re.is_match("lease:worker:"));
        assert!(!re.is_match("lease:scheduler:abc"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("task-meta.(x)?").unwrap();
        assert!(re.is_match("task-meta.(x)1"));
        assert!(!re.is_match("task-metaX(x)1"));
    }

    #[test]
    fn resolve_range_handles_negative_indices() {
        assert_eq!(resolve_range(10, -3, -1), Some((7, 9)));
        assert_eq!(resolve_range(10, 0, -1), Some((0, 9)));
        assert_eq!(resolve_range(10, 5, 100), Some((5, 9)));
        assert_eq!(resolve_range(10, -100, 2), Some((0, 2)));
        assert_eq!(resolve_range(10, 8, 3), None);
        assert_eq!(resolve_range(0, 0, -1), None);
    }

    #[test]
    fn leaked_lease_detection() {
        let ceiling = Duration::from_secs(600);
        assert!(Ttl::Persistent.is_leaked(ceiling));
        assert!(Ttl::Expires(Duration::from_secs(601)).is_leaked(ceiling));
        assert!(!Ttl::Expires(Duration::from_secs(600)).is_leaked(ceiling));
        assert!(!Ttl::Missing.is_leaked(ceiling));
    }
}
