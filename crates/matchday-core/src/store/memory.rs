//! In-process `KeyValueStore` used by tests and single-node deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{MatchdayError, Result};

use super::{glob_to_regex, resolve_range, KeyValueStore, Ttl};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-memory store with lazy expiry.
///
/// Outages can be simulated with [`MemoryStore::set_available`] and
/// [`MemoryStore::fail_next`]; both surface as `TransientBackend` errors.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    failures_remaining: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MatchdayError::TransientBackend("store unreachable".into()));
        }
        let consumed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(MatchdayError::TransientBackend("injected failure".into()));
        }
        Ok(())
    }

    /// Run `f` against the live (non-expired) map.
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        f(&mut entries)
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a mut VecDeque<String>>> {
    match entries.get_mut(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::List(list),
            ..
        }) => Ok(Some(list)),
        Some(_) => Err(MatchdayError::WrongType(key.to_string())),
    }
}

impl KeyValueStore for MemoryStore {
    fn ping(&self) -> Result<()> {
        self.check_available()
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(MatchdayError::WrongType(key.to_string())),
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: None,
                },
            );
            Ok(())
        })
    }

    fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    fn set_nx_ex(&self, key: &str, ttl: Duration, value: &str) -> Result<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| Ok(entries.remove(key).is_some()))
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        self.with_entries(|entries| {
            let mut keys: Vec<String> = entries.keys().filter(|k| re.is_match(k)).cloned().collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn ttl(&self, key: &str) -> Result<Ttl> {
        self.with_entries(|entries| {
            Ok(match entries.get(key) {
                None => Ttl::Missing,
                Some(Entry {
                    expires_at: None, ..
                }) => Ttl::Persistent,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => Ttl::Expires(at.saturating_duration_since(Instant::now())),
            })
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            None => Ok(false),
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
        })
    }

    fn incr(&self, key: &str) -> Result<i64> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Str("0".into()),
                expires_at: None,
            });
            let Value::Str(current) = &entry.value else {
                return Err(MatchdayError::WrongType(key.to_string()));
            };
            let next = current
                .parse::<i64>()
                .map_err(|_| MatchdayError::WrongType(key.to_string()))?
                + 1;
            entry.value = Value::Str(next.to_string());
            Ok(next)
        })
    }

    fn llen(&self, key: &str) -> Result<u64> {
        self.with_entries(|entries| Ok(list_mut(entries, key)?.map_or(0, |l| l.len() as u64)))
    }

    fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| {
            let Some(list) = list_mut(entries, key)? else {
                return Ok(None);
            };
            let item = list.pop_front();
            if list.is_empty() {
                entries.remove(key);
            }
            Ok(item)
        })
    }

    fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        self.with_entries(|entries| {
            if list_mut(entries, key)?.is_none() {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(VecDeque::new()),
                        expires_at: None,
                    },
                );
            }
            let list = list_mut(entries, key)?
                .ok_or_else(|| MatchdayError::WrongType(key.to_string()))?;
            list.push_back(value.to_string());
            Ok(list.len() as u64)
        })
    }

    fn lindex(&self, key: &str, index: i64) -> Result<Option<String>> {
        self.with_entries(|entries| {
            let Some(list) = list_mut(entries, key)? else {
                return Ok(None);
            };
            let len = list.len() as i64;
            let idx = if index < 0 { len + index } else { index };
            if idx < 0 || idx >= len {
                return Ok(None);
            }
            Ok(list.get(idx as usize).cloned())
        })
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.with_entries(|entries| {
            let Some(list) = list_mut(entries, key)? else {
                return Ok(Vec::new());
            };
            Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            })
        })
    }
}
