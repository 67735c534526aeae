//! The outbound side of live reporting: creating match threads and
//! publishing events. Delivery itself belongs to another system; this crate
//! only calls through the trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{MatchdayError, Result};

pub trait MatchReporter: Send + Sync {
    fn create_thread(&self, match_id: i64) -> Result<()>;
    fn start_live_reporting(&self, match_id: i64) -> Result<()>;
    /// Poll and publish new events for one match.
    fn process_match(&self, match_id: i64) -> Result<()>;
}

/// Reporter that only logs. Used when no delivery integration is wired in.
#[derive(Debug, Default)]
pub struct LoggingReporter;

impl MatchReporter for LoggingReporter {
    fn create_thread(&self, match_id: i64) -> Result<()> {
        tracing::info!(match_id, "create match thread");
        Ok(())
    }

    fn start_live_reporting(&self, match_id: i64) -> Result<()> {
        tracing::info!(match_id, "start live reporting");
        Ok(())
    }

    fn process_match(&self, match_id: i64) -> Result<()> {
        tracing::debug!(match_id, "process match events");
        Ok(())
    }
}

/// Counts calls per operation and fails on demand.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    calls: Mutex<BTreeMap<(&'static str, i64), u32>>,
    failing: Mutex<Option<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: Option<&str>) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = error.map(String::from);
    }

    pub fn calls(&self, op: &'static str, match_id: i64) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(op, match_id))
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, op: &'static str, match_id: i64) -> Result<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((op, match_id))
            .or_default() += 1;
        match self.failing.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(error) => Err(MatchdayError::Backend(error.clone())),
            None => Ok(()),
        }
    }
}

impl MatchReporter for RecordingReporter {
    fn create_thread(&self, match_id: i64) -> Result<()> {
        self.record("create_thread", match_id)
    }

    fn start_live_reporting(&self, match_id: i64) -> Result<()> {
        self.record("start_live_reporting", match_id)
    }

    fn process_match(&self, match_id: i64) -> Result<()> {
        self.record("process_match", match_id)
    }
}
