//! Named work queues, their backlog thresholds, and severity tiers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MatchdayError;

// ---------------------------------------------------------------------------
// QueueName
// ---------------------------------------------------------------------------

/// A named work queue. The name doubles as the list key in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Primary,
    LiveReporting,
    Integration,
    Sync,
}

impl QueueName {
    pub fn all() -> &'static [QueueName] {
        &[
            QueueName::Primary,
            QueueName::LiveReporting,
            QueueName::Integration,
            QueueName::Sync,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Primary => "primary",
            QueueName::LiveReporting => "live-reporting",
            QueueName::Integration => "integration",
            QueueName::Sync => "sync",
        }
    }

    /// List key holding this queue's items.
    pub fn key(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = MatchdayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::all()
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| MatchdayError::UnknownQueue(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Backlog severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Healthy,
    Warning,
    Critical,
    Emergency,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Healthy => "healthy",
            Tier::Warning => "warning",
            Tier::Critical => "critical",
            Tier::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Depth limits for one queue. A depth strictly greater than a limit moves
/// the queue into that tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: u64,
    pub critical: u64,
    pub emergency: u64,
}

impl Thresholds {
    pub const fn new(warning: u64, critical: u64, emergency: u64) -> Self {
        Self {
            warning,
            critical,
            emergency,
        }
    }

    pub fn classify(&self, depth: u64) -> Tier {
        if depth > self.emergency {
            Tier::Emergency
        } else if depth > self.critical {
            Tier::Critical
        } else if depth > self.warning {
            Tier::Warning
        } else {
            Tier::Healthy
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.warning < self.critical && self.critical < self.emergency
    }
}

/// Built-in threshold table.
pub fn default_thresholds(queue: QueueName) -> Thresholds {
    match queue {
        QueueName::Primary => Thresholds::new(100, 200, 500),
        QueueName::LiveReporting => Thresholds::new(10, 50, 100),
        QueueName::Integration => Thresholds::new(150, 300, 600),
        QueueName::Sync => Thresholds::new(50, 100, 200),
    }
}

pub fn default_threshold_table() -> BTreeMap<QueueName, Thresholds> {
    QueueName::all()
        .iter()
        .map(|q| (*q, default_thresholds(*q)))
        .collect()
}

// ---------------------------------------------------------------------------
// QueueSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a queue. Recomputed on every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: QueueName,
    pub depth: u64,
    pub tier: Tier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup_matches_every_boundary() {
        for queue in QueueName::all() {
            let t = default_thresholds(*queue);
            assert_eq!(t.classify(0), Tier::Healthy);
            assert_eq!(t.classify(t.warning), Tier::Healthy);
            assert_eq!(t.classify(t.warning + 1), Tier::Warning);
            assert_eq!(t.classify(t.critical), Tier::Warning);
            assert_eq!(t.classify(t.critical + 1), Tier::Critical);
            assert_eq!(t.classify(t.emergency), Tier::Critical);
            assert_eq!(t.classify(t.emergency + 1), Tier::Emergency);
            assert!(t.is_ordered());
        }
    }

    #[test]
    fn live_reporting_at_120_is_emergency() {
        let t = default_thresholds(QueueName::LiveReporting);
        assert_eq!(t.classify(120), Tier::Emergency);
    }

    #[test]
    fn queue_names_parse_and_display() {
        for queue in QueueName::all() {
            let parsed: QueueName = queue.as_str().parse().unwrap();
            assert_eq!(parsed, *queue);
        }
        assert!("celery".parse::<QueueName>().is_err());
        assert_eq!(QueueName::LiveReporting.to_string(), "live-reporting");
    }

    #[test]
    fn tiers_order_by_severity() {
        assert!(Tier::Healthy < Tier::Warning);
        assert!(Tier::Warning < Tier::Critical);
        assert!(Tier::Critical < Tier::Emergency);
    }
}
