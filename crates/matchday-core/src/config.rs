use crate::error::Result;
use crate::queue::{default_threshold_table, QueueName, Thresholds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "matchday.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// LedgerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".matchday/ledger.redb")
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Consecutive failed passes tolerated before the chain is dropped.
    #[serde(default = "default_orchestrator_retries")]
    pub max_retries: u32,
    #[serde(default = "default_soft_limit")]
    pub soft_limit_secs: u64,
    #[serde(default = "default_hard_limit")]
    pub hard_limit_secs: u64,
}

fn default_base_delay() -> u64 {
    30
}

fn default_min_delay() -> u64 {
    20
}

fn default_max_delay() -> u64 {
    300
}

fn default_orchestrator_retries() -> u32 {
    5
}

fn default_soft_limit() -> u64 {
    60
}

fn default_hard_limit() -> u64 {
    90
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            max_retries: default_orchestrator_retries(),
            soft_limit_secs: default_soft_limit(),
            hard_limit_secs: default_hard_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,
    /// Queue whose depth drives backpressure.
    #[serde(default = "default_gated_queue")]
    pub gated_queue: QueueName,
    /// Sessions with no update for this long are deactivated.
    #[serde(default = "default_stale_session")]
    pub stale_session_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

fn default_max_queue_size() -> u64 {
    100
}

fn default_gated_queue() -> QueueName {
    QueueName::LiveReporting
}

fn default_stale_session() -> u64 {
    2 * 3600
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
            max_queue_size: default_max_queue_size(),
            gated_queue: default_gated_queue(),
            stale_session_secs: default_stale_session(),
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Aggregate depth across all queues above which recovery triggers.
    #[serde(default = "default_aggregate_limit")]
    pub aggregate_limit: u64,
    #[serde(default = "default_scheduler_lease_pattern")]
    pub scheduler_lease_pattern: String,
    #[serde(default = "default_scheduler_lease_ttl")]
    pub scheduler_lease_max_ttl_secs: u64,
    #[serde(default = "default_worker_lease_pattern")]
    pub worker_lease_pattern: String,
    #[serde(default = "default_worker_lease_ttl")]
    pub worker_lease_max_ttl_secs: u64,
    #[serde(default = "default_result_pattern")]
    pub result_pattern: String,
    #[serde(default = "default_result_ttl")]
    pub result_max_ttl_secs: u64,
    /// At most this many result entries are inspected per run.
    #[serde(default = "default_result_sample")]
    pub result_sample: usize,
    #[serde(default = "default_recovery_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_recovery_retries")]
    pub max_retries: u32,
}

fn default_aggregate_limit() -> u64 {
    1000
}

fn default_scheduler_lease_pattern() -> String {
    "scheduler-lease:*".to_string()
}

fn default_scheduler_lease_ttl() -> u64 {
    600
}

fn default_worker_lease_pattern() -> String {
    "worker-lease:*".to_string()
}

fn default_worker_lease_ttl() -> u64 {
    300
}

fn default_result_pattern() -> String {
    "task-meta:*".to_string()
}

fn default_result_ttl() -> u64 {
    7200
}

fn default_result_sample() -> usize {
    100
}

fn default_recovery_retry_delay() -> u64 {
    300
}

fn default_recovery_retries() -> u32 {
    1
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            aggregate_limit: default_aggregate_limit(),
            scheduler_lease_pattern: default_scheduler_lease_pattern(),
            scheduler_lease_max_ttl_secs: default_scheduler_lease_ttl(),
            worker_lease_pattern: default_worker_lease_pattern(),
            worker_lease_max_ttl_secs: default_worker_lease_ttl(),
            result_pattern: default_result_pattern(),
            result_max_ttl_secs: default_result_ttl(),
            result_sample: default_result_sample(),
            retry_delay_secs: default_recovery_retry_delay(),
            max_retries: default_recovery_retries(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconciliationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Records this far past their scheduled time are expired rather than
    /// resubmitted.
    #[serde(default = "default_expire_after")]
    pub expire_after_secs: u64,
}

fn default_expire_after() -> u64 {
    6 * 3600
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            expire_after_secs: default_expire_after(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Sleep between polls when every queue is empty.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_queue_health_interval")]
    pub queue_health_interval_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_emergency_interval")]
    pub emergency_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,
}

fn default_poll_interval() -> u64 {
    500
}

fn default_queue_health_interval() -> u64 {
    300
}

fn default_reconcile_interval() -> u64 {
    600
}

fn default_emergency_interval() -> u64 {
    600
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_ttl() -> u64 {
    90
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            queue_health_interval_secs: default_queue_health_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            emergency_interval_secs: default_emergency_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_ttl_secs: default_heartbeat_ttl(),
        }
    }
}

impl DispatcherConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7700
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Per-queue thresholds. Queues missing from the file use the built-in
    /// table.
    #[serde(default)]
    pub queues: BTreeMap<QueueName, Thresholds>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load from `path`. A missing or empty file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Effective thresholds: built-in table overlaid with file entries.
    pub fn thresholds(&self) -> BTreeMap<QueueName, Thresholds> {
        let mut table = default_threshold_table();
        table.extend(self.queues.iter().map(|(q, t)| (*q, *t)));
        table
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for (queue, t) in &self.queues {
            if !t.is_ordered() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "thresholds for '{}' must satisfy warning < critical < emergency (got {}/{}/{})",
                        queue, t.warning, t.critical, t.emergency
                    ),
                });
            }
        }

        let o = &self.orchestrator;
        if o.min_delay_secs > o.max_delay_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "orchestrator.min_delay_secs ({}) exceeds max_delay_secs ({})",
                    o.min_delay_secs, o.max_delay_secs
                ),
            });
        }
        if o.soft_limit_secs >= o.hard_limit_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "orchestrator soft limit ({}s) should be below the hard limit ({}s)",
                    o.soft_limit_secs, o.hard_limit_secs
                ),
            });
        }
        if o.max_retries > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "orchestrator.max_retries={} (>10 is unusual)",
                    o.max_retries
                ),
            });
        }

        if self.admission.failure_threshold == 0 || self.admission.success_threshold == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "admission failure/success thresholds must be at least 1".to_string(),
            });
        }

        if self.dispatcher.heartbeat_interval_secs >= self.dispatcher.heartbeat_ttl_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "heartbeat interval ({}s) is not shorter than its ttl ({}s); heartbeats will flap",
                    self.dispatcher.heartbeat_interval_secs, self.dispatcher.heartbeat_ttl_secs
                ),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
