use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchdayError {
    #[error("key-value store unavailable: {0}")]
    TransientBackend(String),

    #[error("wrong value type for key '{0}'")]
    WrongType(String),

    #[error("ledger storage error: {0}")]
    Ledger(String),

    #[error("scheduled task not found: {0}")]
    RecordNotFound(String),

    #[error("invalid transition from {from} to {to} for task {id}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("execution backend error: {0}")]
    Backend(String),

    #[error("session source error: {0}")]
    SessionSource(String),

    #[error("remediation of '{queue}' failed: {reason}")]
    RemediationFailure { queue: String, reason: String },

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MatchdayError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend(_) | Self::Backend(_))
    }
}

pub type Result<T> = std::result::Result<T, MatchdayError>;
