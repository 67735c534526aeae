pub mod admission;
pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod lease;
pub mod ledger;
pub mod orchestrator;
pub mod queue;
pub mod queue_health;
pub mod reconcile;
pub mod recovery;
pub mod remediation;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod store;

pub use error::{MatchdayError, Result};
