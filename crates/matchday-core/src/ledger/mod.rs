//! Scheduling ledger: the durable record of intended work.
//!
//! Provides `ScheduledTaskRecord`, `WorkType`, `TaskState` and the
//! redb-backed `Ledger` with its named transition operations.

pub mod db;
pub mod record;

pub use db::Ledger;
pub use record::{ScheduledTaskRecord, TaskState, WorkType, MAX_ERROR_LEN};
