//! Persistent storage for the scheduling ledger using redb.
//!
//! # Table design
//!
//! ```text
//! scheduled_tasks : id (uuid string)              -> JSON ScheduledTaskRecord
//! active_index    : "<subject>:<work_type>"       -> id
//! due_index       : [ scheduled_ms BE (8) | uuid (16) ] -> id
//! ```
//!
//! `active_index` is the uniqueness constraint over records that hold a
//! (subject, work-type) slot (Scheduled, Running, Paused). Every
//! check-then-insert runs inside a single write transaction; redb admits one
//! writer at a time, so two racing `create_if_absent` calls cannot both
//! insert.
//!
//! `due_index` only contains Scheduled records. Because the timestamp
//! occupies the high bytes in big-endian order, a range scan up to
//! `due_upper_bound(now)` returns exactly the records due by `now`.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::backend::TaskHandle;
use crate::error::{MatchdayError, Result};

use super::record::{truncate_error, ScheduledTaskRecord, TaskState, WorkType};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("scheduled_tasks");
const ACTIVE: TableDefinition<&str, &str> = TableDefinition::new("active_index");
const DUE: TableDefinition<&[u8], &str> = TableDefinition::new("due_index");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn slot_key(subject_id: i64, work_type: WorkType) -> String {
    format!("{subject_id}:{}", work_type.as_str())
}

fn due_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = now.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn ledger_err(e: impl std::fmt::Display) -> MatchdayError {
    MatchdayError::Ledger(e.to_string())
}

fn load<T>(table: &T, id: &str) -> Result<Option<ScheduledTaskRecord>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id).map_err(ledger_err)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Durable store of scheduling intent.
pub struct Ledger {
    db: Database,
}

impl Ledger {
    /// Open or create the ledger database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(ledger_err)?;
        let wt = db.begin_write().map_err(ledger_err)?;
        wt.open_table(TASKS).map_err(ledger_err)?;
        wt.open_table(ACTIVE).map_err(ledger_err)?;
        wt.open_table(DUE).map_err(ledger_err)?;
        wt.commit().map_err(ledger_err)?;
        Ok(Self { db })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<ScheduledTaskRecord>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let tasks = rt.open_table(TASKS).map_err(ledger_err)?;
        load(&tasks, &id.to_string())
    }

    /// The Scheduled or Running record for `(subject_id, work_type)`, if any.
    pub fn find_active(
        &self,
        subject_id: i64,
        work_type: WorkType,
    ) -> Result<Option<ScheduledTaskRecord>> {
        Ok(self
            .find_slot_holder(subject_id, work_type)?
            .filter(|r| r.state.is_active()))
    }

    fn find_slot_holder(
        &self,
        subject_id: i64,
        work_type: WorkType,
    ) -> Result<Option<ScheduledTaskRecord>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let active = rt.open_table(ACTIVE).map_err(ledger_err)?;
        let tasks = rt.open_table(TASKS).map_err(ledger_err)?;
        let id = active
            .get(slot_key(subject_id, work_type).as_str())
            .map_err(ledger_err)?
            .map(|g| g.value().to_string());
        match id {
            Some(id) => Ok(load(&tasks, &id)?.filter(|r| r.state.holds_slot())),
            None => Ok(None),
        }
    }

    /// Return the record currently holding the `(subject_id, work_type)` slot
    /// unchanged, or insert a new Scheduled record.
    ///
    /// This is the only way records are created. Calling it again for a
    /// subject that already has a live record is a no-op, not an error.
    pub fn create_if_absent(
        &self,
        subject_id: i64,
        work_type: WorkType,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledTaskRecord> {
        let slot = slot_key(subject_id, work_type);
        let wt = self.db.begin_write().map_err(ledger_err)?;
        let (record, created) = {
            let mut tasks = wt.open_table(TASKS).map_err(ledger_err)?;
            let mut active = wt.open_table(ACTIVE).map_err(ledger_err)?;
            let mut due = wt.open_table(DUE).map_err(ledger_err)?;

            let holder_id = active
                .get(slot.as_str())
                .map_err(ledger_err)?
                .map(|g| g.value().to_string());
            let holder = match holder_id {
                Some(id) => load(&tasks, &id)?.filter(|r| r.state.holds_slot()),
                None => None,
            };

            match holder {
                Some(existing) => (existing, false),
                None => {
                    let record = ScheduledTaskRecord::new(subject_id, work_type, scheduled_time);
                    let id = record.id.to_string();
                    let value = serde_json::to_vec(&record)?;
                    tasks
                        .insert(id.as_str(), value.as_slice())
                        .map_err(ledger_err)?;
                    active
                        .insert(slot.as_str(), id.as_str())
                        .map_err(ledger_err)?;
                    due.insert(
                        due_key(record.scheduled_time, record.id).as_slice(),
                        id.as_str(),
                    )
                    .map_err(ledger_err)?;
                    (record, true)
                }
            }
        };
        wt.commit().map_err(ledger_err)?;

        if created {
            tracing::info!(
                id = %record.id,
                subject_id,
                work_type = %work_type,
                scheduled_time = %record.scheduled_time,
                "ledger: scheduled task created"
            );
        } else {
            tracing::debug!(
                id = %record.id,
                subject_id,
                work_type = %work_type,
                state = %record.state,
                "ledger: existing record returned"
            );
        }
        Ok(record)
    }

    /// Scheduled records whose `scheduled_time <= now`, oldest first,
    /// optionally restricted to one work type.
    pub fn get_pending(
        &self,
        now: DateTime<Utc>,
        work_type: Option<WorkType>,
    ) -> Result<Vec<ScheduledTaskRecord>> {
        let upper = due_upper_bound(now);
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let due = rt.open_table(DUE).map_err(ledger_err)?;
        let tasks = rt.open_table(TASKS).map_err(ledger_err)?;

        let mut result = Vec::new();
        for entry in due.range(..=upper.as_slice()).map_err(ledger_err)? {
            let (_, id) = entry.map_err(ledger_err)?;
            let Some(record) = load(&tasks, id.value())? else {
                continue;
            };
            if record.state != TaskState::Scheduled {
                continue;
            }
            if work_type.is_some_and(|wt| wt != record.work_type) {
                continue;
            }
            result.push(record);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Record the handle of freshly submitted work without changing state.
    pub fn attach_handle(&self, id: Uuid, handle: TaskHandle) -> Result<ScheduledTaskRecord> {
        self.transition(id, &[TaskState::Scheduled, TaskState::Running], None, |r| {
            r.external_handle = Some(handle);
        })
    }

    pub fn mark_running(
        &self,
        id: Uuid,
        handle: Option<TaskHandle>,
    ) -> Result<ScheduledTaskRecord> {
        self.transition(
            id,
            &[TaskState::Scheduled, TaskState::Running],
            Some(TaskState::Running),
            |r| {
                if handle.is_some() {
                    r.external_handle = handle;
                }
                r.execution_time = Some(Utc::now());
            },
        )
    }

    pub fn mark_completed(&self, id: Uuid) -> Result<ScheduledTaskRecord> {
        self.transition(
            id,
            &[TaskState::Scheduled, TaskState::Running],
            Some(TaskState::Completed),
            |r| {
                r.completion_time = Some(Utc::now());
            },
        )
    }

    /// Terminal failure. Increments `retry_count` and keeps a truncated copy
    /// of `error`.
    pub fn mark_failed(&self, id: Uuid, error: &str) -> Result<ScheduledTaskRecord> {
        self.transition(
            id,
            &[TaskState::Scheduled, TaskState::Running],
            Some(TaskState::Failed),
            |r| {
                r.retry_count += 1;
                r.last_error = Some(truncate_error(error));
                r.completion_time = Some(Utc::now());
            },
        )
    }

    pub fn mark_expired(&self, id: Uuid) -> Result<ScheduledTaskRecord> {
        self.transition(
            id,
            &[TaskState::Scheduled, TaskState::Running, TaskState::Paused],
            Some(TaskState::Expired),
            |_| {},
        )
    }

    /// Snapshot the live handle into `paused_external_handle` and clear it.
    /// The caller revokes the work with the snapshotted handle.
    pub fn mark_paused(&self, id: Uuid) -> Result<ScheduledTaskRecord> {
        self.transition(
            id,
            &[TaskState::Scheduled, TaskState::Running],
            Some(TaskState::Paused),
            |r| {
                r.paused_external_handle = r.external_handle.take();
            },
        )
    }

    pub fn mark_resumed(&self, id: Uuid, new_handle: TaskHandle) -> Result<ScheduledTaskRecord> {
        self.transition(
            id,
            &[TaskState::Paused],
            Some(TaskState::Scheduled),
            |r| {
                r.external_handle = Some(new_handle);
                r.paused_external_handle = None;
            },
        )
    }

    /// Replace the handle of an active record after its work was lost or
    /// failed, returning it to Scheduled. A reported error bumps
    /// `retry_count`.
    pub fn reschedule(
        &self,
        id: Uuid,
        new_handle: TaskHandle,
        error: Option<&str>,
    ) -> Result<ScheduledTaskRecord> {
        self.transition(
            id,
            &[TaskState::Scheduled, TaskState::Running],
            Some(TaskState::Scheduled),
            |r| {
                r.external_handle = Some(new_handle);
                r.execution_time = None;
                if let Some(error) = error {
                    r.retry_count += 1;
                    r.last_error = Some(truncate_error(error));
                }
            },
        )
    }

    /// Load, validate, mutate and store one record, keeping both indexes in
    /// step, all inside one write transaction.
    fn transition(
        &self,
        id: Uuid,
        allowed: &[TaskState],
        to: Option<TaskState>,
        mutate: impl FnOnce(&mut ScheduledTaskRecord),
    ) -> Result<ScheduledTaskRecord> {
        let id_str = id.to_string();
        let wt = self.db.begin_write().map_err(ledger_err)?;
        let record = {
            let mut tasks = wt.open_table(TASKS).map_err(ledger_err)?;
            let mut active = wt.open_table(ACTIVE).map_err(ledger_err)?;
            let mut due = wt.open_table(DUE).map_err(ledger_err)?;

            let mut record =
                load(&tasks, &id_str)?.ok_or_else(|| MatchdayError::RecordNotFound(id_str.clone()))?;
            let from = record.state;
            if !allowed.contains(&from) {
                return Err(MatchdayError::InvalidTransition {
                    id: id_str,
                    from: from.to_string(),
                    to: to.map_or_else(|| "handle update".to_string(), |s| s.to_string()),
                });
            }

            mutate(&mut record);
            if let Some(to) = to {
                record.state = to;
            }
            record.updated_at = Utc::now();

            if from.holds_slot() && !record.state.holds_slot() {
                let slot = slot_key(record.subject_id, record.work_type);
                let points_here = active
                    .get(slot.as_str())
                    .map_err(ledger_err)?
                    .is_some_and(|g| g.value() == id_str);
                if points_here {
                    active.remove(slot.as_str()).map_err(ledger_err)?;
                }
            }
            if from == TaskState::Scheduled {
                due.remove(due_key(record.scheduled_time, record.id).as_slice())
                    .map_err(ledger_err)?;
            }
            if record.state == TaskState::Scheduled {
                due.insert(
                    due_key(record.scheduled_time, record.id).as_slice(),
                    id_str.as_str(),
                )
                .map_err(ledger_err)?;
            }

            let value = serde_json::to_vec(&record)?;
            tasks
                .insert(id_str.as_str(), value.as_slice())
                .map_err(ledger_err)?;
            record
        };
        wt.commit().map_err(ledger_err)?;

        tracing::debug!(
            id = %record.id,
            subject_id = record.subject_id,
            work_type = %record.work_type,
            state = %record.state,
            "ledger: transition"
        );
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    /// All records, ordered by scheduled time ascending.
    pub fn list_all(&self) -> Result<Vec<ScheduledTaskRecord>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let tasks = rt.open_table(TASKS).map_err(ledger_err)?;
        let mut result = Vec::new();
        for entry in tasks.iter().map_err(ledger_err)? {
            let (_, v) = entry.map_err(ledger_err)?;
            let record: ScheduledTaskRecord = serde_json::from_slice(v.value())?;
            result.push(record);
        }
        result.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time));
        Ok(result)
    }

    /// Every Scheduled or Running record.
    pub fn list_active(&self) -> Result<Vec<ScheduledTaskRecord>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let active = rt.open_table(ACTIVE).map_err(ledger_err)?;
        let tasks = rt.open_table(TASKS).map_err(ledger_err)?;
        let mut result = Vec::new();
        for entry in active.iter().map_err(ledger_err)? {
            let (_, id) = entry.map_err(ledger_err)?;
            if let Some(record) = load(&tasks, id.value())? {
                if record.state.is_active() {
                    result.push(record);
                }
            }
        }
        result.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time));
        Ok(result)
    }

    pub fn list_for_subject(&self, subject_id: i64) -> Result<Vec<ScheduledTaskRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|r| r.subject_id == subject_id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as CDur;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, Ledger) {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&dir.path().join("ledger.redb")).unwrap();
        (dir, ledger)
    }

    #[test]
    fn create_if_absent_is_idempotent_while_active() {
        let (_dir, ledger) = open_tmp();
        let t = Utc::now() + CDur::hours(1);
        let first = ledger.create_if_absent(7, WorkType::ThreadCreation, t).unwrap();
        let second = ledger
            .create_if_absent(7, WorkType::ThreadCreation, t + CDur::hours(3))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.scheduled_time, first.scheduled_time);

        ledger.mark_running(first.id, None).unwrap();
        let third = ledger.create_if_absent(7, WorkType::ThreadCreation, t).unwrap();
        assert_eq!(third.id, first.id);
        assert_eq!(ledger.list_all().unwrap().len(), 1);
    }

    #[test]
    fn different_work_types_get_separate_records() {
        let (_dir, ledger) = open_tmp();
        let t = Utc::now();
        let a = ledger.create_if_absent(7, WorkType::ThreadCreation, t).unwrap();
        let b = ledger
            .create_if_absent(7, WorkType::LiveReportingStart, t)
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn terminal_state_frees_the_slot() {
        let (_dir, ledger) = open_tmp();
        let t = Utc::now();
        let first = ledger.create_if_absent(3, WorkType::ThreadCreation, t).unwrap();
        ledger.mark_completed(first.id).unwrap();
        assert!(ledger.find_active(3, WorkType::ThreadCreation).unwrap().is_none());

        let second = ledger.create_if_absent(3, WorkType::ThreadCreation, t).unwrap();
        assert_ne!(first.id, second.id);
        // Terminal records are retained.
        assert_eq!(ledger.list_for_subject(3).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_create_if_absent_yields_one_row() {
        let (_dir, ledger) = open_tmp();
        let ledger = Arc::new(ledger);
        let t = Utc::now() + CDur::minutes(30);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger
                        .create_if_absent(7, WorkType::LiveReportingStart, t)
                        .unwrap()
                        .id
                })
            })
            .collect();
        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(ledger.list_all().unwrap().len(), 1);
    }

    #[test]
    fn get_pending_includes_overdue_scheduled_records() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        let overdue = ledger
            .create_if_absent(42, WorkType::ThreadCreation, now - CDur::minutes(5))
            .unwrap();
        ledger
            .create_if_absent(43, WorkType::ThreadCreation, now + CDur::minutes(5))
            .unwrap();

        let pending = ledger.get_pending(now, None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, overdue.id);
        assert_eq!(pending[0].subject_id, 42);
    }

    #[test]
    fn get_pending_filters_work_type_and_state() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        let thread = ledger
            .create_if_absent(1, WorkType::ThreadCreation, now - CDur::minutes(1))
            .unwrap();
        let live = ledger
            .create_if_absent(1, WorkType::LiveReportingStart, now - CDur::minutes(2))
            .unwrap();

        let only_live = ledger
            .get_pending(now, Some(WorkType::LiveReportingStart))
            .unwrap();
        assert_eq!(only_live.len(), 1);
        assert_eq!(only_live[0].id, live.id);

        ledger.mark_running(thread.id, None).unwrap();
        let all = ledger.get_pending(now, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, live.id);
    }

    #[test]
    fn pending_results_are_ordered_by_scheduled_time() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        ledger
            .create_if_absent(2, WorkType::ThreadCreation, now - CDur::minutes(1))
            .unwrap();
        ledger
            .create_if_absent(1, WorkType::ThreadCreation, now - CDur::minutes(10))
            .unwrap();
        let pending = ledger.get_pending(now, None).unwrap();
        assert_eq!(pending[0].subject_id, 1);
        assert_eq!(pending[1].subject_id, 2);
    }

    #[test]
    fn pause_then_resume_swaps_handles() {
        let (_dir, ledger) = open_tmp();
        let record = ledger
            .create_if_absent(5, WorkType::LiveReportingStart, Utc::now() + CDur::hours(2))
            .unwrap();
        ledger
            .attach_handle(record.id, TaskHandle::new("old-handle"))
            .unwrap();

        let paused = ledger.mark_paused(record.id).unwrap();
        assert_eq!(paused.state, TaskState::Paused);
        assert_eq!(paused.external_handle, None);
        assert_eq!(
            paused.paused_external_handle,
            Some(TaskHandle::new("old-handle"))
        );
        // Still retrievable until resumption.
        let reloaded = ledger.get(record.id).unwrap().unwrap();
        assert_eq!(
            reloaded.paused_external_handle,
            Some(TaskHandle::new("old-handle"))
        );
        assert!(ledger.find_active(5, WorkType::LiveReportingStart).unwrap().is_none());

        let resumed = ledger
            .mark_resumed(record.id, TaskHandle::new("new-handle"))
            .unwrap();
        assert_eq!(resumed.state, TaskState::Scheduled);
        assert_eq!(resumed.external_handle, Some(TaskHandle::new("new-handle")));
        assert_ne!(resumed.external_handle, paused.paused_external_handle);
        assert_eq!(resumed.paused_external_handle, None);
    }

    #[test]
    fn paused_record_keeps_its_slot() {
        let (_dir, ledger) = open_tmp();
        let t = Utc::now() + CDur::hours(2);
        let record = ledger.create_if_absent(5, WorkType::ThreadCreation, t).unwrap();
        ledger.mark_paused(record.id).unwrap();

        let again = ledger.create_if_absent(5, WorkType::ThreadCreation, t).unwrap();
        assert_eq!(again.id, record.id);
        assert_eq!(again.state, TaskState::Paused);
        assert_eq!(ledger.list_all().unwrap().len(), 1);
    }

    #[test]
    fn mark_failed_counts_and_truncates() {
        let (_dir, ledger) = open_tmp();
        let record = ledger
            .create_if_absent(8, WorkType::ThreadCreation, Utc::now())
            .unwrap();
        let long = "x".repeat(2_000);
        let failed = ledger.mark_failed(record.id, &long).unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.unwrap().len(), super::super::record::MAX_ERROR_LEN);
    }

    #[test]
    fn reschedule_keeps_record_active_with_new_handle() {
        let (_dir, ledger) = open_tmp();
        let record = ledger
            .create_if_absent(8, WorkType::ThreadCreation, Utc::now() - CDur::minutes(1))
            .unwrap();
        ledger.mark_running(record.id, Some(TaskHandle::new("h1"))).unwrap();
        let rescheduled = ledger
            .reschedule(record.id, TaskHandle::new("h2"), Some("worker lost"))
            .unwrap();
        assert_eq!(rescheduled.state, TaskState::Scheduled);
        assert_eq!(rescheduled.retry_count, 1);
        assert_eq!(rescheduled.external_handle, Some(TaskHandle::new("h2")));
        assert_eq!(ledger.get_pending(Utc::now(), None).unwrap().len(), 1);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let (_dir, ledger) = open_tmp();
        let record = ledger
            .create_if_absent(9, WorkType::ThreadCreation, Utc::now())
            .unwrap();
        let err = ledger
            .mark_resumed(record.id, TaskHandle::new("h"))
            .unwrap_err();
        assert!(matches!(err, MatchdayError::InvalidTransition { .. }));

        ledger.mark_completed(record.id).unwrap();
        assert!(ledger.mark_running(record.id, None).is_err());
        assert!(ledger.mark_paused(record.id).is_err());
    }

    #[test]
    fn unknown_record_is_not_found() {
        let (_dir, ledger) = open_tmp();
        let err = ledger.mark_completed(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, MatchdayError::RecordNotFound(_)));
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.redb");
        let id = {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .create_if_absent(11, WorkType::ThreadCreation, Utc::now())
                .unwrap()
                .id
        };
        let ledger = Ledger::open(&path).unwrap();
        let found = ledger.find_active(11, WorkType::ThreadCreation).unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[test]
    fn list_active_excludes_terminal_and_paused() {
        let (_dir, ledger) = open_tmp();
        let t = Utc::now();
        let a = ledger.create_if_absent(1, WorkType::ThreadCreation, t).unwrap();
        let b = ledger.create_if_absent(2, WorkType::ThreadCreation, t).unwrap();
        let c = ledger.create_if_absent(3, WorkType::ThreadCreation, t).unwrap();
        ledger.mark_completed(b.id).unwrap();
        ledger.mark_paused(c.id).unwrap();
        let active = ledger.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }
}
