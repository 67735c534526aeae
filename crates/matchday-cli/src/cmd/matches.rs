use chrono::{DateTime, Utc};

use crate::client::Client;
use crate::output::{or_dash, print_json, print_table};
use matchday_core::ledger::ScheduledTaskRecord;
use matchday_core::scheduler::ScheduledEntry;

// ---------------------------------------------------------------------------
// schedule
// ---------------------------------------------------------------------------

pub fn schedule(client: &Client, match_id: i64, kickoff: DateTime<Utc>, json: bool) -> anyhow::Result<()> {
    let entries: Vec<ScheduledEntry> = client.post(
        &format!("/api/matches/{match_id}/schedule"),
        Some(serde_json::json!({ "kickoff": kickoff })),
    )?;
    if json {
        return print_json(&entries);
    }

    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.work_type.to_string(),
                e.scheduled_time.to_rfc3339(),
                or_dash(e.handle.as_ref()),
                e.skipped.clone().unwrap_or_else(|| "submitted".to_string()),
            ]
        })
        .collect();
    print_table(&["WORK", "AT", "HANDLE", "RESULT"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// pause / resume / tasks
// ---------------------------------------------------------------------------

pub fn pause(client: &Client, match_id: i64, json: bool) -> anyhow::Result<()> {
    let records: Vec<ScheduledTaskRecord> =
        client.post(&format!("/api/matches/{match_id}/pause"), None)?;
    render(&records, json, "Nothing to pause.")
}

pub fn resume(client: &Client, match_id: i64, json: bool) -> anyhow::Result<()> {
    let records: Vec<ScheduledTaskRecord> =
        client.post(&format!("/api/matches/{match_id}/resume"), None)?;
    render(&records, json, "Nothing to resume.")
}

pub fn tasks(client: &Client, match_id: i64, json: bool) -> anyhow::Result<()> {
    let records: Vec<ScheduledTaskRecord> = client.get(&format!("/api/matches/{match_id}/tasks"))?;
    render(&records, json, "No scheduled work for this match.")
}

fn render(records: &[ScheduledTaskRecord], json: bool, empty: &str) -> anyhow::Result<()> {
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("{empty}");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.work_type.to_string(),
                r.state.to_string(),
                r.scheduled_time.to_rfc3339(),
                or_dash(r.external_handle.as_ref()),
                r.retry_count.to_string(),
                or_dash(r.last_error.as_deref()),
            ]
        })
        .collect();
    print_table(
        &["ID", "WORK", "STATE", "SCHEDULED", "HANDLE", "RETRIES", "LAST ERROR"],
        rows,
    );
    Ok(())
}
