use std::collections::BTreeMap;

use crate::client::Client;
use crate::output::{print_json, print_table};
use matchday_core::reconcile::{ReconciliationReport, Repair};

pub fn run(client: &Client, match_id: Option<i64>, json: bool) -> anyhow::Result<()> {
    let reports: BTreeMap<i64, ReconciliationReport> = match match_id {
        Some(id) => {
            let report: ReconciliationReport = client.post(&format!("/api/reconcile/{id}"), None)?;
            BTreeMap::from([(id, report)])
        }
        None => client.post("/api/reconcile", None)?,
    };
    if json {
        return print_json(&reports);
    }
    if reports.is_empty() {
        println!("No active work to reconcile.");
        return Ok(());
    }

    let rows = reports
        .values()
        .flat_map(|r| {
            r.records.iter().map(move |c| {
                vec![
                    r.subject_id.to_string(),
                    c.work_type.to_string(),
                    c.status
                        .map(|s| format!("{s:?}").to_lowercase())
                        .unwrap_or_else(|| "-".to_string()),
                    repair_label(&c.repair),
                ]
            })
        })
        .collect();
    print_table(&["MATCH", "WORK", "BACKEND", "REPAIR"], rows);

    let repaired: usize = reports.values().map(|r| r.repaired).sum();
    let overdue: usize = reports.values().map(|r| r.overdue).sum();
    println!("\n{repaired} record(s) repaired, {overdue} overdue.");
    Ok(())
}

fn repair_label(repair: &Repair) -> String {
    match repair {
        Repair::InSync => "in sync".to_string(),
        Repair::MarkedRunning => "marked running".to_string(),
        Repair::MarkedCompleted => "marked completed".to_string(),
        Repair::Expired => "expired".to_string(),
        Repair::Resubmitted { handle, .. } => format!("resubmitted as {handle}"),
        Repair::Failed { error } => format!("failed: {error}"),
    }
}
