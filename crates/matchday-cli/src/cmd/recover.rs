use crate::client::Client;
use crate::output::{or_dash, print_json, print_table};
use matchday_core::recovery::RecoveryReport;

pub fn run(client: &Client, json: bool) -> anyhow::Result<()> {
    let report: RecoveryReport = client.post("/api/recover", None)?;
    if json {
        return print_json(&report);
    }

    if !report.emergency_triggered {
        println!(
            "No emergency: {} queued tasks, nothing removed.",
            report.before_total
        );
        return Ok(());
    }

    println!(
        "Emergency recovery ran: {} -> {} queued tasks ({} removed).",
        report.before_total, report.after_total, report.tasks_removed
    );
    let rows = report
        .actions
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                s.cleared.to_string(),
                s.failures.to_string(),
                or_dash(s.error.as_deref()),
            ]
        })
        .collect();
    print_table(&["STEP", "CLEARED", "FAILURES", "ERROR"], rows);
    Ok(())
}
