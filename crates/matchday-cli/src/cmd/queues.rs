use crate::client::Client;
use crate::output::{print_json, print_table};
use matchday_core::queue_health::QueueHealthReport;

pub fn run(client: &Client, json: bool) -> anyhow::Result<()> {
    let report: QueueHealthReport = client.get("/health/queues")?;
    if json {
        return print_json(&report);
    }

    let rows = report
        .queues
        .iter()
        .map(|q| vec![q.name.to_string(), q.depth.to_string(), q.tier.to_string()])
        .collect();
    print_table(&["QUEUE", "DEPTH", "TIER"], rows);

    for q in &report.unreadable {
        println!("{q}: depth unreadable");
    }
    if !report.actions.is_empty() {
        println!();
        let rows = report
            .actions
            .iter()
            .map(|a| {
                vec![
                    a.kind.to_string(),
                    a.target.clone(),
                    a.before.to_string(),
                    a.after.to_string(),
                    a.failures.to_string(),
                ]
            })
            .collect();
        print_table(&["ACTION", "QUEUE", "BEFORE", "AFTER", "FAILURES"], rows);
    }
    Ok(())
}
