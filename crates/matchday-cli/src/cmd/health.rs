use crate::client::Client;
use crate::output::{print_json, print_table};
use matchday_core::health::CombinedHealth;

pub fn run(client: &Client, json: bool) -> anyhow::Result<()> {
    let health: CombinedHealth = client.get("/health/combined")?;
    if json {
        return print_json(&health);
    }

    println!("status:  {}", health.status);
    println!("broker:  {}", if health.broker_reachable { "reachable" } else { "unreachable" });
    println!("queues:  worst tier {}", health.worst_queue_tier);
    println!("circuit: {}", health.circuit_state);
    if !health.reasons.is_empty() {
        println!();
        let rows = health.reasons.iter().map(|r| vec![r.clone()]).collect();
        print_table(&["REASON"], rows);
    }
    Ok(())
}
