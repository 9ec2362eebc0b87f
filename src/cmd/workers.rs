//! Poll worker registration: `ticketflow register-worker`.

use anyhow::Result;

use ticketflow::config::FlowConfig;
use ticketflow::dispatch::poll::register_worker;
use ticketflow::models::TaskType;

use super::open_db;

pub async fn cmd_register_worker(
    config: &FlowConfig,
    name: &str,
    capabilities: Vec<TaskType>,
) -> Result<()> {
    if capabilities.is_empty() {
        anyhow::bail!("A worker needs at least one capability");
    }
    let db = open_db(config)?;
    let (worker, token) = register_worker(&db, name, capabilities).await?;
    let caps: Vec<&str> = worker.capabilities.iter().map(|c| c.as_str()).collect();
    println!("Registered worker {} ({}) for {}", worker.id, worker.name, caps.join(", "));
    println!();
    println!("Token (shown once): {}", token);
    Ok(())
}
