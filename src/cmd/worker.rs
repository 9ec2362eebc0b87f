//! Worker processes: `ticketflow worker` and `ticketflow poll-worker`.

use std::sync::Arc;

use anyhow::Result;

use ticketflow::config::FlowConfig;
use ticketflow::dispatch::{CommandWorkerHandler, WorkerPool};
use ticketflow::scheduler::{shutdown_channel, supervise};
use ticketflow::sdk::{PollClient, PollWorker};

use super::{broker_manager, stop_on_ctrl_c};

fn handler(config: &FlowConfig, command: Option<String>) -> Arc<CommandWorkerHandler> {
    let mut handler = CommandWorkerHandler::new(
        command.unwrap_or_else(|| config.worker.command.clone()),
        config.worker.args.clone(),
    );
    if let Some(timeout) = config.worker.timeout() {
        handler = handler.with_timeout(timeout);
    }
    Arc::new(handler)
}

pub async fn cmd_worker(config: &FlowConfig, command: Option<String>, prefetch: Option<u16>) -> Result<()> {
    let manager = broker_manager(config, "ticketflow-worker");
    let pool = Arc::new(WorkerPool::new(
        manager.clone(),
        handler(config, command),
        prefetch.unwrap_or(config.worker.prefetch),
    ));
    println!("Worker {} consuming worker-tasks (Ctrl+C to stop)", pool.worker_id());

    let (tx, rx) = shutdown_channel();
    stop_on_ctrl_c(tx);
    supervise("worker-tasks", rx, move || {
        let pool = pool.clone();
        async move { pool.run().await }
    })
    .await;

    manager.close().await?;
    Ok(())
}

pub async fn cmd_poll_worker(
    config: &FlowConfig,
    server: &str,
    token: &str,
    command: Option<String>,
) -> Result<()> {
    let worker = PollWorker::new(PollClient::new(server, token), handler(config, command))
        .with_poll_interval(config.poll.poll_interval())
        .with_heartbeat_interval(config.poll.heartbeat_interval());

    let (tx, rx) = shutdown_channel();
    stop_on_ctrl_c(tx);
    let processed = worker.run(rx).await?;
    println!("Poll worker stopped after {} task(s)", processed);
    Ok(())
}
