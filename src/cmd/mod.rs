//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                            |
//! |-----------|-------------------------------------------------------------|
//! | `serve`   | `Serve`                                                     |
//! | `worker`  | `Worker`, `PollWorker`                                      |
//! | `source`  | `AddSource`, `Sync`, `Enqueue`, `Tasks`, `Recover`, `InitDb` |
//! | `workers` | `RegisterWorker`                                            |
//! | `config`  | `Config`                                                    |

pub mod config;
pub mod serve;
pub mod source;
pub mod worker;
pub mod workers;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use source::{cmd_add_source, cmd_enqueue, cmd_init_db, cmd_recover, cmd_sync, cmd_tasks};
pub use worker::{cmd_poll_worker, cmd_worker};
pub use workers::cmd_register_worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use ticketflow::config::FlowConfig;
use ticketflow::models::TaskSource;
use ticketflow::queue::amqp::AmqpTransport;
use ticketflow::queue::{BrokerManager, Topology};
use ticketflow::store::DbHandle;

/// Open the configured database, creating its directory if needed.
pub fn open_db(config: &FlowConfig) -> Result<DbHandle> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    DbHandle::open(path).with_context(|| format!("Failed to open database {}", path.display()))
}

/// Broker manager over AMQP. Nothing connects until first use.
pub fn broker_manager(config: &FlowConfig, connection_name: &str) -> Arc<BrokerManager> {
    let transport = AmqpTransport::new(&config.broker.url, connection_name);
    Arc::new(BrokerManager::new(
        Arc::new(transport),
        Topology::from_config(&config.queues),
    ))
}

/// Look a source up by id, falling back to its name.
pub async fn resolve_source(db: &DbHandle, key: &str) -> Result<TaskSource> {
    let lookup = key.to_string();
    let found = db
        .call(move |db| match lookup.parse::<i64>() {
            Ok(id) => db.get_task_source(id),
            Err(_) => db.find_task_source_by_name(&lookup),
        })
        .await?;
    found.with_context(|| format!("Task source '{}' not found", key))
}

/// Flip `tx` on Ctrl+C.
pub fn stop_on_ctrl_c(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            let _ = tx.send(true);
        }
    });
}
