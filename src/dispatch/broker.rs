use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::errors::DispatchError;
use crate::models::WorkerMode;
use crate::queue::messages::WorkerTaskMessage;
use crate::queue::{BrokerManager, QueueName};

use super::TaskDispatch;

/// Publishes sessions to `worker-tasks` for broker-mode workers.
#[derive(Clone)]
pub struct BrokerDispatcher {
    manager: Arc<BrokerManager>,
}

impl BrokerDispatcher {
    pub fn new(manager: Arc<BrokerManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl TaskDispatch for BrokerDispatcher {
    fn mode(&self) -> WorkerMode {
        WorkerMode::Broker
    }

    async fn dispatch(&self, message: &WorkerTaskMessage) -> Result<(), DispatchError> {
        self.manager
            .publish_json(
                QueueName::WorkerTasks,
                message,
                Some(message.correlation_id.as_str()),
            )
            .await?;
        info!(
            task_id = message.context.task.id,
            session_id = %message.session_id,
            task_type = %message.task_type,
            "dispatched to broker workers"
        );
        Ok(())
    }
}
