use crate::config::QueuesSection;
use crate::errors::QueueError;

use super::{BrokerChannel, QueueArguments};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    TaskSync,
    TaskEval,
    TaskImpl,
    WorkerTasks,
    WorkerResponses,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::TaskSync,
        QueueName::TaskEval,
        QueueName::TaskImpl,
        QueueName::WorkerTasks,
        QueueName::WorkerResponses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskSync => "task-sync",
            Self::TaskEval => "task-eval",
            Self::TaskImpl => "task-impl",
            Self::WorkerTasks => "worker-tasks",
            Self::WorkerResponses => "worker-responses",
        }
    }

    /// worker-responses has no dead-letter pair.
    pub fn has_dead_letter(&self) -> bool {
        !matches!(self, Self::WorkerResponses)
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.as_str())
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.as_str())
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration-time policy for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub message_ttl_ms: Option<u64>,
    pub max_retries: u32,
}

/// The full set of queues, dead-letter exchanges and dead-letter queues.
#[derive(Debug, Clone)]
pub struct Topology {
    sync_ttl_ms: u64,
    task_ttl_ms: u64,
    worker_ttl_ms: u64,
    max_retries: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&QueuesSection::default())
    }
}

impl Topology {
    pub fn from_config(queues: &QueuesSection) -> Self {
        Self {
            sync_ttl_ms: queues.sync_ttl_ms,
            task_ttl_ms: queues.task_ttl_ms,
            worker_ttl_ms: queues.worker_ttl_ms,
            max_retries: queues.max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn policy(&self, queue: QueueName) -> QueuePolicy {
        let message_ttl_ms = match queue {
            QueueName::TaskSync => Some(self.sync_ttl_ms),
            QueueName::TaskEval | QueueName::TaskImpl => Some(self.task_ttl_ms),
            QueueName::WorkerTasks => Some(self.worker_ttl_ms),
            QueueName::WorkerResponses => None,
        };
        QueuePolicy {
            message_ttl_ms,
            max_retries: self.max_retries,
        }
    }

    pub fn arguments(&self, queue: QueueName) -> QueueArguments {
        if !queue.has_dead_letter() {
            return QueueArguments::default();
        }
        QueueArguments {
            dead_letter_exchange: Some(queue.dead_letter_exchange()),
            dead_letter_routing_key: Some(queue.as_str().to_string()),
            message_ttl_ms: self.policy(queue).message_ttl_ms,
        }
    }

    /// Declare every exchange, queue and binding. Idempotent.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), QueueError> {
        for queue in QueueName::ALL {
            if queue.has_dead_letter() {
                let dlx = queue.dead_letter_exchange();
                let dlq = queue.dead_letter_queue();
                channel.declare_exchange(&dlx).await?;
                channel
                    .declare_queue(&dlq, &QueueArguments::default())
                    .await?;
                channel.bind_queue(&dlq, &dlx, queue.as_str()).await?;
            }
            channel
                .declare_queue(queue.as_str(), &self.arguments(queue))
                .await?;
        }
        tracing::debug!(queues = QueueName::ALL.len(), "broker topology declared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;
    use crate::queue::Transport;

    #[test]
    fn test_dead_letter_names() {
        assert_eq!(QueueName::TaskEval.dead_letter_exchange(), "task-eval.dlx");
        assert_eq!(QueueName::TaskEval.dead_letter_queue(), "task-eval.dlq");
        assert!(!QueueName::WorkerResponses.has_dead_letter());
    }

    #[test]
    fn test_policy_ttl_per_class() {
        let topology = Topology::from_config(&QueuesSection {
            max_retries: 5,
            sync_ttl_ms: 1,
            task_ttl_ms: 2,
            worker_ttl_ms: 3,
            prefetch: 1,
        });
        assert_eq!(topology.policy(QueueName::TaskSync).message_ttl_ms, Some(1));
        assert_eq!(topology.policy(QueueName::TaskImpl).message_ttl_ms, Some(2));
        assert_eq!(topology.policy(QueueName::WorkerTasks).message_ttl_ms, Some(3));
        assert_eq!(topology.policy(QueueName::WorkerResponses).message_ttl_ms, None);
        assert_eq!(topology.policy(QueueName::TaskSync).max_retries, 5);
    }

    #[test]
    fn test_arguments_route_to_own_dlx() {
        let args = Topology::default().arguments(QueueName::TaskSync);
        assert_eq!(args.dead_letter_exchange.as_deref(), Some("task-sync.dlx"));
        assert_eq!(args.dead_letter_routing_key.as_deref(), Some("task-sync"));
        assert_eq!(
            Topology::default().arguments(QueueName::WorkerResponses),
            QueueArguments::default()
        );
    }

    #[tokio::test]
    async fn test_declare_creates_queues_and_dead_letter_pairs() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        Topology::default().declare(channel.as_ref()).await.unwrap();

        for queue in QueueName::ALL {
            assert!(broker.has_queue(queue.as_str()));
            assert_eq!(broker.has_queue(&queue.dead_letter_queue()), queue.has_dead_letter());
        }
        assert_eq!(
            broker.bindings("worker-tasks.dlx"),
            vec![("worker-tasks".to_string(), "worker-tasks.dlq".to_string())]
        );

        // Redeclaring is a no-op.
        Topology::default().declare(channel.as_ref()).await.unwrap();
        assert_eq!(broker.bindings("worker-tasks.dlx").len(), 1);
    }
}
