use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::QueueError;
use crate::queue::messages::{
    EvaluationResult, ImplementationResult, ResponseStatus, WorkerError, WorkerTaskMessage,
};
use crate::queue::{BrokerManager, Consumer, MessageContext, QueueName, Requeue};

use super::{WorkerHandler, execute};

/// Broker-mode worker process: consumes `worker-tasks`, runs the handler
/// and answers on `worker-responses`.
pub struct WorkerPool {
    manager: Arc<BrokerManager>,
    handler: Arc<dyn WorkerHandler>,
    prefetch: u16,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(manager: Arc<BrokerManager>, handler: Arc<dyn WorkerHandler>, prefetch: u16) -> Self {
        Self {
            manager,
            handler,
            prefetch,
            worker_id: format!("broker-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Consume until the stream breaks. Handler failures publish an error
    /// response and then dead-letter the task message without retry. A task
    /// whose response could not be published is requeued instead.
    pub async fn run(&self) -> Result<(), QueueError> {
        info!(worker_id = %self.worker_id, prefetch = self.prefetch, "worker pool started");
        let manager = self.manager.clone();
        let handler = self.handler.clone();
        let worker_id = self.worker_id.clone();
        Consumer::new(self.manager.clone(), QueueName::WorkerTasks)
            .prefetch(self.prefetch)
            .max_retries(0)
            .run(move |task: WorkerTaskMessage, _ctx: MessageContext| {
                let manager = manager.clone();
                let handler = handler.clone();
                let worker_id = worker_id.clone();
                async move {
                    let response = execute(handler.as_ref(), &task, &worker_id).await;
                    manager
                        .publish_json(
                            QueueName::WorkerResponses,
                            &response,
                            Some(response.correlation_id.as_str()),
                        )
                        .await
                        .map_err(|e| {
                            Requeue(format!(
                                "response for task {} not published: {}",
                                task.context.task.id, e
                            ))
                        })?;
                    if response.status != ResponseStatus::Success {
                        anyhow::bail!("task {} failed: {}", task.context.task.id, response.error_text());
                    }
                    Ok(())
                }
            })
            .await
    }
}

/// Runs an external agent command per task. The task message is written to
/// its stdin as JSON; stdout must be one JSON result object.
///
/// With a timeout set, an agent still running at the deadline is killed and
/// the task fails with `TIMEOUT`.
#[derive(Debug, Clone)]
pub struct CommandWorkerHandler {
    command: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandWorkerHandler {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, task: &WorkerTaskMessage) -> anyhow::Result<Vec<u8>> {
        let Some(limit) = self.timeout else {
            return self.run_agent(task).await;
        };
        match tokio::time::timeout(limit, self.run_agent(task)).await {
            Ok(output) => output,
            // Dropping the future kills the child.
            Err(_) => {
                warn!(session_id = %task.session_id, timeout_secs = limit.as_secs(), "agent command timed out");
                Err(WorkerError::new(
                    "TIMEOUT",
                    format!("agent did not finish within {}s", limit.as_secs()),
                )
                .into())
            }
        }
    }

    async fn run_agent(&self, task: &WorkerTaskMessage) -> anyhow::Result<Vec<u8>> {
        let input = serde_json::to_vec(task).context("Failed to encode task message")?;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("TICKETFLOW_TASK_TYPE", task.task_type.as_str())
            .env("TICKETFLOW_SESSION_ID", &task.session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::new("SPAWN_FAILED", format!("{}: {}", self.command, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .context("Failed to write task to agent stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for agent process")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("agent exited with {}", output.status)
            } else {
                format!("agent exited with {}: {}", output.status, stderr.trim())
            };
            warn!(session_id = %task.session_id, %message, "agent command failed");
            return Err(WorkerError::new("AGENT_FAILED", message).into());
        }
        Ok(output.stdout)
    }
}

fn parse_output<T: serde::de::DeserializeOwned>(stdout: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(stdout).map_err(|e| {
        anyhow::Error::new(WorkerError::new(
            "INVALID_OUTPUT",
            format!("agent output is not a valid result: {}", e),
        ))
    })
}

#[async_trait]
impl WorkerHandler for CommandWorkerHandler {
    async fn evaluate(&self, task: &WorkerTaskMessage) -> anyhow::Result<EvaluationResult> {
        parse_output(&self.run(task).await?)
    }

    async fn implement(&self, task: &WorkerTaskMessage) -> anyhow::Result<ImplementationResult> {
        parse_output(&self.run(task).await?)
    }
}
