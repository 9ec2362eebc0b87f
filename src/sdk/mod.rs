//! Client side of the poll-mode protocol: a thin HTTP client and the pull
//! loop that drives a [`WorkerHandler`] with it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::poll::{FinishRequest, HeartbeatRequest, NextTask, PostMessageRequest};
use crate::dispatch::{WorkerHandler, execute};
use crate::models::{SdkWorker, Task, TaskMessage, TaskMessageType, WorkerStatus};
use crate::queue::messages::WorkerTaskMessage;

/// Bearer-authenticated client for `/api/worker`.
#[derive(Clone)]
pub struct PollClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for PollClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl PollClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/worker{}", self.base_url, path)
    }

    pub async fn heartbeat(
        &self,
        status: WorkerStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<SdkWorker> {
        let body = HeartbeatRequest {
            status: Some(status),
            metadata,
        };
        self.post("/heartbeat", &body).await.context("Heartbeat failed")
    }

    /// Claim the next task, if any.
    pub async fn next(&self) -> Result<NextTask> {
        let resp = self
            .client
            .get(self.url("/next"))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Failed to send next request")?;
        decode(resp).await.context("Fetching next task failed")
    }

    pub async fn post_message(
        &self,
        task_id: i64,
        message_type: TaskMessageType,
        payload: serde_json::Value,
    ) -> Result<TaskMessage> {
        let body = PostMessageRequest {
            task_id,
            message_type,
            payload,
        };
        self.post("/message", &body).await.context("Posting task message failed")
    }

    pub async fn finish(&self, request: &FinishRequest) -> Result<Task> {
        self.post("/finish", request).await.context("Finish failed")
    }

    pub async fn messages(&self, task_id: i64) -> Result<Vec<TaskMessage>> {
        let resp = self
            .client
            .get(self.url(&format!("/tasks/{}/messages", task_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Failed to send messages request")?;
        decode(resp).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", path))?;
        decode(resp).await
    }
}

/// Turn a non-2xx response into an error carrying the server's message.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_default();
        anyhow::bail!("server returned {}: {}", status, message);
    }
    resp.json().await.context("Failed to parse server response")
}

/// Pull loop: claim, run, finish, repeat. Heartbeats run on their own timer
/// so a long task does not make the worker look dead.
pub struct PollWorker {
    client: PollClient,
    handler: Arc<dyn WorkerHandler>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl PollWorker {
    pub fn new(client: PollClient, handler: Arc<dyn WorkerHandler>) -> Self {
        Self {
            client,
            handler,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Run until `shutdown` flips. No new task is claimed after that; a task
    /// in flight is finished first. Returns the number of tasks processed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<usize> {
        let me = self.client.heartbeat(WorkerStatus::Online, None).await?;
        let worker_id = format!("poll-{}", me.id);
        info!(worker = %me.name, %worker_id, "poll worker started");

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            self.heartbeat_interval,
            shutdown.clone(),
        ));

        let mut processed = 0;
        while !*shutdown.borrow() {
            match self.client.next().await {
                Ok(NextTask {
                    context: Some(task), ..
                }) => {
                    self.process(&task, &worker_id).await;
                    processed += 1;
                    continue;
                }
                Ok(_) => debug!("no work, sleeping"),
                Err(e) => warn!(error = %format!("{:#}", e), "poll failed"),
            }
            if idle(&mut shutdown, self.poll_interval).await {
                break;
            }
        }

        // The heartbeat loop exits on the same signal. Wait for it so an
        // online heartbeat still in flight cannot land after the offline one.
        let grace = self.heartbeat_interval + Duration::from_secs(10);
        match tokio::time::timeout(grace, heartbeat).await {
            Ok(Err(e)) => warn!(error = %e, "heartbeat task failed"),
            Ok(Ok(())) => {}
            Err(_) => warn!("heartbeat task did not stop in time"),
        }
        if let Err(e) = self.client.heartbeat(WorkerStatus::Offline, None).await {
            warn!(error = %e, "final offline heartbeat failed");
        }
        info!(%worker_id, processed, "poll worker stopped");
        Ok(processed)
    }

    /// A failed finish leaves the claim in place for stuck recovery.
    async fn process(&self, task: &WorkerTaskMessage, worker_id: &str) {
        let task_id = task.context.task.id;
        info!(task_id, session_id = %task.session_id, task_type = %task.task_type, "running task");
        let response = execute(self.handler.as_ref(), task, worker_id).await;
        let request = FinishRequest::from_response(task_id, response);
        if let Err(e) = self.client.finish(&request).await {
            warn!(task_id, error = %format!("{:#}", e), "failed to report task result");
        }
    }
}

/// Sleep for `interval` or until shutdown. Returns true when the loop
/// should stop.
async fn idle(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn heartbeat_loop(client: PollClient, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = client.heartbeat(WorkerStatus::Online, None).await {
                    warn!(error = %format!("{:#}", e), "heartbeat failed");
                }
            }
        }
    }
}
