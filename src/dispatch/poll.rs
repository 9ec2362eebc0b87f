//! Poll-mode dispatch: work parked in the database and claimed by HTTP
//! workers one task at a time.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::{DispatchError, LifecycleError};
use crate::lifecycle::{self, Transition};
use crate::models::{
    SdkWorker, Subject, Task, TaskMessage, TaskMessageType, TaskType, WorkerMode, WorkerStatus,
};
use crate::queue::messages::{
    ExecutionMetadata, ResponseStatus, WorkerError, WorkerResponseMessage, WorkerResult,
    WorkerTaskMessage,
};
use crate::store::DbHandle;

use super::response::{ResponseHandler, ResponseOutcome};
use super::{TaskDispatch, lift};

/// SHA-256 of a worker token, hex encoded. Only the hash is stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generate a fresh worker token.
pub fn generate_token() -> String {
    format!("tfw_{}", uuid::Uuid::new_v4().simple())
}

/// Parks sessions in `poll_dispatch` for poll workers to claim.
#[derive(Clone)]
pub struct PollDispatcher {
    db: DbHandle,
}

impl PollDispatcher {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskDispatch for PollDispatcher {
    fn mode(&self) -> WorkerMode {
        WorkerMode::Poll
    }

    async fn dispatch(&self, message: &WorkerTaskMessage) -> Result<(), DispatchError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| DispatchError::Database(anyhow::Error::new(e)))?;
        let session_id = message.session_id.clone();
        let (task_id, task_type) = (message.context.task.id, message.task_type);
        self.db
            .call(move |db| db.insert_poll_dispatch(&session_id, task_id, task_type, &payload, Utc::now()))
            .await
            .map_err(DispatchError::Database)?;
        info!(task_id, session_id = %message.session_id, %task_type, "parked for poll workers");
        Ok(())
    }
}

/// A claimed unit of work as returned by `GET /next`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTask {
    pub task: Option<Task>,
    pub context: Option<WorkerTaskMessage>,
}

impl NextTask {
    pub fn empty() -> Self {
        Self {
            task: None,
            context: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub task_id: i64,
    pub message_type: TaskMessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    pub task_id: i64,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkerResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExecutionMetadata>,
}

impl FinishRequest {
    pub fn from_response(task_id: i64, response: WorkerResponseMessage) -> Self {
        Self {
            task_id,
            status: response.status,
            result: response.result,
            error: response.error,
            metadata: Some(response.metadata),
        }
    }
}

/// Server side of the pull protocol.
#[derive(Clone)]
pub struct PollService {
    db: DbHandle,
    responses: ResponseHandler,
}

impl PollService {
    pub fn new(db: DbHandle, responses: ResponseHandler) -> Self {
        Self { db, responses }
    }

    /// Resolve a bearer token to its worker.
    pub async fn authenticate(&self, token: &str) -> anyhow::Result<Option<SdkWorker>> {
        let hash = hash_token(token);
        self.db
            .call(move |db| db.find_worker_by_token_hash(&hash))
            .await
    }

    pub async fn heartbeat(
        &self,
        worker: &SdkWorker,
        request: HeartbeatRequest,
    ) -> Result<SdkWorker, DispatchError> {
        let worker_id = worker.id;
        let status = request.status.unwrap_or(WorkerStatus::Online);
        let updated = self
            .db
            .call(move |db| {
                db.record_heartbeat(worker_id, status, request.metadata.as_ref(), Utc::now())
            })
            .await
            .map_err(DispatchError::Database)?;
        if status != worker.status {
            info!(worker_id, status = status.as_str(), "worker status changed");
        }
        Ok(updated)
    }

    /// Claim the oldest matching work and mark its phase active.
    ///
    /// Claims whose task has moved on (failed, recovered, superseded) are
    /// dropped and the next one is tried.
    pub async fn next(&self, worker: &SdkWorker) -> Result<NextTask, DispatchError> {
        let worker_id = worker.id;
        let capabilities = worker.capabilities.clone();
        self.db
            .call(move |db| {
                while let Some(claim) =
                    db.claim_next_poll_dispatch(worker_id, &capabilities, Utc::now())?
                {
                    let subject = Subject::Task {
                        id: claim.task_id,
                        phase: claim.task_type.phase(),
                    };
                    match lifecycle::apply(db, subject, Transition::Start, Utc::now()) {
                        Ok(_) => {}
                        Err(e) if is_rejected(&e) => {
                            warn!(task_id = claim.task_id, error = %e, "dropping stale poll claim");
                            db.delete_poll_dispatch(&claim.session_id)?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    db.assign_session_worker(&claim.session_id, WorkerMode::Poll, worker_id)?;
                    let context: WorkerTaskMessage = serde_json::from_str(&claim.payload)?;
                    let task = db.get_task(claim.task_id)?;
                    debug!(task_id = claim.task_id, worker_id, "poll claim");
                    return Ok(NextTask {
                        task,
                        context: Some(context),
                    });
                }
                Ok(NextTask::empty())
            })
            .await
            .map_err(lift)
    }

    pub async fn post_message(
        &self,
        worker: &SdkWorker,
        request: PostMessageRequest,
    ) -> Result<TaskMessage, DispatchError> {
        let worker_id = worker.id;
        self.db
            .call(move |db| {
                db.get_task(request.task_id)?.ok_or(LifecycleError::TaskNotFound {
                    id: request.task_id,
                })?;
                db.insert_task_message(
                    request.task_id,
                    Some(worker_id),
                    request.message_type,
                    &request.payload,
                    Utc::now(),
                )
            })
            .await
            .map_err(lift)
    }

    pub async fn messages(&self, task_id: i64) -> Result<Vec<TaskMessage>, DispatchError> {
        self.db
            .call(move |db| {
                db.get_task(task_id)?
                    .ok_or(LifecycleError::TaskNotFound { id: task_id })?;
                db.list_task_messages(task_id)
            })
            .await
            .map_err(lift)
    }

    /// Convert a finish call into a worker response and apply it.
    pub async fn finish(&self, worker: &SdkWorker, request: FinishRequest) -> Result<Task, DispatchError> {
        let (task_id, worker_id) = (request.task_id, worker.id);
        let claim = self
            .db
            .call(move |db| db.find_claim(task_id, worker_id))
            .await
            .map_err(DispatchError::Database)?
            .ok_or(DispatchError::NotClaimed { task_id, worker_id })?;
        let dispatched: WorkerTaskMessage = serde_json::from_str(&claim.payload)
            .map_err(|e| DispatchError::Database(anyhow::Error::new(e)))?;

        let response = WorkerResponseMessage {
            correlation_id: dispatched.correlation_id,
            session_id: dispatched.session_id,
            status: request.status,
            result: request.result,
            error: request.error,
            metadata: request.metadata.unwrap_or_else(|| ExecutionMetadata {
                worker_id: Some(worker_id.to_string()),
                ..Default::default()
            }),
        };
        match self.responses.handle(response).await? {
            ResponseOutcome::Applied(task) => Ok(task),
            ResponseOutcome::Ignored => self.task(task_id).await,
        }
    }

    async fn task(&self, task_id: i64) -> Result<Task, DispatchError> {
        self.db
            .call(move |db| db.get_task(task_id))
            .await
            .map_err(DispatchError::Database)?
            .ok_or(DispatchError::Lifecycle(LifecycleError::TaskNotFound { id: task_id }))
    }

    /// Register a worker; returns it with the plaintext token, shown once.
    pub async fn register(
        &self,
        name: &str,
        capabilities: Vec<TaskType>,
    ) -> anyhow::Result<(SdkWorker, String)> {
        register_worker(&self.db, name, capabilities).await
    }
}

pub async fn register_worker(
    db: &DbHandle,
    name: &str,
    capabilities: Vec<TaskType>,
) -> anyhow::Result<(SdkWorker, String)> {
    let token = generate_token();
    let hash = hash_token(&token);
    let name = name.to_string();
    let worker = db
        .call(move |db| db.register_worker(&name, &hash, &capabilities, None, Utc::now()))
        .await?;
    Ok((worker, token))
}

fn is_rejected(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<LifecycleError>(),
        Some(LifecycleError::InvalidTransition { .. } | LifecycleError::TaskNotFound { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::open_session;
    use crate::lifecycle::LifecycleTracker;
    use crate::models::{EvaluationVerdict, ExternalIssue, LifecycleStatus, Phase, Provider};
    use crate::queue::messages::EvaluationResult;

    struct Fixture {
        db: DbHandle,
        tracker: LifecycleTracker,
        service: PollService,
        task_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = DbHandle::in_memory().unwrap();
        let task_id = db
            .call(|db| {
                let src = db.create_task_source("web", Provider::Github, "o/r", None, Utc::now())?;
                let issue = ExternalIssue {
                    external_id: "3".into(),
                    title: "Typo in docs".into(),
                    body: String::new(),
                    url: None,
                    state: "open".into(),
                    updated_at: Utc::now(),
                };
                Ok(db.upsert_task(src.id, &issue, Utc::now())?.0.id)
            })
            .await
            .unwrap();
        let tracker = LifecycleTracker::new(db.clone());
        let service = PollService::new(db.clone(), ResponseHandler::new(db.clone(), tracker.clone()));
        Fixture {
            db,
            tracker,
            service,
            task_id,
        }
    }

    impl Fixture {
        async fn park(&self, task_type: TaskType) -> WorkerTaskMessage {
            self.tracker
                .transition(
                    Subject::Task {
                        id: self.task_id,
                        phase: task_type.phase(),
                    },
                    Transition::Enqueue,
                )
                .await
                .unwrap();
            let msg = open_session(&self.db, self.task_id, task_type, WorkerMode::Poll, String::new())
                .await
                .unwrap();
            PollDispatcher::new(self.db.clone()).dispatch(&msg).await.unwrap();
            msg
        }

        async fn worker(&self, capabilities: Vec<TaskType>) -> (SdkWorker, String) {
            self.service.register("w", capabilities).await.unwrap()
        }
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(generate_token().starts_with("tfw_"));
    }

    #[tokio::test]
    async fn test_authenticate_by_token() {
        let f = fixture().await;
        let (worker, token) = f.worker(vec![TaskType::Evaluation]).await;
        let found = f.service.authenticate(&token).await.unwrap().unwrap();
        assert_eq!(found.id, worker.id);
        assert!(f.service.authenticate("wrong").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_claims_starts_and_assigns_session() {
        let f = fixture().await;
        let parked = f.park(TaskType::Evaluation).await;
        let (worker, _) = f.worker(vec![TaskType::Evaluation]).await;

        let next = f.service.next(&worker).await.unwrap();
        let task = next.task.unwrap();
        assert_eq!(task.ai_evaluation_status, LifecycleStatus::Active);
        assert_eq!(next.context.unwrap().session_id, parked.session_id);

        let sid = parked.session_id.clone();
        let session = f.db.call(move |db| db.get_session(&sid)).await.unwrap().unwrap();
        assert_eq!(session.worker_id, Some(worker.id));

        // Claimed work is not handed out twice.
        assert!(f.service.next(&worker).await.unwrap().task.is_none());
    }

    #[tokio::test]
    async fn test_next_respects_capabilities() {
        let f = fixture().await;
        f.park(TaskType::Evaluation).await;
        let (implementer, _) = f.worker(vec![TaskType::Implementation]).await;
        assert!(f.service.next(&implementer).await.unwrap().context.is_none());
    }

    #[tokio::test]
    async fn test_empty_next_twice_keeps_worker_online() {
        let f = fixture().await;
        let (worker, _) = f.worker(vec![TaskType::Evaluation]).await;
        let worker = f
            .service
            .heartbeat(&worker, HeartbeatRequest::default())
            .await
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Online);

        for _ in 0..2 {
            let next = f.service.next(&worker).await.unwrap();
            assert!(next.task.is_none() && next.context.is_none());
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(90);
        let offline = f
            .db
            .call(move |db| db.mark_stale_workers_offline(cutoff))
            .await
            .unwrap();
        assert!(offline.is_empty());
    }

    #[tokio::test]
    async fn test_stale_claim_is_dropped() {
        let f = fixture().await;
        f.park(TaskType::Evaluation).await;
        let subject = Subject::Task {
            id: f.task_id,
            phase: Phase::Evaluation,
        };
        f.tracker.fail(subject, "cancelled".into()).await.unwrap();

        let (worker, _) = f.worker(vec![TaskType::Evaluation]).await;
        assert!(f.service.next(&worker).await.unwrap().task.is_none());
        assert!(f.db.call(|db| db.list_poll_dispatch()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_applies_response_and_releases_claim() {
        let f = fixture().await;
        f.park(TaskType::Evaluation).await;
        let (worker, _) = f.worker(vec![TaskType::Evaluation]).await;
        f.service.next(&worker).await.unwrap();

        let task = f
            .service
            .finish(
                &worker,
                FinishRequest {
                    task_id: f.task_id,
                    status: ResponseStatus::Success,
                    result: Some(WorkerResult {
                        evaluation: Some(EvaluationResult {
                            verdict: EvaluationVerdict::Ready,
                            summary: "small fix".into(),
                            details: None,
                        }),
                        implementation: None,
                    }),
                    error: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(task.ai_evaluation_status, LifecycleStatus::Completed);
        assert!(f.db.call(|db| db.list_poll_dispatch()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_without_claim_is_rejected() {
        let f = fixture().await;
        let (worker, _) = f.worker(vec![TaskType::Evaluation]).await;
        let err = f
            .service
            .finish(
                &worker,
                FinishRequest {
                    task_id: f.task_id,
                    status: ResponseStatus::Error,
                    result: None,
                    error: Some(WorkerError::new("X", "y")),
                    metadata: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotClaimed { .. }));
    }

    #[tokio::test]
    async fn test_post_and_list_messages() {
        let f = fixture().await;
        let (worker, _) = f.worker(vec![TaskType::Evaluation]).await;
        let msg = f
            .service
            .post_message(
                &worker,
                PostMessageRequest {
                    task_id: f.task_id,
                    message_type: TaskMessageType::Progress,
                    payload: serde_json::json!({"pct": 40}),
                },
            )
            .await
            .unwrap();
        assert_eq!(msg.worker_id, Some(worker.id));
        let listed = f.service.messages(f.task_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].payload["pct"], 40);

        assert!(matches!(
            f.service.messages(999).await,
            Err(DispatchError::Lifecycle(LifecycleError::TaskNotFound { id: 999 }))
        ));
    }
}
