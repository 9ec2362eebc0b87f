use tracing::{debug, info, warn};

use crate::errors::{DispatchError, LifecycleError};
use crate::lifecycle::{LifecycleTracker, PhaseOutcome};
use crate::models::{Subject, Task, TaskType, WorkerMode};
use crate::orchestrator::Enqueuer;
use crate::queue::messages::{ResponseStatus, WorkerResponseMessage};
use crate::store::DbHandle;

/// What handling a response did.
#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Applied(Task),
    /// Duplicate for a finished phase, or a response from a superseded
    /// session.
    Ignored,
}

/// Applies worker responses from either dispatch mode to task status.
#[derive(Clone)]
pub struct ResponseHandler {
    db: DbHandle,
    tracker: LifecycleTracker,
    auto_implement: Option<Enqueuer>,
}

impl ResponseHandler {
    pub fn new(db: DbHandle, tracker: LifecycleTracker) -> Self {
        Self {
            db,
            tracker,
            auto_implement: None,
        }
    }

    /// Enqueue implementation as soon as an evaluation comes back `ready`.
    pub fn with_auto_implement(mut self, enqueuer: Enqueuer) -> Self {
        self.auto_implement = Some(enqueuer);
        self
    }

    pub async fn handle(&self, response: WorkerResponseMessage) -> Result<ResponseOutcome, DispatchError> {
        let session_id = response.session_id.clone();
        let session = self
            .db
            .call(move |db| db.get_session(&session_id))
            .await
            .map_err(DispatchError::Database)?
            .ok_or_else(|| DispatchError::SessionNotFound(response.session_id.clone()))?;
        if session.correlation_id != response.correlation_id {
            return Err(DispatchError::CorrelationMismatch {
                session_id: session.id,
            });
        }

        let (task_id, task_type) = (session.task_id, session.task_type);
        let latest = self
            .db
            .call(move |db| db.latest_session(task_id, task_type))
            .await
            .map_err(DispatchError::Database)?;
        if latest.as_ref().is_some_and(|s| s.id != session.id) {
            info!(task_id, session_id = %session.id, "response from superseded session ignored");
            self.release_claim(session.worker_mode, &session.id).await?;
            return Ok(ResponseOutcome::Ignored);
        }

        let subject = Subject::Task {
            id: task_id,
            phase: task_type.phase(),
        };
        if self.tracker.status(subject).await?.is_terminal() {
            debug!(task_id, session_id = %session.id, "duplicate response ignored");
            self.release_claim(session.worker_mode, &session.id).await?;
            return Ok(ResponseOutcome::Ignored);
        }

        let task = match response.status {
            ResponseStatus::Success => self.apply_success(task_id, task_type, &response).await?,
            ResponseStatus::Error | ResponseStatus::Timeout => {
                let error = response.error_text();
                warn!(task_id, session_id = %session.id, %error, "worker reported failure");
                self.tracker.fail(subject, error).await?;
                self.tracker.task(task_id).await?
            }
        };
        self.release_claim(session.worker_mode, &session.id).await?;
        Ok(ResponseOutcome::Applied(task))
    }

    async fn apply_success(
        &self,
        task_id: i64,
        task_type: TaskType,
        response: &WorkerResponseMessage,
    ) -> Result<Task, DispatchError> {
        let result = response.result.clone().unwrap_or_default();
        let outcome = match task_type {
            TaskType::Evaluation => result.evaluation.map(|evaluation| PhaseOutcome::Evaluation {
                verdict: evaluation.verdict,
                result: serde_json::to_value(&evaluation).unwrap_or_default(),
            }),
            TaskType::Implementation => result.implementation.map(|implementation| {
                PhaseOutcome::Implementation {
                    result: serde_json::to_value(&implementation).unwrap_or_default(),
                }
            }),
        };
        let Some(outcome) = outcome else {
            let err = DispatchError::MissingResult {
                session_id: response.session_id.clone(),
                expected: task_type.as_str(),
            };
            warn!(task_id, error = %err, "success response without a result");
            let subject = Subject::Task {
                id: task_id,
                phase: task_type.phase(),
            };
            self.tracker
                .fail(subject, format!("INVALID_RESULT: {}", err))
                .await?;
            return Ok(self.tracker.task(task_id).await?);
        };

        let task = self.tracker.complete(task_id, outcome).await?;
        info!(
            task_id,
            session_id = %response.session_id,
            phase = %task_type.phase(),
            duration_ms = response.metadata.duration_ms,
            "task phase completed"
        );

        if task.is_ready_for_implementation()
            && task_type == TaskType::Evaluation
            && let Some(enqueuer) = &self.auto_implement
        {
            match enqueuer.enqueue_implementation(task_id).await {
                Ok(()) => {}
                Err(DispatchError::Lifecycle(LifecycleError::InvalidTransition { .. })) => {
                    debug!(task_id, "implementation already queued");
                }
                Err(e) => warn!(task_id, error = %e, "auto-implement enqueue failed"),
            }
            return Ok(self.tracker.task(task_id).await?);
        }
        Ok(task)
    }

    async fn release_claim(&self, mode: WorkerMode, session_id: &str) -> Result<(), DispatchError> {
        if mode != WorkerMode::Poll {
            return Ok(());
        }
        let id = session_id.to_string();
        self.db
            .call(move |db| db.delete_poll_dispatch(&id))
            .await
            .map_err(DispatchError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::open_session;
    use crate::lifecycle::Transition;
    use crate::models::{EvaluationVerdict, ExternalIssue, LifecycleStatus, Provider};
    use crate::queue::memory::MemoryBroker;
    use crate::queue::messages::{
        EvaluationResult, ExecutionMetadata, WorkerError, WorkerResult, WorkerTaskMessage,
    };
    use crate::queue::{BrokerManager, Topology};
    use chrono::Utc;
    use std::sync::Arc;

    struct Fixture {
        db: DbHandle,
        tracker: LifecycleTracker,
        task_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = DbHandle::in_memory().unwrap();
        let task_id = db
            .call(|db| {
                let src = db.create_task_source("web", Provider::Github, "o/r", None, Utc::now())?;
                let issue = ExternalIssue {
                    external_id: "5".into(),
                    title: "t".into(),
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
        Fixture {
            db,
            tracker,
            task_id,
        }
    }

    impl Fixture {
        async fn queued_session(&self, task_type: TaskType, mode: WorkerMode) -> WorkerTaskMessage {
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
            open_session(&self.db, self.task_id, task_type, mode, String::new())
                .await
                .unwrap()
        }
    }

    fn ready(task: &WorkerTaskMessage) -> WorkerResponseMessage {
        WorkerResponseMessage::success(
            task,
            WorkerResult {
                evaluation: Some(EvaluationResult {
                    verdict: EvaluationVerdict::Ready,
                    summary: "clear".into(),
                    details: None,
                }),
                implementation: None,
            },
            ExecutionMetadata::default(),
        )
    }

    #[tokio::test]
    async fn test_evaluation_success_completes_and_unlocks_implementation() {
        let f = fixture().await;
        let session = f.queued_session(TaskType::Evaluation, WorkerMode::Broker).await;
        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone());

        let outcome = handler.handle(ready(&session)).await.unwrap();
        let ResponseOutcome::Applied(task) = outcome else {
            panic!("expected applied");
        };
        assert_eq!(task.ai_evaluation_status, LifecycleStatus::Completed);
        assert_eq!(task.evaluation_verdict, Some(EvaluationVerdict::Ready));
        assert_eq!(task.evaluation_result.unwrap()["summary"], "clear");

        f.tracker.enqueue_implementation(f.task_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let f = fixture().await;
        let session = f.queued_session(TaskType::Evaluation, WorkerMode::Broker).await;
        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone());
        handler.handle(ready(&session)).await.unwrap();
        assert!(matches!(
            handler.handle(ready(&session)).await.unwrap(),
            ResponseOutcome::Ignored
        ));
    }

    #[tokio::test]
    async fn test_error_response_records_code_and_message() {
        let f = fixture().await;
        let session = f.queued_session(TaskType::Evaluation, WorkerMode::Broker).await;
        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone());
        let response = WorkerResponseMessage::failure(
            &session,
            ResponseStatus::Error,
            WorkerError::new("REPO_UNREACHABLE", "clone failed"),
            ExecutionMetadata::default(),
        );
        let ResponseOutcome::Applied(task) = handler.handle(response).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(task.ai_evaluation_status, LifecycleStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("REPO_UNREACHABLE: clone failed"));
    }

    #[tokio::test]
    async fn test_unknown_session_and_correlation_mismatch() {
        let f = fixture().await;
        let session = f.queued_session(TaskType::Evaluation, WorkerMode::Broker).await;
        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone());

        let mut unknown = ready(&session);
        unknown.session_id = "nope".into();
        assert!(matches!(
            handler.handle(unknown).await,
            Err(DispatchError::SessionNotFound(_))
        ));

        let mut forged = ready(&session);
        forged.correlation_id = "other".into();
        assert!(matches!(
            handler.handle(forged).await,
            Err(DispatchError::CorrelationMismatch { .. })
        ));
        assert_eq!(
            f.tracker.task(f.task_id).await.unwrap().ai_evaluation_status,
            LifecycleStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_success_without_result_fails_the_phase() {
        let f = fixture().await;
        let session = f.queued_session(TaskType::Evaluation, WorkerMode::Broker).await;
        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone());
        let response =
            WorkerResponseMessage::success(&session, WorkerResult::default(), ExecutionMetadata::default());
        let ResponseOutcome::Applied(task) = handler.handle(response).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(task.ai_evaluation_status, LifecycleStatus::Failed);
        assert!(task.last_error.unwrap().starts_with("INVALID_RESULT"));
    }

    #[tokio::test]
    async fn test_superseded_session_is_ignored() {
        let f = fixture().await;
        let first = f.queued_session(TaskType::Evaluation, WorkerMode::Broker).await;
        let _second = open_session(&f.db, f.task_id, TaskType::Evaluation, WorkerMode::Broker, String::new())
            .await
            .unwrap();
        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone());
        assert!(matches!(
            handler.handle(ready(&first)).await.unwrap(),
            ResponseOutcome::Ignored
        ));
    }

    #[tokio::test]
    async fn test_auto_implement_enqueues_ready_tasks() {
        let f = fixture().await;
        let session = f.queued_session(TaskType::Evaluation, WorkerMode::Broker).await;
        let broker = MemoryBroker::new();
        let manager = Arc::new(BrokerManager::new(Arc::new(broker.clone()), Topology::default()));
        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone())
            .with_auto_implement(Enqueuer::new(f.db.clone(), manager));

        let ResponseOutcome::Applied(task) = handler.handle(ready(&session)).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(task.ai_implementation_status, LifecycleStatus::Queued);
        assert_eq!(broker.depth("task-impl"), 1);
    }

    #[tokio::test]
    async fn test_poll_session_releases_its_claim() {
        let f = fixture().await;
        let session = f.queued_session(TaskType::Evaluation, WorkerMode::Poll).await;
        let (sid, tid) = (session.session_id.clone(), f.task_id);
        f.db.call(move |db| db.insert_poll_dispatch(&sid, tid, TaskType::Evaluation, "{}", Utc::now()))
            .await
            .unwrap();

        let handler = ResponseHandler::new(f.db.clone(), f.tracker.clone());
        handler.handle(ready(&session)).await.unwrap();
        assert!(f.db.call(|db| db.list_poll_dispatch()).await.unwrap().is_empty());
    }
}
