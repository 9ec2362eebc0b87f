//! Worker dispatch: handing task sessions to workers and taking their
//! answers back.
//!
//! Both modes share [`WorkerTaskMessage`] / [`WorkerResponseMessage`] and one
//! [`ResponseHandler`]. They differ only in transport: [`BrokerDispatcher`]
//! publishes to `worker-tasks`, [`PollDispatcher`] parks the message in the
//! database for a poll worker to claim over HTTP.

pub mod broker;
pub mod poll;
pub mod response;
pub mod worker;

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::errors::DispatchError;
use crate::models::{Session, TaskType, WorkerMode};
use crate::queue::messages::{
    CredentialHandle, EvaluationResult, ExecutionMetadata, ImplementationResult,
    RepositoryDescriptor, ResponseStatus, TaskContext, TaskDescriptor, WorkerError,
    WorkerResponseMessage, WorkerResult, WorkerTaskMessage,
};
use crate::store::DbHandle;

pub use broker::BrokerDispatcher;
pub use poll::{PollDispatcher, PollService};
pub use response::{ResponseHandler, ResponseOutcome};
pub use worker::{CommandWorkerHandler, WorkerPool};

pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Delivers a prepared session to a worker.
#[async_trait]
pub trait TaskDispatch: Send + Sync {
    fn mode(&self) -> WorkerMode;

    async fn dispatch(&self, message: &WorkerTaskMessage) -> Result<(), DispatchError>;
}

/// Runs the actual work. Shared by the broker pool and the poll SDK.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    async fn evaluate(&self, task: &WorkerTaskMessage) -> anyhow::Result<EvaluationResult>;

    async fn implement(&self, task: &WorkerTaskMessage) -> anyhow::Result<ImplementationResult>;
}

/// Run `handler` on `task` and wrap the outcome as a correlated response.
/// A [`WorkerError`] inside the handler error keeps its code; anything else
/// becomes `HANDLER_ERROR`.
pub async fn execute(
    handler: &dyn WorkerHandler,
    task: &WorkerTaskMessage,
    worker_id: &str,
) -> WorkerResponseMessage {
    let started = Instant::now();
    let result = match task.task_type {
        TaskType::Evaluation => handler.evaluate(task).await.map(|evaluation| WorkerResult {
            evaluation: Some(evaluation),
            implementation: None,
        }),
        TaskType::Implementation => handler
            .implement(task)
            .await
            .map(|implementation| WorkerResult {
                evaluation: None,
                implementation: Some(implementation),
            }),
    };
    let metadata = ExecutionMetadata {
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        worker_version: Some(WORKER_VERSION.to_string()),
        worker_id: Some(worker_id.to_string()),
    };
    match result {
        Ok(result) => WorkerResponseMessage::success(task, result, metadata),
        Err(e) => {
            warn!(session_id = %task.session_id, error = %e, "handler failed");
            let error = match e.downcast::<WorkerError>() {
                Ok(worker_error) => worker_error,
                Err(other) => WorkerError::new("HANDLER_ERROR", format!("{:#}", other)),
            };
            let status = if error.code == "TIMEOUT" {
                ResponseStatus::Timeout
            } else {
                ResponseStatus::Error
            };
            WorkerResponseMessage::failure(task, status, error, metadata)
        }
    }
}

/// Create a session for `task_id` and build the message describing it.
///
/// The session records `mode` as the initial worker mode; a poll claim
/// later overrides it with the claiming worker.
pub async fn open_session(
    db: &DbHandle,
    task_id: i64,
    task_type: TaskType,
    mode: WorkerMode,
    credential_reference: String,
) -> Result<WorkerTaskMessage, DispatchError> {
    db.call(move |db| {
        let task = db
            .get_task(task_id)?
            .ok_or(crate::errors::LifecycleError::TaskNotFound { id: task_id })?;
        let source = db
            .get_task_source(task.task_source_id)?
            .ok_or(crate::errors::LifecycleError::TaskSourceNotFound {
                id: task.task_source_id,
            })?;
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            task_id,
            task_type,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            worker_mode: mode,
            worker_id: None,
            created_at: Utc::now(),
        };
        db.insert_session(&session)?;

        let evaluation = match task_type {
            TaskType::Implementation => task.evaluation_result.clone(),
            TaskType::Evaluation => None,
        };
        Ok(WorkerTaskMessage {
            correlation_id: session.correlation_id,
            session_id: session.id,
            task_type,
            context: TaskContext {
                task: TaskDescriptor::from(&task),
                repository: RepositoryDescriptor::from(&source),
                evaluation,
                credentials: vec![CredentialHandle {
                    provider: source.provider,
                    kind: "token".to_string(),
                    reference: credential_reference,
                }],
            },
        })
    })
    .await
    .map_err(lift)
}

/// Recover typed errors raised inside a `DbHandle::call`.
pub(crate) fn lift(err: anyhow::Error) -> DispatchError {
    let err = match err.downcast::<DispatchError>() {
        Ok(dispatch) => return dispatch,
        Err(other) => other,
    };
    match err.downcast::<crate::errors::LifecycleError>() {
        Ok(lifecycle) => DispatchError::Lifecycle(lifecycle),
        Err(other) => DispatchError::Database(other),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedHandler;
    use super::*;
    use crate::models::{ExternalIssue, Provider};

    async fn seeded() -> (DbHandle, i64) {
        let db = DbHandle::in_memory().unwrap();
        let task_id = db
            .call(|db| {
                let src = db.create_task_source("web", Provider::Github, "acme/web", None, Utc::now())?;
                let issue = ExternalIssue {
                    external_id: "12".into(),
                    title: "Broken link".into(),
                    body: "footer".into(),
                    url: None,
                    state: "open".into(),
                    updated_at: Utc::now(),
                };
                Ok(db.upsert_task(src.id, &issue, Utc::now())?.0.id)
            })
            .await
            .unwrap();
        (db, task_id)
    }

    #[tokio::test]
    async fn test_open_session_persists_and_builds_context() {
        let (db, task_id) = seeded().await;
        let msg = open_session(
            &db,
            task_id,
            TaskType::Evaluation,
            WorkerMode::Broker,
            "env:GITHUB_TOKEN".into(),
        )
        .await
        .unwrap();
        assert_eq!(msg.context.task.title, "Broken link");
        assert_eq!(msg.context.repository.name, "acme/web");
        assert_eq!(msg.context.credentials[0].reference, "env:GITHUB_TOKEN");

        let id = msg.session_id.clone();
        let session = db.call(move |db| db.get_session(&id)).await.unwrap().unwrap();
        assert_eq!(session.correlation_id, msg.correlation_id);
        assert_eq!(session.worker_mode, WorkerMode::Broker);
    }

    #[tokio::test]
    async fn test_open_session_for_missing_task() {
        let (db, _) = seeded().await;
        let err = open_session(&db, 404, TaskType::Evaluation, WorkerMode::Poll, String::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Lifecycle(crate::errors::LifecycleError::TaskNotFound { id: 404 })
        ));
    }

    #[tokio::test]
    async fn test_execute_wraps_success_and_failure() {
        let (db, task_id) = seeded().await;
        let msg = open_session(&db, task_id, TaskType::Evaluation, WorkerMode::Broker, String::new())
            .await
            .unwrap();

        let ok = execute(&ScriptedHandler::ready(), &msg, "w1").await;
        assert_eq!(ok.status, ResponseStatus::Success);
        assert_eq!(ok.correlation_id, msg.correlation_id);
        assert!(ok.result.unwrap().evaluation.is_some());

        let failed = execute(&ScriptedHandler::failing("AGENT_CRASH", "exit 137"), &msg, "w1").await;
        assert_eq!(failed.status, ResponseStatus::Error);
        assert_eq!(failed.error_text(), "AGENT_CRASH: exit 137");

        let timed_out = execute(&ScriptedHandler::failing("TIMEOUT", "took too long"), &msg, "w1").await;
        assert_eq!(timed_out.status, ResponseStatus::Timeout);
    }
}
