//! Wires queues, the lifecycle tracker, the sync engine and the dispatcher
//! into the intake pipeline:
//!
//! ```text
//! task-sync ──▶ sync pass ──▶ task-eval ──▶ dispatch ──▶ worker ──▶ worker-responses
//!                                              ▲                           │
//!                             task-impl ───────┘◀── ready (auto/explicit) ─┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::dispatch::{ResponseHandler, TaskDispatch, open_session};
use crate::errors::{DispatchError, LifecycleError, QueueError, SyncError};
use crate::lifecycle::{LifecycleTracker, Transition};
use crate::models::{LifecycleStatus, Phase, Subject, TaskType};
use crate::queue::messages::{SyncRequest, TaskRequest, WorkerResponseMessage};
use crate::queue::{BrokerManager, Consumer, MessageContext, QueueName};
use crate::store::DbHandle;
use crate::sync::SyncEngine;

/// Status transition plus publish for each pipeline entry point.
///
/// The transition happens first. If the publish then fails the subject is
/// left queued with no message, which stuck recovery repairs.
#[derive(Clone)]
pub struct Enqueuer {
    db: DbHandle,
    tracker: LifecycleTracker,
    manager: Arc<BrokerManager>,
}

impl Enqueuer {
    pub fn new(db: DbHandle, manager: Arc<BrokerManager>) -> Self {
        Self {
            tracker: LifecycleTracker::new(db.clone()),
            db,
            manager,
        }
    }

    /// Returns `false` when a sync for this source is already in flight.
    pub async fn enqueue_sync(&self, task_source_id: i64) -> Result<bool, DispatchError> {
        match self
            .tracker
            .transition(Subject::Source(task_source_id), Transition::Enqueue)
            .await
        {
            Ok(_) => {}
            Err(LifecycleError::InvalidTransition { from, .. }) => {
                debug!(task_source_id, %from, "sync already in flight");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        self.publish_sync(task_source_id).await?;
        info!(task_source_id, "sync enqueued");
        Ok(true)
    }

    /// Returns `false` when evaluation is already queued or running.
    pub async fn enqueue_evaluation(&self, task_id: i64) -> Result<bool, DispatchError> {
        let subject = Subject::Task {
            id: task_id,
            phase: Phase::Evaluation,
        };
        match self.tracker.transition(subject, Transition::Enqueue).await {
            Ok(_) => {}
            Err(LifecycleError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.publish_task(TaskType::Evaluation, task_id).await?;
        info!(task_id, "evaluation enqueued");
        Ok(true)
    }

    /// Queue evaluation for each task whose evaluation is pending or failed,
    /// then publish the requests. Every transition lands before the first
    /// publish, so a broker failure part-way through leaves the remaining
    /// tasks queued for stuck recovery rather than pending with no trigger.
    /// Returns the tasks queued and the first publish error, if any.
    pub async fn enqueue_evaluations(
        &self,
        task_ids: &[i64],
    ) -> Result<(Vec<i64>, Option<DispatchError>), DispatchError> {
        let mut queued = Vec::new();
        for &task_id in task_ids {
            let subject = Subject::Task {
                id: task_id,
                phase: Phase::Evaluation,
            };
            let status = self.tracker.status(subject).await?;
            if !matches!(status, LifecycleStatus::Pending | LifecycleStatus::Failed) {
                continue;
            }
            match self.tracker.transition(subject, Transition::Enqueue).await {
                Ok(_) => queued.push(task_id),
                Err(LifecycleError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut first_error = None;
        for &task_id in &queued {
            match self.publish_task(TaskType::Evaluation, task_id).await {
                Ok(()) => info!(task_id, "evaluation enqueued"),
                Err(e) => {
                    warn!(task_id, error = %e, "evaluation queued but not published");
                    first_error.get_or_insert(e);
                }
            }
        }
        Ok((queued, first_error))
    }

    /// Rejected with `NotReady` unless evaluation completed as `ready`.
    pub async fn enqueue_implementation(&self, task_id: i64) -> Result<(), DispatchError> {
        self.tracker.enqueue_implementation(task_id).await?;
        self.publish_task(TaskType::Implementation, task_id).await?;
        info!(task_id, "implementation enqueued");
        Ok(())
    }

    /// Publish the request for a subject that is already queued.
    pub async fn republish(&self, subject: Subject) -> Result<(), DispatchError> {
        match subject {
            Subject::Source(id) => self.publish_sync(id).await,
            Subject::Task { id, phase } => match phase {
                Phase::Evaluation => self.publish_task(TaskType::Evaluation, id).await,
                Phase::Implementation => self.publish_task(TaskType::Implementation, id).await,
                Phase::Sync => Ok(()),
            },
        }
    }

    async fn publish_sync(&self, task_source_id: i64) -> Result<(), DispatchError> {
        let source = self
            .db
            .call(move |db| db.get_task_source(task_source_id))
            .await
            .map_err(DispatchError::Database)?
            .ok_or(LifecycleError::TaskSourceNotFound { id: task_source_id })?;
        let request = SyncRequest {
            task_source_id,
            provider: source.provider,
            attempt: None,
        };
        self.manager
            .publish_json(QueueName::TaskSync, &request, None)
            .await?;
        Ok(())
    }

    async fn publish_task(&self, task_type: TaskType, task_id: i64) -> Result<(), DispatchError> {
        let queue = match task_type {
            TaskType::Evaluation => QueueName::TaskEval,
            TaskType::Implementation => QueueName::TaskImpl,
        };
        self.manager
            .publish_json(queue, &TaskRequest { task_id, attempt: None }, None)
            .await?;
        Ok(())
    }
}

/// Consumer-side handlers for task-sync, task-eval, task-impl and
/// worker-responses.
pub struct Orchestrator {
    db: DbHandle,
    tracker: LifecycleTracker,
    manager: Arc<BrokerManager>,
    engine: SyncEngine,
    dispatcher: Arc<dyn TaskDispatch>,
    responses: ResponseHandler,
    enqueuer: Enqueuer,
    credential_reference: String,
    prefetch: u16,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        manager: Arc<BrokerManager>,
        engine: SyncEngine,
        dispatcher: Arc<dyn TaskDispatch>,
        auto_implement: bool,
    ) -> Self {
        let tracker = LifecycleTracker::new(db.clone());
        let enqueuer = Enqueuer::new(db.clone(), manager.clone());
        let mut responses = ResponseHandler::new(db.clone(), tracker.clone());
        if auto_implement {
            responses = responses.with_auto_implement(enqueuer.clone());
        }
        Self {
            db,
            tracker,
            manager,
            engine,
            dispatcher,
            responses,
            enqueuer,
            credential_reference: "env:GITHUB_TOKEN".to_string(),
            prefetch: 1,
        }
    }

    pub fn with_credential_reference(mut self, reference: impl Into<String>) -> Self {
        self.credential_reference = reference.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn enqueuer(&self) -> &Enqueuer {
        &self.enqueuer
    }

    pub fn responses(&self) -> &ResponseHandler {
        &self.responses
    }

    pub fn manager(&self) -> &Arc<BrokerManager> {
        &self.manager
    }

    /// One task-sync delivery.
    pub async fn handle_sync(&self, request: SyncRequest, ctx: MessageContext) -> anyhow::Result<()> {
        let source_id = request.task_source_id;
        let subject = Subject::Source(source_id);
        let status = match self.tracker.status(subject).await {
            Ok(status) => status,
            Err(LifecycleError::TaskSourceNotFound { .. }) => {
                warn!(task_source_id = source_id, "sync request for unknown source dropped");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // A retried delivery finds the source failed by the previous attempt.
        if status == LifecycleStatus::Failed && ctx.attempt > 0 {
            self.tracker.transition(subject, Transition::Enqueue).await?;
        } else if status != LifecycleStatus::Queued {
            debug!(task_source_id = source_id, %status, "sync not queued, skipping delivery");
            return Ok(());
        }
        match self.tracker.transition(subject, Transition::Start).await {
            Ok(_) => {}
            Err(LifecycleError::InvalidTransition { .. }) => {
                debug!(task_source_id = source_id, "sync claimed by another consumer");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let started_at = Utc::now();
        match self.engine.run_pass_at(source_id, started_at).await {
            Ok(report) => {
                self.tracker.transition(subject, Transition::Complete).await?;
                self.db
                    .call(move |db| db.record_sync_success(source_id, started_at))
                    .await?;
                // Finished evaluations are left alone; new or reopened work
                // gets evaluated.
                let (_, publish_error) = self
                    .enqueuer
                    .enqueue_evaluations(&report.changed_tasks)
                    .await?;
                if let Some(e) = publish_error {
                    // The sync is complete, so a redelivery would be skipped.
                    // Stuck recovery republishes the queued evaluations.
                    warn!(task_source_id = source_id, error = %e, "evaluation fan-out incomplete");
                }
                Ok(())
            }
            Err(e) => {
                let retryable = matches!(e, SyncError::Fetch { .. } | SyncError::Database(_));
                warn!(task_source_id = source_id, attempt = ctx.attempt, error = %e, "sync pass failed");
                self.tracker.fail(subject, e.to_string()).await?;
                if retryable {
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    /// One task-eval or task-impl delivery: open a session and dispatch it.
    pub async fn handle_task(
        &self,
        request: TaskRequest,
        task_type: TaskType,
        ctx: MessageContext,
    ) -> anyhow::Result<()> {
        let task_id = request.task_id;
        let phase = task_type.phase();
        let task = match self.tracker.task(task_id).await {
            Ok(task) => task,
            Err(LifecycleError::TaskNotFound { .. }) => {
                warn!(task_id, "request for unknown task dropped");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if task.status(phase) != LifecycleStatus::Queued {
            debug!(task_id, %phase, status = %task.status(phase), "not queued, skipping delivery");
            return Ok(());
        }

        // Redelivery after the session was already handed out.
        let since = task.status_updated_at(phase);
        let latest = self
            .db
            .call(move |db| db.latest_session(task_id, task_type))
            .await?;
        if latest.is_some_and(|s| s.created_at >= since) {
            debug!(task_id, %phase, "session already dispatched");
            return Ok(());
        }

        if task_type == TaskType::Implementation && !task.is_ready_for_implementation() {
            let subject = Subject::Task { id: task_id, phase };
            let reason = format!(
                "NOT_READY: evaluation is {}",
                task.ai_evaluation_status.label(Phase::Evaluation)
            );
            self.tracker.fail(subject, reason).await?;
            return Ok(());
        }

        let message = open_session(
            &self.db,
            task_id,
            task_type,
            self.dispatcher.mode(),
            self.credential_reference.clone(),
        )
        .await?;
        if let Err(e) = self.dispatcher.dispatch(&message).await {
            // An undelivered session must not satisfy the redelivery check
            // above, or the retry would skip the dispatch.
            let session_id = message.session_id.clone();
            if let Err(cleanup) = self
                .db
                .call(move |db| db.delete_session(&session_id))
                .await
            {
                warn!(task_id, error = %cleanup, "failed to discard undelivered session");
            }
            return Err(e.into());
        }
        debug!(task_id, attempt = ctx.attempt, session_id = %message.session_id, "task dispatched");
        Ok(())
    }

    /// One worker-responses delivery. Unknown or forged sessions are dropped.
    pub async fn handle_response(&self, response: WorkerResponseMessage) -> anyhow::Result<()> {
        match self.responses.handle(response).await {
            Ok(_) => Ok(()),
            Err(e @ (DispatchError::SessionNotFound(_) | DispatchError::CorrelationMismatch { .. })) => {
                warn!(error = %e, "worker response dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn consume_sync(self: Arc<Self>) -> Result<(), QueueError> {
        let this = self.clone();
        Consumer::new(self.manager.clone(), QueueName::TaskSync)
            .prefetch(self.prefetch)
            .run(move |request: SyncRequest, ctx| {
                let this = this.clone();
                async move { this.handle_sync(request, ctx).await }
            })
            .await
    }

    pub async fn consume_tasks(self: Arc<Self>, task_type: TaskType) -> Result<(), QueueError> {
        let queue = match task_type {
            TaskType::Evaluation => QueueName::TaskEval,
            TaskType::Implementation => QueueName::TaskImpl,
        };
        let this = self.clone();
        Consumer::new(self.manager.clone(), queue)
            .prefetch(self.prefetch)
            .run(move |request: TaskRequest, ctx| {
                let this = this.clone();
                async move { this.handle_task(request, task_type, ctx).await }
            })
            .await
    }

    pub async fn consume_responses(self: Arc<Self>) -> Result<(), QueueError> {
        let this = self.clone();
        Consumer::new(self.manager.clone(), QueueName::WorkerResponses)
            .prefetch(self.prefetch)
            .run(move |response: WorkerResponseMessage, _ctx| {
                let this = this.clone();
                async move { this.handle_response(response).await }
            })
            .await
    }
}
