//! Task lifecycle tracker.
//!
//! Sync, evaluation and implementation share one status machine:
//!
//! ```text
//! pending ──Enqueue──▶ queued ──Start──▶ <active> ──Complete──▶ completed
//!    ▲                  │  ▲               │                      │
//!    │                  │  └───Requeue─────┤                      │
//!    │                  └──────Fail────────┴──▶ failed            │
//!    └──── Enqueue from failed / completed (re-run) ◀─────────────┘
//! ```
//!
//! Every transition is a compare-and-set against the stored status, so a
//! duplicate or racing transition is rejected rather than overwriting.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::LifecycleError;
use crate::models::{EvaluationVerdict, LifecycleStatus, Phase, Subject, Task};
use crate::store::{DbHandle, FlowDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Enqueue,
    Start,
    Complete,
    Fail,
    /// Recovery only: put in-flight work back on the queue.
    Requeue,
}

impl Transition {
    pub fn allowed_from(&self) -> &'static [LifecycleStatus] {
        use LifecycleStatus::*;
        match self {
            Self::Enqueue => &[Pending, Failed, Completed],
            Self::Start => &[Queued],
            Self::Complete => &[Active],
            Self::Fail => &[Queued, Active],
            Self::Requeue => &[Queued, Active],
        }
    }

    pub fn target(&self) -> LifecycleStatus {
        match self {
            Self::Enqueue | Self::Requeue => LifecycleStatus::Queued,
            Self::Start => LifecycleStatus::Active,
            Self::Complete => LifecycleStatus::Completed,
            Self::Fail => LifecycleStatus::Failed,
        }
    }
}

/// Typed payload stored when a task phase completes.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Evaluation {
        verdict: EvaluationVerdict,
        result: serde_json::Value,
    },
    Implementation {
        result: serde_json::Value,
    },
}

impl PhaseOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Evaluation { .. } => Phase::Evaluation,
            Self::Implementation { .. } => Phase::Implementation,
        }
    }
}

/// Apply one transition inside an already-held database lock.
pub fn apply(
    db: &FlowDb,
    subject: Subject,
    transition: Transition,
    now: DateTime<Utc>,
) -> anyhow::Result<LifecycleStatus> {
    let to = transition.target();
    if db.compare_and_set_status(subject, transition.allowed_from(), to, now)? {
        debug!(%subject, phase = %subject.phase(), ?transition, "status transition");
        return Ok(to);
    }
    match db.get_status(subject)? {
        Some(from) => Err(LifecycleError::InvalidTransition {
            subject: subject.to_string(),
            phase: subject.phase(),
            from,
            to,
        }
        .into()),
        None => Err(not_found(subject).into()),
    }
}

fn not_found(subject: Subject) -> LifecycleError {
    match subject {
        Subject::Source(id) => LifecycleError::TaskSourceNotFound { id },
        Subject::Task { id, .. } => LifecycleError::TaskNotFound { id },
    }
}

/// Recover the typed error from a `DbHandle::call` result.
fn lift(err: anyhow::Error) -> LifecycleError {
    match err.downcast::<LifecycleError>() {
        Ok(domain) => domain,
        Err(other) => LifecycleError::Database(other),
    }
}

fn check_ready(task: &Task) -> Result<(), LifecycleError> {
    if task.is_ready_for_implementation() {
        return Ok(());
    }
    let evaluation = match task.evaluation_verdict {
        Some(verdict) if task.ai_evaluation_status == LifecycleStatus::Completed => {
            format!("completed with verdict {}", verdict.as_str())
        }
        _ => task.ai_evaluation_status.label(Phase::Evaluation).to_string(),
    };
    Err(LifecycleError::NotReady {
        task_id: task.id,
        evaluation,
    })
}

/// Async front-end over the status machine.
#[derive(Clone)]
pub struct LifecycleTracker {
    db: DbHandle,
}

impl LifecycleTracker {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn transition(
        &self,
        subject: Subject,
        transition: Transition,
    ) -> Result<LifecycleStatus, LifecycleError> {
        self.db
            .call(move |db| apply(db, subject, transition, Utc::now()))
            .await
            .map_err(lift)
    }

    pub async fn status(&self, subject: Subject) -> Result<LifecycleStatus, LifecycleError> {
        self.db
            .call(move |db| db.get_status(subject))
            .await
            .map_err(LifecycleError::Database)?
            .ok_or_else(|| not_found(subject))
    }

    pub async fn task(&self, task_id: i64) -> Result<Task, LifecycleError> {
        self.db
            .call(move |db| db.get_task(task_id))
            .await
            .map_err(LifecycleError::Database)?
            .ok_or(LifecycleError::TaskNotFound { id: task_id })
    }

    /// Enqueue implementation, rejecting tasks whose evaluation is not
    /// completed with a `ready` verdict. A rejection has no side effects.
    pub async fn enqueue_implementation(&self, task_id: i64) -> Result<(), LifecycleError> {
        self.db
            .call(move |db| {
                let task = db
                    .get_task(task_id)?
                    .ok_or(LifecycleError::TaskNotFound { id: task_id })?;
                check_ready(&task)?;
                apply(
                    db,
                    Subject::Task {
                        id: task_id,
                        phase: Phase::Implementation,
                    },
                    Transition::Enqueue,
                    Utc::now(),
                )?;
                Ok(())
            })
            .await
            .map_err(lift)
    }

    /// Advance a task phase to completed (starting it first if a broker
    /// worker answered before anyone marked it active) and store the result.
    pub async fn complete(&self, task_id: i64, outcome: PhaseOutcome) -> Result<Task, LifecycleError> {
        self.db
            .call(move |db| {
                let subject = Subject::Task {
                    id: task_id,
                    phase: outcome.phase(),
                };
                let now = Utc::now();
                if db.get_status(subject)? == Some(LifecycleStatus::Queued) {
                    apply(db, subject, Transition::Start, now)?;
                }
                apply(db, subject, Transition::Complete, now)?;
                match &outcome {
                    PhaseOutcome::Evaluation { verdict, result } => {
                        db.set_evaluation_outcome(task_id, *verdict, result)?
                    }
                    PhaseOutcome::Implementation { result } => {
                        db.set_implementation_result(task_id, result)?
                    }
                }
                db.get_task(task_id)?
                    .ok_or_else(|| LifecycleError::TaskNotFound { id: task_id }.into())
            })
            .await
            .map_err(lift)
    }

    /// Mark a phase failed and record why: `last_error` on tasks,
    /// `last_sync_error` on task sources.
    pub async fn fail(&self, subject: Subject, error: String) -> Result<(), LifecycleError> {
        self.db
            .call(move |db| {
                apply(db, subject, Transition::Fail, Utc::now())?;
                match subject {
                    Subject::Source(id) => db.record_sync_error(id, &error)?,
                    Subject::Task { id, .. } => db.set_last_error(id, &error)?,
                }
                Ok(())
            })
            .await
            .map_err(lift)
    }
}
