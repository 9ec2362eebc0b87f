//! Typed error hierarchy for the ticketflow orchestration core.
//!
//! Four top-level enums cover the four subsystems:
//! - `QueueError`: broker connection, topology, publish and consume failures
//! - `LifecycleError`: rejected status transitions and gating violations
//! - `SyncError`: task-source synchronization failures
//! - `DispatchError`: worker dispatch and response handling failures

use thiserror::Error;

use crate::models::{LifecycleStatus, Phase};

/// Errors from the message broker layer.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker channel failed: {0}")]
    Channel(String),

    #[error("Failed to declare {name}: {message}")]
    Declare { name: String, message: String },

    #[error("Queue {0} not found")]
    QueueNotFound(String),

    #[error("Publish to {queue} failed: {message}")]
    Publish { queue: String, message: String },

    #[error("Consume from {queue} failed: {message}")]
    Consume { queue: String, message: String },

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Message encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Message decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Delivery stream for {0} ended")]
    StreamEnded(String),
}

/// Errors from the task lifecycle tracker.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Task source {id} not found")]
    TaskSourceNotFound { id: i64 },

    #[error("Invalid {phase} transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        phase: Phase,
        from: LifecycleStatus,
        to: LifecycleStatus,
    },

    #[error("Task {task_id} is not ready for implementation: evaluation is {evaluation}")]
    NotReady { task_id: i64, evaluation: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from a task-source sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Task source {id} not found")]
    SourceNotFound { id: i64 },

    #[error("Unsupported provider '{0}'")]
    UnsupportedProvider(String),

    #[error("Credential unavailable for {provider}: {message}")]
    Credential { provider: String, message: String },

    #[error("Fetch from {provider} failed: {source}")]
    Fetch {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from worker dispatch and response handling.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Correlation id mismatch for session {session_id}")]
    CorrelationMismatch { session_id: String },

    #[error("Response for session {session_id} carries no {expected} result")]
    MissingResult {
        session_id: String,
        expected: &'static str,
    },

    #[error("Task {task_id} is not claimed by worker {worker_id}")]
    NotClaimed { task_id: i64, worker_id: i64 },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}
