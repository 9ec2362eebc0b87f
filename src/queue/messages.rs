//! JSON wire schemas for every queue. All fields are camelCase.

use serde::{Deserialize, Serialize};

use crate::models::{EvaluationVerdict, Provider, Task, TaskSource, TaskType};

/// Body of a task-sync message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub task_source_id: i64,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// Body of a task-eval or task-impl message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub id: i64,
    pub external_issue_id: String,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub external_state: String,
}

impl From<&Task> for TaskDescriptor {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            external_issue_id: task.external_issue_id.clone(),
            title: task.title.clone(),
            body: task.body.clone(),
            url: task.url.clone(),
            external_state: task.external_state.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryDescriptor {
    pub provider: Provider,
    /// `owner/repo`
    pub name: String,
    pub clone_url: String,
}

impl From<&TaskSource> for RepositoryDescriptor {
    fn from(source: &TaskSource) -> Self {
        let clone_url = match source.provider {
            Provider::Github => format!("https://github.com/{}.git", source.repository),
        };
        Self {
            provider: source.provider,
            name: source.repository.clone(),
            clone_url,
        }
    }
}

/// Names a secret the worker resolves locally; never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialHandle {
    pub provider: Provider,
    pub kind: String,
    /// e.g. `env:GITHUB_TOKEN`
    pub reference: String,
}

/// Everything a worker needs to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub task: TaskDescriptor,
    pub repository: RepositoryDescriptor,
    /// Stored evaluation result, present for implementation work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<serde_json::Value>,
    #[serde(default)]
    pub credentials: Vec<CredentialHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTaskMessage {
    pub correlation_id: String,
    pub session_id: String,
    pub task_type: TaskType,
    pub context: TaskContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub verdict: EvaluationVerdict,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationResult {
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
}

/// Typed result; exactly the field matching the task type is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<ImplementationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerError {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for WorkerError {}

impl WorkerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponseMessage {
    pub correlation_id: String,
    pub session_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkerResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl WorkerResponseMessage {
    pub fn success(task: &WorkerTaskMessage, result: WorkerResult, metadata: ExecutionMetadata) -> Self {
        Self {
            correlation_id: task.correlation_id.clone(),
            session_id: task.session_id.clone(),
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
            metadata,
        }
    }

    pub fn failure(
        task: &WorkerTaskMessage,
        status: ResponseStatus,
        error: WorkerError,
        metadata: ExecutionMetadata,
    ) -> Self {
        Self {
            correlation_id: task.correlation_id.clone(),
            session_id: task.session_id.clone(),
            status,
            result: None,
            error: Some(error),
            metadata,
        }
    }

    /// `code: message` for the task's `last_error`.
    pub fn error_text(&self) -> String {
        match &self.error {
            Some(error) => error.to_string(),
            None => format!("{}: no error detail", self.status.as_str().to_uppercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_request_wire_shape() {
        let msg = SyncRequest {
            task_source_id: 4,
            provider: Provider::Github,
            attempt: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"taskSourceId": 4, "provider": "github"})
        );
        let parsed: TaskRequest = serde_json::from_value(json!({"taskId": 9, "attempt": 2})).unwrap();
        assert_eq!(parsed.attempt, Some(2));
    }

    #[test]
    fn test_worker_response_parses_from_worker_json() {
        let raw = json!({
            "correlationId": "c-1",
            "sessionId": "s-1",
            "status": "success",
            "result": {"evaluation": {"verdict": "needs_info", "summary": "unclear repro"}},
            "metadata": {"durationMs": 1200, "workerVersion": "0.3.1"}
        });
        let msg: WorkerResponseMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.status, ResponseStatus::Success);
        let evaluation = msg.result.unwrap().evaluation.unwrap();
        assert_eq!(evaluation.verdict, EvaluationVerdict::NeedsInfo);
        assert_eq!(msg.metadata.duration_ms, 1200);
    }

    #[test]
    fn test_error_text_joins_code_and_message() {
        let msg: WorkerResponseMessage = serde_json::from_value(json!({
            "correlationId": "c",
            "sessionId": "s",
            "status": "error",
            "error": {"code": "AGENT_CRASH", "message": "exit 137"}
        }))
        .unwrap();
        assert_eq!(msg.error_text(), "AGENT_CRASH: exit 137");

        let timeout: WorkerResponseMessage = serde_json::from_value(json!({
            "correlationId": "c",
            "sessionId": "s",
            "status": "timeout"
        }))
        .unwrap();
        assert_eq!(timeout.error_text(), "TIMEOUT: no error detail");
    }

    #[test]
    fn test_repository_descriptor_clone_url() {
        let source = TaskSource {
            id: 1,
            name: "web".into(),
            provider: Provider::Github,
            repository: "acme/web".into(),
            filter: None,
            sync_status: crate::models::LifecycleStatus::Pending,
            sync_status_updated_at: chrono::Utc::now(),
            last_synced_at: None,
            last_sync_error: None,
            created_at: chrono::Utc::now(),
        };
        let repo = RepositoryDescriptor::from(&source);
        assert_eq!(repo.clone_url, "https://github.com/acme/web.git");
    }
}
