use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three pipeline phases a task (or task source) moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Sync,
    Evaluation,
    Implementation,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Evaluation => "evaluation",
            Self::Implementation => "implementation",
        }
    }

    /// Name of the active state for this phase.
    pub fn active_label(&self) -> &'static str {
        match self {
            Self::Sync => "syncing",
            Self::Evaluation => "evaluating",
            Self::Implementation => "implementing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "evaluation" => Ok(Self::Evaluation),
            "implementation" => Ok(Self::Implementation),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Generic lifecycle shared by all three phases:
/// `pending → queued → <active> → completed | failed`.
///
/// The persisted form of `Active` is phase-specific (`syncing`, `evaluating`,
/// `implementing`); use [`LifecycleStatus::label`] and
/// [`LifecycleStatus::parse_for`] when crossing the storage or wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStatus {
    Pending,
    Queued,
    Active,
    Completed,
    Failed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn label(&self, phase: Phase) -> &'static str {
        match self {
            Self::Active => phase.active_label(),
            other => other.as_str(),
        }
    }

    pub fn parse_for(phase: Phase, s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            s if s == phase.active_label() => Ok(Self::Active),
            _ => Err(format!("Invalid {} status: {}", phase, s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Queued or active: work is in flight somewhere.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Active)
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity whose phase status a transition targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Source(i64),
    Task { id: i64, phase: Phase },
}

impl Subject {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Source(_) => Phase::Sync,
            Self::Task { phase, .. } => *phase,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Source(id) | Self::Task { id, .. } => *id,
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(id) => write!(f, "task source {}", id),
            Self::Task { id, .. } => write!(f, "task {}", id),
        }
    }
}

macro_rules! phase_status_serde {
    ($name:ident, $phase:expr) => {
        pub mod $name {
            use super::{LifecycleStatus, Phase};
            use serde::{Deserialize, Deserializer, Serializer};

            const PHASE: Phase = $phase;

            pub fn serialize<S: Serializer>(
                status: &LifecycleStatus,
                s: S,
            ) -> Result<S::Ok, S::Error> {
                s.serialize_str(status.label(PHASE))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                d: D,
            ) -> Result<LifecycleStatus, D::Error> {
                let raw = String::deserialize(d)?;
                LifecycleStatus::parse_for(PHASE, &raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

phase_status_serde!(sync_status_serde, Phase::Sync);
phase_status_serde!(evaluation_status_serde, Phase::Evaluation);
phase_status_serde!(implementation_status_serde, Phase::Implementation);

/// Outcome of an AI evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationVerdict {
    Ready,
    NeedsInfo,
    NotActionable,
}

impl EvaluationVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::NeedsInfo => "needs_info",
            Self::NotActionable => "not_actionable",
        }
    }
}

impl FromStr for EvaluationVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "needs_info" => Ok(Self::NeedsInfo),
            "not_actionable" => Ok(Self::NotActionable),
            _ => Err(format!("Invalid evaluation verdict: {}", s)),
        }
    }
}

/// External issue tracker backing a task source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Github,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSource {
    pub id: i64,
    pub name: String,
    pub provider: Provider,
    /// `owner/repo` for GitHub.
    pub repository: String,
    /// Provider-side filter, e.g. a label.
    pub filter: Option<String>,
    #[serde(with = "sync_status_serde")]
    pub sync_status: LifecycleStatus,
    pub sync_status_updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_source_id: i64,
    pub external_issue_id: String,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub external_state: String,
    #[serde(with = "sync_status_serde")]
    pub sync_status: LifecycleStatus,
    #[serde(with = "evaluation_status_serde")]
    pub ai_evaluation_status: LifecycleStatus,
    pub evaluation_verdict: Option<EvaluationVerdict>,
    pub evaluation_result: Option<serde_json::Value>,
    #[serde(with = "implementation_status_serde")]
    pub ai_implementation_status: LifecycleStatus,
    pub implementation_result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub sync_status_updated_at: DateTime<Utc>,
    pub evaluation_status_updated_at: DateTime<Utc>,
    pub implementation_status_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn status(&self, phase: Phase) -> LifecycleStatus {
        match phase {
            Phase::Sync => self.sync_status,
            Phase::Evaluation => self.ai_evaluation_status,
            Phase::Implementation => self.ai_implementation_status,
        }
    }

    pub fn status_updated_at(&self, phase: Phase) -> DateTime<Utc> {
        match phase {
            Phase::Sync => self.sync_status_updated_at,
            Phase::Evaluation => self.evaluation_status_updated_at,
            Phase::Implementation => self.implementation_status_updated_at,
        }
    }

    /// Evaluation finished with a `ready` verdict.
    pub fn is_ready_for_implementation(&self) -> bool {
        self.ai_evaluation_status == LifecycleStatus::Completed
            && self.evaluation_verdict == Some(EvaluationVerdict::Ready)
    }
}

/// An item as returned by a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalIssue {
    pub external_id: String,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

/// Per (task source, external issue) bookkeeping written by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStateEntry {
    pub task_source_id: i64,
    pub external_issue_id: String,
    pub issue_updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Kind of work a worker message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Evaluation,
    Implementation,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluation => "evaluation",
            Self::Implementation => "implementation",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Evaluation => Phase::Evaluation,
            Self::Implementation => Phase::Implementation,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evaluation" => Ok(Self::Evaluation),
            "implementation" => Ok(Self::Implementation),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

/// How a session's work reaches its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Broker,
    Poll,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Poll => "poll",
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broker" => Ok(Self::Broker),
            "poll" => Ok(Self::Poll),
            _ => Err(format!("Invalid worker mode: {}", s)),
        }
    }
}

/// One execution attempt of a task on some worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub task_id: i64,
    pub task_type: TaskType,
    pub correlation_id: String,
    pub worker_mode: WorkerMode,
    pub worker_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("Invalid worker status: {}", s)),
        }
    }
}

/// A registered poll-mode worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkWorker {
    pub id: i64,
    pub name: String,
    pub capabilities: Vec<TaskType>,
    pub status: WorkerStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMessageType {
    Progress,
    Log,
    Artifact,
    Error,
}

impl TaskMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Log => "log",
            Self::Artifact => "artifact",
            Self::Error => "error",
        }
    }
}

impl FromStr for TaskMessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "log" => Ok(Self::Log),
            "artifact" => Ok(Self::Artifact),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid task message type: {}", s)),
        }
    }
}

/// Worker → server progress event attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: i64,
    pub task_id: i64,
    pub worker_id: Option<i64>,
    pub message_type: TaskMessageType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
