//! HTTP surface for poll-mode workers.

pub mod server;

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{debug, error};

use crate::dispatch::PollService;
use crate::dispatch::poll::{FinishRequest, HeartbeatRequest, PostMessageRequest};
use crate::errors::{DispatchError, LifecycleError};
use crate::models::SdkWorker;

pub use server::{build_router, start_server};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub poll: PollService,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error in worker api");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let msg = err.to_string();
        match err {
            DispatchError::SessionNotFound(_) => ApiError::NotFound(msg),
            DispatchError::CorrelationMismatch { .. } | DispatchError::NotClaimed { .. } => {
                ApiError::Conflict(msg)
            }
            DispatchError::MissingResult { .. } => ApiError::BadRequest(msg),
            DispatchError::Lifecycle(inner) => inner.into(),
            DispatchError::Queue(_) | DispatchError::Database(_) => ApiError::Internal(msg),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let msg = err.to_string();
        match err {
            LifecycleError::TaskNotFound { .. } | LifecycleError::TaskSourceNotFound { .. } => {
                ApiError::NotFound(msg)
            }
            LifecycleError::InvalidTransition { .. } | LifecycleError::NotReady { .. } => {
                ApiError::Conflict(msg)
            }
            LifecycleError::Database(_) => ApiError::Internal(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/worker/heartbeat", post(heartbeat))
        .route("/api/worker/next", get(next_task))
        .route("/api/worker/message", post(post_message))
        .route("/api/worker/finish", post(finish))
        .route("/api/worker/tasks/{id}/messages", get(task_messages))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Resolve the `Authorization: Bearer <token>` header to a worker.
async fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<SdkWorker, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    state
        .poll
        .authenticate(token)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::Unauthorized("Unknown worker token".into()))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// The body is optional; an empty POST is an `online` heartbeat.
async fn heartbeat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let worker = authenticate(&state, &headers).await?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid heartbeat body: {}", e)))?
    };
    let worker = state.poll.heartbeat(&worker, request).await?;
    Ok(Json(worker))
}

async fn next_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let worker = authenticate(&state, &headers).await?;
    let next = state.poll.next(&worker).await?;
    if next.task.is_none() {
        debug!(worker_id = worker.id, "no work available");
    }
    Ok(Json(next))
}

async fn post_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<PostMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = authenticate(&state, &headers).await?;
    let Json(request) = payload?;
    let message = state.poll.post_message(&worker, request).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn finish(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<FinishRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = authenticate(&state, &headers).await?;
    let Json(request) = payload?;
    let task = state.poll.finish(&worker, request).await?;
    Ok(Json(task))
}

async fn task_messages(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers).await?;
    let messages = state.poll.messages(id).await?;
    Ok(Json(messages))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::poll::register_worker;
    use crate::dispatch::{PollDispatcher, ResponseHandler, TaskDispatch, open_session};
    use crate::lifecycle::{LifecycleTracker, Transition};
    use crate::models::{
        ExternalIssue, LifecycleStatus, Phase, Provider, Subject, Task, TaskMessage, TaskType,
        WorkerStatus,
    };
    use crate::store::DbHandle;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        db: DbHandle,
        token: String,
    }

    async fn test_app() -> TestApp {
        let db = DbHandle::in_memory().unwrap();
        let tracker = LifecycleTracker::new(db.clone());
        let poll = PollService::new(db.clone(), ResponseHandler::new(db.clone(), tracker));
        let (_, token) = register_worker(&db, "w1", vec![TaskType::Evaluation])
            .await
            .unwrap();
        let state = Arc::new(AppState { poll });
        TestApp {
            router: api_router().with_state(state),
            db,
            token,
        }
    }

    /// A synced task with an evaluation parked for poll workers.
    async fn park_evaluation(db: &DbHandle) -> i64 {
        let task_id = db
            .call(|db| {
                let source = db.create_task_source("web", Provider::Github, "o/r", None, Utc::now())?;
                let issue = ExternalIssue {
                    external_id: "7".into(),
                    title: "Crash on save".into(),
                    body: String::new(),
                    url: None,
                    state: "open".into(),
                    updated_at: Utc::now(),
                };
                Ok(db.upsert_task(source.id, &issue, Utc::now())?.0.id)
            })
            .await
            .unwrap();
        LifecycleTracker::new(db.clone())
            .transition(
                Subject::Task {
                    id: task_id,
                    phase: Phase::Evaluation,
                },
                Transition::Enqueue,
            )
            .await
            .unwrap();
        let dispatcher = PollDispatcher::new(db.clone());
        let message = open_session(
            db,
            task_id,
            TaskType::Evaluation,
            dispatcher.mode(),
            "env:GITHUB_TOKEN".into(),
        )
        .await
        .unwrap();
        dispatcher.dispatch(&message).await.unwrap();
        task_id
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_needs_no_token() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_or_unknown_token_is_401() {
        let app = test_app().await;
        let response = app
            .router
            .clone()
            .oneshot(request("GET", "/api/worker/next", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .router
            .oneshot(request("GET", "/api/worker/next", Some("tfw_nope"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Unknown worker token");
    }

    #[tokio::test]
    async fn test_heartbeat_accepts_empty_body() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(request("POST", "/api/worker/heartbeat", Some(&app.token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let worker: SdkWorker = body_json(response.into_body()).await;
        assert_eq!(worker.status, WorkerStatus::Online);
        assert!(worker.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_next_is_empty_without_work() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(request("GET", "/api/worker/next", Some(&app.token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["task"].is_null());
        assert!(body["context"].is_null());
    }

    #[tokio::test]
    async fn test_claim_message_and_finish() {
        let app = test_app().await;
        let task_id = park_evaluation(&app.db).await;

        let response = app
            .router
            .clone()
            .oneshot(request("GET", "/api/worker/next", Some(&app.token), None))
            .await
            .unwrap();
        let next: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(next["task"]["id"], task_id);
        assert_eq!(next["context"]["taskType"], "evaluation");

        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/worker/message",
                Some(&app.token),
                Some(serde_json::json!({
                    "taskId": task_id,
                    "messageType": "progress",
                    "payload": {"step": "reading"}
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .router
            .clone()
            .oneshot(request(
                "GET",
                &format!("/api/worker/tasks/{}/messages", task_id),
                Some(&app.token),
                None,
            ))
            .await
            .unwrap();
        let messages: Vec<TaskMessage> = body_json(response.into_body()).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload["step"], "reading");

        let response = app
            .router
            .oneshot(request(
                "POST",
                "/api/worker/finish",
                Some(&app.token),
                Some(serde_json::json!({
                    "taskId": task_id,
                    "status": "success",
                    "result": {"evaluation": {"verdict": "ready", "summary": "clear repro"}}
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task: Task = body_json(response.into_body()).await;
        assert_eq!(task.ai_evaluation_status, LifecycleStatus::Completed);
        assert!(task.is_ready_for_implementation());
    }

    #[tokio::test]
    async fn test_finish_without_claim_is_409() {
        let app = test_app().await;
        let task_id = park_evaluation(&app.db).await;
        let response = app
            .router
            .oneshot(request(
                "POST",
                "/api/worker/finish",
                Some(&app.token),
                Some(serde_json::json!({"taskId": task_id, "status": "error",
                    "error": {"code": "X", "message": "y"}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400_and_unknown_task_is_404() {
        let app = test_app().await;
        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/worker/message",
                Some(&app.token),
                Some(serde_json::json!({"taskId": "not-a-number"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .router
            .oneshot(request("GET", "/api/worker/tasks/999/messages", Some(&app.token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
