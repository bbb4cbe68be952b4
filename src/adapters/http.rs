//! Admin HTTP surface for operators and health checks.

use crate::application::backpressure::BackpressureManager;
use crate::application::registry::QueueRegistry;
use crate::domain::backpressure::BackpressureStatus;
use crate::domain::jobs::{Job, JobCounts, JobOptions, JobStatus, TerminalState};
use crate::error::QueueError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<QueueRegistry>,
    pub backpressure: Arc<BackpressureManager>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queues", get(all_stats))
        .route("/queues/:name", get(queue_stats))
        .route("/queues/:name/jobs", post(submit))
        .route("/queues/:name/jobs/:id", get(job_status))
        .route("/queues/:name/pause", post(pause))
        .route("/queues/:name/resume", post(resume))
        .route("/queues/:name/clean", post(clean))
        .route("/backpressure", get(backpressure))
        .route("/backpressure/force", post(force))
        .route("/backpressure/release", post(release))
        .with_state(state)
}

pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            QueueError::UnknownQueue(_) => (StatusCode::NOT_FOUND, "unknown_queue"),
            QueueError::JobNotFound { .. } => (StatusCode::NOT_FOUND, "job_not_found"),
            QueueError::PayloadRejected(_) => (StatusCode::UNPROCESSABLE_ENTITY, "payload_rejected"),
            QueueError::ConnectionUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "connection_unavailable")
            }
            QueueError::Broker { .. } | QueueError::Serialization(_) => {
                error!(error = %self.0, "admin request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "broker_error")
            }
        };
        (
            status,
            Json(json!({
                "error": code,
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let broker = state.registry.ping().await;
    let status = if broker {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "broker": broker,
            "backpressure": state.backpressure.status(),
        })),
    )
}

async fn all_stats(State(state): State<AdminState>) -> ApiResult<BTreeMap<String, JobCounts>> {
    Ok(Json(state.registry.all_stats().await?))
}

async fn queue_stats(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> ApiResult<JobCounts> {
    Ok(Json(state.registry.get_stats(&name).await?))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    job_type: String,
    payload: Value,
    priority: Option<u32>,
    timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    delay_ms: Option<u64>,
}

async fn submit(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let options = JobOptions {
        priority: request.priority,
        timeout: request.timeout_ms.map(Duration::from_millis),
        max_attempts: request.max_attempts,
        delay: request.delay_ms.map(Duration::from_millis),
    };
    let job = state
        .registry
        .submit(&name, &request.job_type, request.payload, options)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn job_status(
    State(state): State<AdminState>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<JobStatus> {
    Ok(Json(state.registry.get_status(&name, &id).await?))
}

async fn pause(State(state): State<AdminState>, Path(name): Path<String>) -> ApiResult<Value> {
    state.registry.pause(&name).await?;
    Ok(Json(json!({ "queue": name, "paused": true })))
}

async fn resume(State(state): State<AdminState>, Path(name): Path<String>) -> ApiResult<Value> {
    state.registry.resume(&name).await?;
    Ok(Json(json!({ "queue": name, "paused": false })))
}

#[derive(Debug, Deserialize)]
struct CleanRequest {
    #[serde(default)]
    grace_ms: u64,
    state: TerminalState,
}

async fn clean(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(request): Json<CleanRequest>,
) -> ApiResult<Value> {
    let removed = state
        .registry
        .clean(&name, Duration::from_millis(request.grace_ms), request.state)
        .await?;
    Ok(Json(json!({ "queue": name, "removed": removed })))
}

async fn backpressure(State(state): State<AdminState>) -> Json<BackpressureStatus> {
    Json(state.backpressure.status())
}

async fn force(State(state): State<AdminState>) -> Json<BackpressureStatus> {
    Json(state.backpressure.force_backpressure().await)
}

async fn release(State(state): State<AdminState>) -> Json<BackpressureStatus> {
    Json(state.backpressure.release_backpressure().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBroker;
    use crate::application::backpressure::BackpressureConfig;
    use crate::domain::policy::QueuePolicy;
    use crate::ports::queue::MockMemorySampler;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, AdminState) {
        let registry = Arc::new(QueueRegistry::new(Arc::new(MemoryBroker::new())));
        registry.create_queue("email", QueuePolicy::default());
        let mut memory = MockMemorySampler::new();
        memory.expect_used_mb().returning(|| Some(64.0));
        let backpressure = Arc::new(BackpressureManager::new(
            BackpressureConfig::default(),
            registry.clone(),
            Arc::new(memory),
        ));
        backpressure.register("email");
        let state = AdminState {
            registry,
            backpressure,
        };
        (router(state.clone()), state)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_reports_broker_and_backpressure() {
        let (app, _) = app();
        let (status, body) = send(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["broker"], json!(true));
        assert_eq!(body["backpressure"]["active"], json!(false));
    }

    #[tokio::test]
    async fn test_unknown_queue_is_404() {
        let (app, _) = app();
        let (status, body) = send(app, "GET", "/queues/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("unknown_queue"));
    }

    #[tokio::test]
    async fn test_submit_then_inspect() {
        let (app, _) = app();
        let (status, job) = send(
            app.clone(),
            "POST",
            "/queues/email/jobs",
            Some(json!({
                "job_type": "send",
                "payload": {"to": "ops@example.com", "template": "welcome"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = job["id"].as_str().unwrap().to_string();

        let (status, body) = send(app.clone(), "GET", &format!("/queues/email/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("waiting"));

        let (_, stats) = send(app, "GET", "/queues", None).await;
        assert_eq!(stats["email"]["waiting"], json!(1));
    }

    #[tokio::test]
    async fn test_null_payload_is_rejected() {
        let (app, _) = app();
        let (status, body) = send(
            app,
            "POST",
            "/queues/email/jobs",
            Some(json!({"job_type": "send", "payload": null})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], json!("payload_rejected"));
    }

    #[tokio::test]
    async fn test_payload_not_matching_family_is_rejected() {
        let (app, state) = app();
        let (status, body) = send(
            app,
            "POST",
            "/queues/email/jobs",
            Some(json!({"job_type": "send", "payload": {"garbage": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], json!("payload_rejected"));
        assert_eq!(state.registry.get_stats("email").await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume_queue() {
        let (app, state) = app();
        let (status, _) = send(app.clone(), "POST", "/queues/email/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.registry.is_paused("email").await.unwrap());

        send(app, "POST", "/queues/email/resume", None).await;
        assert!(!state.registry.is_paused("email").await.unwrap());
    }

    #[tokio::test]
    async fn test_force_and_release_backpressure() {
        let (app, state) = app();
        let (_, body) = send(app.clone(), "POST", "/backpressure/force", None).await;
        assert_eq!(body["active"], json!(true));
        assert_eq!(body["reason"], json!("manual"));
        assert!(state.registry.is_paused("email").await.unwrap());

        let (_, body) = send(app.clone(), "POST", "/backpressure/release", None).await;
        assert_eq!(body["active"], json!(false));
        assert!(!state.registry.is_paused("email").await.unwrap());

        let (_, body) = send(app, "GET", "/backpressure", None).await;
        assert_eq!(body["reason"], json!("none"));
    }

    #[tokio::test]
    async fn test_clean_requires_terminal_state() {
        let (app, _) = app();
        let (status, _) = send(
            app.clone(),
            "POST",
            "/queues/email/clean",
            Some(json!({"grace_ms": 0, "state": "waiting"})),
        )
        .await;
        assert!(status.is_client_error());

        let (status, body) = send(
            app,
            "POST",
            "/queues/email/clean",
            Some(json!({"grace_ms": 0, "state": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], json!([]));
    }
}
