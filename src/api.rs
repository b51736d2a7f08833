//! HTTP API.
//!
//! Read endpoints answer from the snapshot cache and always return 200 with
//! a freshness envelope; a monitoring failure is reported inside the body so
//! it never looks like an outage of the monitored service. Ingest endpoints
//! feed the in-process producers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::Served;
use crate::engine::{EngineStatus, Monitor};
use crate::error::{MonitorError, MonitorResult};
use crate::error_trend::ErrorTrend;
use crate::health::{HealthSnapshot, ResourceReadings};
use crate::performance::{Outcome, PerformanceSummary};
use crate::predict::QueuePrediction;
use crate::source::JobRecord;
use crate::stuck::StuckJobFlag;
use crate::types::Timestamp;

type AppState = Arc<Monitor>;

pub fn router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/performance", get(performance))
        .route("/resources", get(resources))
        .route("/errors", get(errors))
        .route("/stuck-jobs", get(stuck_jobs))
        .route("/queue-prediction", get(queue_prediction))
        .route("/status", get(status))
        .route("/ingest/outcome", post(ingest_outcome))
        .route("/ingest/error", post(ingest_error))
        .route("/ingest/job", post(ingest_job))
        .route("/ingest/queue", post(ingest_queue))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(monitor)
}

/// Serve `router` on `listener` until `shutdown` is cancelled, draining
/// in-flight requests.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> MonitorResult<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!(target: "vigil::api", "HTTP API stopped");
    Ok(())
}

// ----------------------------------------------------------------------------
// Read Handlers
// ----------------------------------------------------------------------------

async fn health(State(monitor): State<AppState>) -> Json<Served<HealthSnapshot>> {
    Json(monitor.health().await)
}

async fn performance(State(monitor): State<AppState>) -> Json<Served<PerformanceSummary>> {
    Json(monitor.performance().await)
}

async fn resources(State(monitor): State<AppState>) -> Json<Served<ResourceReadings>> {
    Json(monitor.resources().await)
}

async fn errors(State(monitor): State<AppState>) -> Json<Served<ErrorTrend>> {
    Json(monitor.error_trend().await)
}

async fn stuck_jobs(State(monitor): State<AppState>) -> Json<Served<Vec<StuckJobFlag>>> {
    Json(monitor.stuck_jobs().await)
}

async fn queue_prediction(State(monitor): State<AppState>) -> Json<Served<QueuePrediction>> {
    Json(monitor.queue_prediction().await)
}

async fn status(State(monitor): State<AppState>) -> Json<EngineStatus> {
    Json(monitor.status())
}

// ----------------------------------------------------------------------------
// Ingest Handlers
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OutcomeBody {
    duration_ms: f64,
    outcome: Outcome,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    timestamp: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
struct QueueDepthBody {
    queue: String,
    depth: u64,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
}

async fn ingest_outcome(
    State(monitor): State<AppState>,
    Json(body): Json<OutcomeBody>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    monitor.record_outcome(body.duration_ms, body.outcome)?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
}

async fn ingest_error(
    State(monitor): State<AppState>,
    Json(body): Json<ErrorBody>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let accepted = monitor.record_error(body.message, body.timestamp)?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted })))
}

async fn ingest_job(
    State(monitor): State<AppState>,
    Json(job): Json<JobRecord>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let feed = monitor.feed().ok_or(ApiError::FeedUnavailable)?;
    feed.upsert_job(job);
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
}

async fn ingest_queue(
    State(monitor): State<AppState>,
    Json(body): Json<QueueDepthBody>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let feed = monitor.feed().ok_or(ApiError::FeedUnavailable)?;
    feed.set_queue_depth(body.queue, body.depth);
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum ApiError {
    Monitor(MonitorError),
    /// Job and queue state comes from an external store
    FeedUnavailable,
}

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        ApiError::Monitor(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, category, message) = match self {
            ApiError::Monitor(e) => {
                let status = match &e {
                    MonitorError::InvalidSample { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    MonitorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.category(), e.to_string())
            }
            ApiError::FeedUnavailable => (
                StatusCode::NOT_FOUND,
                "feed",
                "job and queue state is read from an external store".to_string(),
            ),
        };
        (status, Json(json!({ "error": message, "category": category }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Collaborators;
    use crate::source::{InMemoryBackend, JobState};

    fn app() -> (Router, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let monitor = Monitor::new(EngineConfig::default(), Collaborators::in_memory(backend.clone())).unwrap();
        (router(Arc::new(monitor)), backend)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_health_envelope() {
        let (app, _) = app();
        let (status, body) = get_json(&app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["overall_status"], "healthy");
        assert!(body["computed_at"].is_string());
        assert_eq!(body["stale"], false);
        assert!(body["error"].is_null());
        assert_eq!(body["data"]["per_subsystem"]["cpu"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_empty_performance_reports_null_rates() {
        let (app, _) = app();
        let (status, body) = get_json(&app, "/performance").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["sample_count"], 0);
        assert!(body["data"]["success_rate"].is_null());
    }

    #[tokio::test]
    async fn test_ingest_outcome_then_read() {
        let (app, _) = app();
        let status = post_json(&app, "/ingest/outcome", json!({"duration_ms": 40.0, "outcome": "error"})).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, body) = get_json(&app, "/performance").await;
        assert_eq!(body["data"]["sample_count"], 1);
        assert_eq!(body["data"]["error_rate"], 1.0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_negative_duration() {
        let (app, _) = app();
        let status = post_json(&app, "/ingest/outcome", json!({"duration_ms": -4.0, "outcome": "success"})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_future_dated_error_is_not_counted() {
        let (app, _) = app();
        let tomorrow = Timestamp::now().add_duration(Duration::from_secs(86_400));
        let status = post_json(&app, "/ingest/error", json!({"message": "skewed clock", "timestamp": tomorrow})).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, body) = get_json(&app, "/errors").await;
        assert_eq!(body["data"]["total_24h"], 0);
    }

    #[tokio::test]
    async fn test_ingest_job_rejects_out_of_range_timestamp() {
        let (app, backend) = app();
        let body = json!({
            "job_id": "far-future",
            "state": "processing",
            "enqueued_at": "2024-05-01T10:00:00Z",
            "last_heartbeat_at": "2300-01-01T00:00:00Z"
        });
        let status = post_json(&app, "/ingest/job", body).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(backend.job_count(), 0);
    }

    #[tokio::test]
    async fn test_ingested_job_shows_up_stuck() {
        let (app, backend) = app();
        let now = Timestamp::now();
        let job = JobRecord {
            job_id: "export-7".into(),
            job_class: None,
            state: JobState::Processing,
            enqueued_at: now.sub_duration(Duration::from_secs(700)),
            started_at: Some(now.sub_duration(Duration::from_secs(600))),
            last_heartbeat_at: Some(now.sub_duration(Duration::from_secs(360))),
            completed_at: None,
        };
        let status = post_json(&app, "/ingest/job", serde_json::to_value(&job).unwrap()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(backend.job_count(), 1);

        let (status, body) = get_json(&app, "/stuck-jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["job_id"], "export-7");
        assert_eq!(body["data"][0]["reason"], "no_heartbeat");
    }

    #[tokio::test]
    async fn test_queue_prediction_and_status() {
        let (app, _) = app();
        let status = post_json(&app, "/ingest/queue", json!({"queue": "default", "depth": 100})).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, body) = get_json(&app, "/queue-prediction").await;
        assert_eq!(body["data"]["queue_depth"], 100);
        assert_eq!(body["data"]["confidence"], "low");
        assert_eq!(body["data"]["capped"], true);

        let (status, body) = get_json(&app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], crate::ENGINE_NAME);
    }
}
