//! HTTP handlers for the Pulse platform

use crate::platform::Platform;
use axum::{
    extract::{Json as ExtractJson, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use pulse_common::{AlertStatus, Error, PipelineRequest};
use pulse_inference::is_supported_model;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Application state for handlers
pub type AppState = Arc<Platform>;

const DEFAULT_ALERT_PAGE: i64 = 50;
const MAX_ALERT_PAGE: i64 = 500;

/// Create the router with all endpoints
pub fn create_router(platform: Arc<Platform>) -> Router {
    Router::new()
        .route("/health", get(health))
        // pipeline control
        .route("/pipeline/run", post(run_pipeline))
        .route("/pipeline/active", get(active_pipelines))
        .route("/pipeline/history", get(pipeline_history))
        .route("/pipeline/:id/status", get(pipeline_status))
        .route("/pipeline/:id", delete(cancel_pipeline))
        // inference
        .route("/predict", post(predict))
        .route("/failsafe/status", get(failsafe_status))
        // alerts and analytics
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id/status", post(update_alert_status))
        .route("/analytics/summary", get(analytics_summary))
        .route("/metrics", get(metrics))
        .with_state(platform)
}

/// Error wrapper mapping the platform taxonomy onto HTTP statuses
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": {
                "category": self.0.category(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

async fn health(State(platform): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::json!({
        "status": "ok",
        "uptime_s": platform.uptime_seconds(),
        "circuit_phase": platform.dispatcher().phase(),
        "active_pipelines": platform.orchestrator().active_pipelines().len(),
    });
    if let Some(last_error) = platform.last_error().await {
        body["last_error"] = serde_json::Value::String(last_error);
    }
    Json(body)
}

async fn run_pipeline(
    State(platform): State<AppState>,
    ExtractJson(request): ExtractJson<PipelineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = platform.orchestrator().submit(request)?;
    info!(pipeline_id = %id, "pipeline accepted over http");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "pipeline_id": id })),
    ))
}

async fn pipeline_status(
    State(platform): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match platform.orchestrator().snapshot(id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found("unknown pipeline"),
    }
}

async fn cancel_pipeline(
    State(platform): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match platform.orchestrator().cancel(id) {
        Some(cancelled) => Json(serde_json::json!({ "cancelled": cancelled })).into_response(),
        None => not_found("unknown pipeline"),
    }
}

async fn active_pipelines(State(platform): State<AppState>) -> impl IntoResponse {
    Json(platform.orchestrator().active_pipelines())
}

#[derive(Deserialize)]
struct HistoryQuery {
    since: Option<DateTime<Utc>>,
}

async fn pipeline_history(
    State(platform): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(platform.orchestrator().history(query.since))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PredictRequest {
    text: String,
    #[serde(default)]
    model: Option<String>,
}

async fn predict(
    State(platform): State<AppState>,
    ExtractJson(request): ExtractJson<PredictRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.text.trim().is_empty() {
        return Err(Error::Validation("text must not be empty".into()).into());
    }
    if let Some(model) = &request.model {
        if !is_supported_model(model) {
            return Err(Error::Validation(format!("unknown model {:?}", model)).into());
        }
    }
    let verdict = platform
        .dispatcher()
        .predict(&request.text, request.model.as_deref())
        .await;
    Ok(Json(verdict))
}

async fn failsafe_status(State(platform): State<AppState>) -> impl IntoResponse {
    Json(platform.dispatcher().snapshot())
}

#[derive(Deserialize)]
struct AlertsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_alerts(
    State(platform): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(
            AlertStatus::parse(raw)
                .ok_or_else(|| Error::Validation(format!("unknown alert status {:?}", raw)))?,
        ),
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ALERT_PAGE)
        .clamp(1, MAX_ALERT_PAGE);
    let offset = query.offset.unwrap_or(0).max(0);

    let alerts = platform.store().list_alerts(status, limit, offset).await;
    match alerts {
        Ok(alerts) => Ok(Json(alerts)),
        Err(e) => {
            platform.note_error(e.to_string()).await;
            Err(e.into())
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AlertStatusRequest {
    status: AlertStatus,
    #[serde(default)]
    note: Option<String>,
}

async fn update_alert_status(
    State(platform): State<AppState>,
    Path(id): Path<Uuid>,
    ExtractJson(request): ExtractJson<AlertStatusRequest>,
) -> Result<Response, ApiError> {
    let updated = platform
        .store()
        .update_alert_status(id, request.status, request.note.as_deref())
        .await?;
    if updated {
        Ok(Json(serde_json::json!({ "ok": true })).into_response())
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "ok": false })),
        )
            .into_response())
    }
}

#[derive(Deserialize)]
struct SummaryQuery {
    window_s: Option<u64>,
}

async fn analytics_summary(
    State(platform): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let window = Duration::from_secs(query.window_s.unwrap_or(3600));
    match platform.store().summarize(window).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            warn!(error = %e, "summary query failed");
            platform.note_error(e.to_string()).await;
            Err(e.into())
        }
    }
}

/// Plain-text counter exposition
async fn metrics(State(platform): State<AppState>) -> Response {
    let failsafe = platform.dispatcher().snapshot();
    let stats = platform.orchestrator().stats();

    let mut output = String::new();
    output.push_str(&format!("pulse_uptime_seconds {}\n", platform.uptime_seconds()));
    output.push_str(&format!(
        "pulse_failsafe_total_requests {}\n",
        failsafe.total_requests
    ));
    output.push_str(&format!(
        "pulse_failsafe_model_successes {}\n",
        failsafe.model_successes
    ));
    output.push_str(&format!(
        "pulse_failsafe_model_failures {}\n",
        failsafe.model_failures
    ));
    output.push_str(&format!(
        "pulse_failsafe_fallback_uses {}\n",
        failsafe.fallback_uses
    ));
    output.push_str(&format!(
        "pulse_pipelines_submitted {}\n",
        stats.pipelines_submitted
    ));
    output.push_str(&format!(
        "pulse_pipelines_succeeded {}\n",
        stats.pipelines_succeeded
    ));
    output.push_str(&format!("pulse_pipelines_failed {}\n", stats.pipelines_failed));
    output.push_str(&format!(
        "pulse_pipelines_cancelled {}\n",
        stats.pipelines_cancelled
    ));
    output.push_str(&format!("pulse_items_scraped {}\n", stats.items_scraped));
    output.push_str(&format!("pulse_items_persisted {}\n", stats.items_persisted));
    output.push_str(&format!("pulse_alerts_raised {}\n", stats.alerts_raised));

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        output,
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": { "message": message } })),
    )
        .into_response()
}
