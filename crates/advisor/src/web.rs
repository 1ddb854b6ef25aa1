//! HTTP surface: a thin axum router over [`IrrigationService`] operations.
//! Errors render as `{error, message}` with a status chosen by error family.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{CoreError, Reason};
use crate::ingest::RawSample;
use crate::lifecycle::{Completion, RunRequest};
use crate::model::RunStatus;
use crate::service::IrrigationService;

type AppState = Arc<IrrigationService>;
type ApiResult<T> = Result<Json<T>, CoreError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/devices/{id}/readings", post(post_reading))
        .route("/api/farms/{id}/recommendation", get(get_recommendation))
        .route("/api/farms/{id}/irrigation", post(start_irrigation))
        .route("/api/farms/{id}/runs", get(list_runs))
        .route("/api/farms/{id}/alerts", get(list_alerts))
        .route("/api/farms/{id}/readings", get(list_readings))
        .route("/api/irrigation/{id}/complete", post(complete_run))
        .route("/api/irrigation/{id}/fail", post(fail_run))
        .route("/api/irrigation/{id}/cancel", post(cancel_run))
        .route("/api/alerts/{id}/ack", post(ack_alert))
        .with_state(service)
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Conflict { .. } => StatusCode::CONFLICT,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Dependency { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Invariant { .. } => StatusCode::BAD_REQUEST,
            CoreError::Storage(e) => {
                error!("storage failure: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "error": self.code(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(svc): State<AppState>) -> impl IntoResponse {
    let st = svc.activity().read().await;
    Json(st.to_status())
}

async fn get_device(
    State(svc): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::model::Device> {
    Ok(Json(svc.device(&id).await?))
}

async fn post_reading(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Json(sample): Json<RawSample>,
) -> Result<impl IntoResponse, CoreError> {
    let reading = svc.ingest_reading(&id, sample).await?;
    Ok((StatusCode::CREATED, Json(reading)))
}

async fn get_recommendation(
    State(svc): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::recommend::Recommendation> {
    Ok(Json(svc.get_recommendation(&id).await?))
}

async fn start_irrigation(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let run = svc.start_irrigation(&id, req).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    status: Option<String>,
}

async fn list_runs(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<RunsQuery>,
) -> ApiResult<Vec<crate::model::IrrigationRun>> {
    let status = match q.status.as_deref() {
        None => None,
        Some(s) => Some(RunStatus::parse(s).ok_or_else(|| {
            CoreError::validation(Reason::OutOfRange, format!("unknown run status '{s}'"))
        })?),
    };
    Ok(Json(svc.runs(&id, status).await?))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    pending: bool,
}

async fn list_alerts(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<AlertsQuery>,
) -> ApiResult<Vec<crate::model::Alert>> {
    Ok(Json(svc.list_alerts(&id, q.pending).await?))
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    #[serde(default = "default_readings_limit")]
    limit: usize,
}

fn default_readings_limit() -> usize {
    50
}

async fn list_readings(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ReadingsQuery>,
) -> ApiResult<Vec<crate::model::Reading>> {
    Ok(Json(svc.recent_readings(&id, q.limit).await?))
}

async fn complete_run(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Json(completion): Json<Completion>,
) -> ApiResult<crate::model::IrrigationRun> {
    Ok(Json(svc.complete_irrigation(&id, completion).await?))
}

#[derive(Debug, Deserialize)]
struct FailBody {
    reason: String,
}

async fn fail_run(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FailBody>,
) -> ApiResult<crate::model::IrrigationRun> {
    Ok(Json(svc.fail_irrigation(&id, &body.reason).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_run(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> ApiResult<crate::model::IrrigationRun> {
    Ok(Json(svc.cancel_irrigation(&id, body.reason.as_deref()).await?))
}

async fn ack_alert(
    State(svc): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::model::Alert> {
    Ok(Json(svc.acknowledge_alert(&id).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(service: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(service)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
