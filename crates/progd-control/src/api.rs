//! HTTP handlers for `/api/*`.

use axum::{
    Extension, Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use progd_process::{
    BatchReport, LogTail, ProcessMemory, Program, ProgramDraft, ProgramMemory, ProgramUpdate,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    request_meta::RequestMeta,
    state::AppState,
};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn body<T>(meta: &RequestMeta, body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(v)| v)
        .map_err(|rej| ApiError::from_json_rejection(meta, rej))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now(),
    })
}

pub async fn list_programs(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<Program>>> {
    let programs = state
        .supervisor
        .get_all()
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(programs))
}

pub async fn create_program(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    draft: Result<Json<ProgramDraft>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let draft = body(&meta, draft)?;
    let program = state
        .supervisor
        .add(draft)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok((StatusCode::CREATED, Json(program)))
}

pub async fn get_program(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<Json<Program>> {
    let program = state
        .supervisor
        .get_by_id(&id)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(program))
}

pub async fn update_program(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
    update: Result<Json<ProgramUpdate>, JsonRejection>,
) -> ApiResult<Json<Program>> {
    let update = body(&meta, update)?;
    let program = state
        .supervisor
        .update(&id, update)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(program))
}

pub async fn delete_program(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .supervisor
        .delete(&id)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_program(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<Json<Program>> {
    let program = state
        .supervisor
        .start(&id)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(program))
}

pub async fn stop_program(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<Json<Program>> {
    let program = state
        .supervisor
        .stop(&id)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(program))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub ids: Vec<String>,
}

fn batch_ids(meta: &RequestMeta, req: BatchRequest) -> ApiResult<Vec<String>> {
    let ids: Vec<String> = req
        .ids
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if ids.is_empty() {
        return Err(ApiError::bad_request(meta, "empty_ids", "ids must not be empty"));
    }
    Ok(ids)
}

pub async fn batch_start(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    req: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Json<BatchReport>> {
    let ids = batch_ids(&meta, body(&meta, req)?)?;
    Ok(Json(state.supervisor.batch_start(&ids).await))
}

pub async fn batch_stop(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    req: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Json<BatchReport>> {
    let ids = batch_ids(&meta, body(&meta, req)?)?;
    Ok(Json(state.supervisor.batch_stop(&ids).await))
}

pub async fn status_all(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<Program>>> {
    let programs = state
        .supervisor
        .get_status_all()
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(programs))
}

pub async fn status_one(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<Json<Program>> {
    let program = state
        .supervisor
        .get_status(&id)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(program))
}

pub async fn refresh(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<Program>>> {
    let programs = state
        .supervisor
        .refresh_all()
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(programs))
}

pub async fn running(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<Program>>> {
    let programs = state
        .supervisor
        .get_running()
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(programs))
}

pub async fn stopped(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<Program>>> {
    let programs = state
        .supervisor
        .get_stopped()
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(programs))
}

pub async fn programs_memory(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<ProgramMemory>>> {
    let programs = state
        .supervisor
        .get_with_memory()
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(programs))
}

pub async fn program_memory(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProcessMemory>> {
    let memory = state
        .supervisor
        .program_memory(&id)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(memory))
}

#[derive(Debug, Serialize)]
pub struct SystemMemoryView {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_gb: f64,
    pub total_display: String,
    pub available_display: String,
    pub used_display: String,
    pub used_percent_display: String,
}

impl From<progd_process::SystemMemory> for SystemMemoryView {
    fn from(m: progd_process::SystemMemory) -> Self {
        let gb = |bytes: u64| bytes as f64 / GIB;
        Self {
            total: m.total,
            available: m.available,
            used: m.used,
            used_percent: m.used_percent,
            total_gb: gb(m.total),
            available_gb: gb(m.available),
            used_gb: gb(m.used),
            total_display: format!("{:.2} GB", gb(m.total)),
            available_display: format!("{:.2} GB", gb(m.available)),
            used_display: format!("{:.2} GB", gb(m.used)),
            used_percent_display: format!("{:.1}%", m.used_percent),
        }
    }
}

pub async fn system_memory(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<SystemMemoryView>> {
    let memory = state
        .supervisor
        .system_memory()
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(memory.into()))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

pub async fn program_logs(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
    Query(q): Query<LogQuery>,
) -> ApiResult<Json<LogTail>> {
    let limit = q.limit.unwrap_or(progd_supervisor::log_sink::DEFAULT_TAIL_LINES);
    let tail = state
        .supervisor
        .log_tail(&id, limit)
        .await
        .map_err(|e| ApiError::from_supervisor(&meta, e))?;
    Ok(Json(tail))
}
