//! Job lifecycle, review, and capture-edit endpoints.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use drumsheet_core::geometry::Quad;
use drumsheet_core::manifest::Manifest;
use drumsheet_core::options::{ExportFormat, JobOptions};
use drumsheet_pipeline::job::{JobState, JobStep};

use crate::error::{AppError, AppResult};
use crate::routes::SourceRequest;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_job))
        .route("/{job_id}", get(get_job).delete(purge_job))
        .route("/{job_id}/files", get(get_job_files))
        .route("/{job_id}/cancel", post(cancel_job))
        .route("/{job_id}/review-export", post(review_export))
        .route("/{job_id}/capture-crop", post(crop_capture))
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JobCreateRequest {
    #[serde(flatten)]
    source: SourceRequest,
    #[serde(default)]
    options: JobOptions,
}

#[derive(Debug, Serialize)]
struct JobCreateResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: String,
    state: JobState,
    step: JobStep,
    progress: f32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    result: Manifest,
    log_tail: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewExportRequest {
    #[serde(default)]
    keep_captures: Vec<String>,
    #[serde(default)]
    formats: Option<Vec<ExportFormat>>,
}

#[derive(Debug, Serialize)]
struct ReviewExportResponse {
    images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pdf: Option<String>,
    output_dir: String,
    kept_count: usize,
}

#[derive(Debug, Deserialize)]
struct CaptureCropRequest {
    capture_path: String,
    roi: Quad,
}

#[derive(Debug, Serialize)]
struct CaptureCropResponse {
    capture_path: String,
    width: u32,
    height: u32,
    version: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /jobs
async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<JobCreateRequest>,
) -> AppResult<Json<JobCreateResponse>> {
    let source = payload.source.into_descriptor()?;
    let job_id = state.orchestrator.submit(source, payload.options).await?;
    Ok(Json(JobCreateResponse { job_id }))
}

/// GET /jobs/{job_id}
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobStatusResponse>> {
    let snapshot = state
        .orchestrator
        .status(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))?;
    Ok(Json(JobStatusResponse {
        job_id: snapshot.job_id,
        state: snapshot.state,
        step: snapshot.step,
        progress: snapshot.progress,
        message: snapshot.message,
        error_code: snapshot.error_code,
        result: snapshot.manifest,
        log_tail: snapshot.log_tail,
    }))
}

/// GET /jobs/{job_id}/files
async fn get_job_files(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Manifest>> {
    let manifest = state
        .orchestrator
        .files(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))?;
    Ok(Json(manifest))
}

/// POST /jobs/{job_id}/cancel
async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    if state.orchestrator.status(&job_id).is_none() {
        return Err(AppError::NotFound(format!("job not found: {job_id}")));
    }
    let cancelled = state.orchestrator.cancel(&job_id);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

/// DELETE /jobs/{job_id}
async fn purge_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state.orchestrator.purge(&job_id).await?;
    Ok(Json(serde_json::json!({ "purged": true })))
}

/// POST /jobs/{job_id}/review-export
async fn review_export(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(payload): Json<ReviewExportRequest>,
) -> AppResult<Json<ReviewExportResponse>> {
    let manifest = state
        .orchestrator
        .review_export(&job_id, payload.keep_captures, payload.formats)
        .await?;
    let kept_count = manifest
        .review_export
        .map(|info| info.kept_count)
        .unwrap_or(0);
    Ok(Json(ReviewExportResponse {
        images: manifest.images,
        pdf: manifest.pdf,
        output_dir: manifest.output_dir,
        kept_count,
    }))
}

/// POST /jobs/{job_id}/capture-crop
async fn crop_capture(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(payload): Json<CaptureCropRequest>,
) -> AppResult<Json<CaptureCropResponse>> {
    let outcome = state
        .orchestrator
        .crop_capture(&job_id, payload.capture_path, payload.roi)
        .await?;
    Ok(Json(CaptureCropResponse {
        capture_path: outcome.capture_path.display().to_string(),
        width: outcome.width,
        height: outcome.height,
        version: outcome.version,
    }))
}
