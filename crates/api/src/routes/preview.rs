//! Preview endpoints for the ROI chooser and the source player.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::routes::{jobs_files_url, SourceRequest};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/frame", post(preview_frame))
        .route("/source", post(preview_source))
}

#[derive(Debug, Deserialize)]
struct PreviewFrameRequest {
    #[serde(flatten)]
    source: SourceRequest,
    #[serde(default)]
    start_sec: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PreviewFrameResponse {
    image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct PreviewSourceResponse {
    video_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_url: Option<String>,
    from_cache: bool,
}

/// POST /preview/frame
///
/// Extract a single frame near `start_sec` so the shell can show the
/// ROI chooser without running a full extraction.
async fn preview_frame(
    State(state): State<AppState>,
    Json(payload): Json<PreviewFrameRequest>,
) -> AppResult<Json<PreviewFrameResponse>> {
    let source = payload.source.into_descriptor()?;
    let at_sec = payload.start_sec.unwrap_or(0.0).max(0.0);
    let image_path = state.orchestrator.preview_frame(source, at_sec).await?;
    let image_url = jobs_files_url(state.orchestrator.jobs_root(), &image_path);
    Ok(Json(PreviewFrameResponse {
        image_path: image_path.display().to_string(),
        image_url,
    }))
}

/// POST /preview/source
///
/// Resolve the source clip (downloading and caching remote clips) so
/// the shell can play it back.
async fn preview_source(
    State(state): State<AppState>,
    Json(payload): Json<SourceRequest>,
) -> AppResult<Json<PreviewSourceResponse>> {
    let source = payload.into_descriptor()?;
    let resolved = state.orchestrator.preview_source(source).await?;
    let video_url = jobs_files_url(state.orchestrator.jobs_root(), &resolved.video_path);
    Ok(Json(PreviewSourceResponse {
        video_path: resolved.video_path.display().to_string(),
        video_url,
        from_cache: resolved.from_cache,
    }))
}
