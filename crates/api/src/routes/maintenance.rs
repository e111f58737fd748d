//! Cache accounting and cleanup endpoints.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use drumsheet_core::humanize::human_bytes;

use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cache-usage", get(cache_usage))
        .route("/clear-cache", post(clear_cache))
}

#[derive(Debug, Serialize)]
struct CacheUsageResponse {
    total_paths: usize,
    total_bytes: u64,
    total_human: String,
}

#[derive(Debug, Serialize)]
struct CacheClearResponse {
    cleared_paths: usize,
    cleared_jobs: usize,
    reclaimed_bytes: u64,
    reclaimed_human: String,
    skipped_paths: Vec<String>,
}

/// GET /maintenance/cache-usage
async fn cache_usage(State(state): State<AppState>) -> Json<CacheUsageResponse> {
    let usage = state.orchestrator.cache_usage();
    Json(CacheUsageResponse {
        total_paths: usage.total_paths,
        total_bytes: usage.total_bytes,
        total_human: human_bytes(usage.total_bytes),
    })
}

/// POST /maintenance/clear-cache
///
/// Rejected with a conflict while any job is running.
async fn clear_cache(State(state): State<AppState>) -> AppResult<Json<CacheClearResponse>> {
    let outcome = state.orchestrator.clear_cache()?;
    Ok(Json(CacheClearResponse {
        cleared_paths: outcome.cleared_paths,
        cleared_jobs: outcome.cleared_jobs,
        reclaimed_bytes: outcome.reclaimed_bytes,
        reclaimed_human: human_bytes(outcome.reclaimed_bytes),
        skipped_paths: outcome.skipped_paths,
    }))
}
