use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use drumsheet_core::manifest::RuntimeInfo;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/runtime", get(runtime_status))
}

#[derive(Debug, Serialize)]
struct RuntimeStatusResponse {
    #[serde(flatten)]
    runtime: RuntimeInfo,
    upscale_available: bool,
}

/// GET /runtime
///
/// Capability report from the startup probe.
async fn runtime_status(State(state): State<AppState>) -> Json<RuntimeStatusResponse> {
    let runtime = state.orchestrator.runtime_info();
    let upscale_available = runtime.upscale_engine_hint != "none";
    Json(RuntimeStatusResponse {
        runtime,
        upscale_available,
    })
}
