//! Application router assembly.

use std::time::Duration;

use axum::http::HeaderName;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::routes;
use crate::state::AppState;

/// Assemble the full application [`Router`]. The binary and the
/// integration tests both go through here, so they always exercise the
/// same middleware.
///
/// This surface only ever talks to the capture shell on localhost:
/// CORS is wide open, and job artifacts (preview frames, captures,
/// finished pages) are served straight off the jobs root under
/// `/jobs-files`. Every request gets an `x-request-id` that is echoed
/// on the response, so shell actions can be matched to pipeline log
/// lines. The request timeout bounds the HTTP exchange only — capture
/// jobs run in background workers and outlive any single request.
pub fn build_app_router(state: AppState, config: &ServerConfig) -> Router {
    let request_id = HeaderName::from_static("x-request-id");
    let jobs_root = state.orchestrator.jobs_root().to_path_buf();

    // Outermost first: the id must exist before tracing opens a span,
    // and panics are caught as close to the handler as possible. CORS is
    // innermost so it sees the router's native response body type rather
    // than the boxed body produced by the outer layers.
    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::new(request_id))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .layer(CatchPanicLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    Router::new()
        .merge(routes::api_routes())
        .nest_service("/jobs-files", ServeDir::new(jobs_root))
        .layer(middleware)
        .with_state(state)
}
