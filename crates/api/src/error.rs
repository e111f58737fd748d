use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use drumsheet_core::error::CoreError;
use drumsheet_pipeline::error::PipelineError;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`PipelineError`] for orchestrator operations and adds
/// HTTP-specific variants. Implements [`IntoResponse`] to produce
/// consistent `{error, code}` JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Pipeline(err) => classify_pipeline_error(err),
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "not_found",
                    format!("{entity} '{id}' not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "input_invalid", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "internal core error");
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg.clone())
                }
            },
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "input_invalid", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}

/// Map a pipeline failure onto an HTTP status plus its taxonomy code.
fn classify_pipeline_error(err: &PipelineError) -> (StatusCode, &'static str, String) {
    let status = match err {
        PipelineError::InputInvalid(_)
        | PipelineError::EmptyRange
        | PipelineError::SourceUnavailable(_) => StatusCode::BAD_REQUEST,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Conflict(_) => StatusCode::CONFLICT,
        _ => {
            tracing::error!(error = %err, "pipeline operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let code = match err {
        PipelineError::NotFound(_) => "not_found",
        PipelineError::Conflict(_) => "conflict",
        other => other.error_code().as_str(),
    };
    (status, code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_map_to_taxonomy_codes() {
        let (status, code, _) =
            classify_pipeline_error(&PipelineError::InputInvalid("roi too small".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "input_invalid");

        let (status, code, _) =
            classify_pipeline_error(&PipelineError::NotFound("job not found: x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "not_found");

        let (status, code, _) =
            classify_pipeline_error(&PipelineError::Conflict("job is still running".into()));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "conflict");

        let (status, code, _) = classify_pipeline_error(&PipelineError::NoGpuUpscale);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "upscale_unavailable");
    }
}
