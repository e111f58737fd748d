use drumsheet_core::error::{CoreError, ErrorCode};

/// Error type shared by every pipeline stage. The orchestrator rolls a
/// stage failure up into the published taxonomy via [`PipelineError::error_code`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("ffmpeg binary not found: {0}")]
    FfmpegMissing(String),

    #[error("video decode failed: {0}")]
    DecodeFailed(String),

    #[error("end_sec must be greater than start_sec")]
    EmptyRange,

    #[error("{0}")]
    InputInvalid(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("tracking lost: {0}")]
    TrackingLost(String),

    #[error("stitching failed: {0}")]
    StitchFailed(String),

    #[error("no GPU upscale backend is available")]
    NoGpuUpscale,

    #[error("upscaling failed: {0}")]
    UpscaleFailed(String),

    #[error("export failed: {0}")]
    ExportFailed(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PipelineError::FfmpegMissing(_) | PipelineError::DecodeFailed(_) => {
                ErrorCode::DecodeFailed
            }
            PipelineError::EmptyRange | PipelineError::InputInvalid(_) => ErrorCode::InputInvalid,
            PipelineError::SourceUnavailable(_) => ErrorCode::SourceUnavailable,
            PipelineError::TrackingLost(_) => ErrorCode::TrackingLost,
            PipelineError::StitchFailed(_) => ErrorCode::StitchFailed,
            PipelineError::NoGpuUpscale => ErrorCode::UpscaleUnavailable,
            PipelineError::UpscaleFailed(_) => ErrorCode::UpscaleFailed,
            PipelineError::ExportFailed(_) | PipelineError::Io(_) => ErrorCode::ExportFailed,
            PipelineError::Cancelled => ErrorCode::Cancelled,
            PipelineError::Conflict(_)
            | PipelineError::NotFound(_)
            | PipelineError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => PipelineError::InputInvalid(msg),
            CoreError::NotFound { entity, id } => {
                PipelineError::InputInvalid(format!("{entity} '{id}' not found"))
            }
            CoreError::Conflict(msg) => PipelineError::Conflict(msg),
            CoreError::Internal(msg) => PipelineError::Internal(msg),
        }
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        PipelineError::Internal(format!("image processing failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_map_to_the_published_taxonomy() {
        assert_eq!(
            PipelineError::EmptyRange.error_code(),
            ErrorCode::InputInvalid
        );
        assert_eq!(
            PipelineError::DecodeFailed("boom".into()).error_code(),
            ErrorCode::DecodeFailed
        );
        assert_eq!(
            PipelineError::NoGpuUpscale.error_code(),
            ErrorCode::UpscaleUnavailable
        );
        assert_eq!(PipelineError::Cancelled.error_code(), ErrorCode::Cancelled);
    }

    #[test]
    fn core_validation_becomes_input_invalid() {
        let err: PipelineError = CoreError::Validation("roi too small".into()).into();
        assert_eq!(err.error_code(), ErrorCode::InputInvalid);
    }
}
