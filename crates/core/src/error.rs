use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} '{id}'")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error codes published in job status responses.
///
/// Every stage failure is rolled up into exactly one of these before it
/// reaches the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing file, empty URL, ROI too small, unsupported format.
    InputInvalid,
    /// Local file missing or preview fetch failed.
    SourceUnavailable,
    /// ffmpeg exited non-zero on extract or preview.
    DecodeFailed,
    /// Unrecoverable low-confidence run with no fallback region.
    TrackingLost,
    /// No correlation peak above threshold for a full page.
    StitchFailed,
    /// `gpu_only` set but no GPU backend is usable.
    UpscaleUnavailable,
    /// A backend invocation failed mid-run.
    UpscaleFailed,
    /// Disk full or permission denied on write.
    ExportFailed,
    /// Cancellation observed at a checkpoint.
    Cancelled,
    /// Unexpected programming error with attached context.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InputInvalid => "input_invalid",
            ErrorCode::SourceUnavailable => "source_unavailable",
            ErrorCode::DecodeFailed => "decode_failed",
            ErrorCode::TrackingLost => "tracking_lost",
            ErrorCode::StitchFailed => "stitch_failed",
            ErrorCode::UpscaleUnavailable => "upscale_unavailable",
            ErrorCode::UpscaleFailed => "upscale_failed",
            ErrorCode::ExportFailed => "export_failed",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_snake_case_strings() {
        assert_eq!(ErrorCode::InputInvalid.as_str(), "input_invalid");
        assert_eq!(ErrorCode::UpscaleUnavailable.as_str(), "upscale_unavailable");
        assert_eq!(ErrorCode::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn error_codes_serialize_to_their_string_form() {
        let json = serde_json::to_string(&ErrorCode::DecodeFailed).unwrap();
        assert_eq!(json, "\"decode_failed\"");
    }

    #[test]
    fn validation_error_formats_message() {
        let err = CoreError::Validation("roi must have 4 points".into());
        assert_eq!(err.to_string(), "Validation failed: roi must have 4 points");
    }
}
