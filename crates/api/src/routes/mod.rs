pub mod health;
pub mod jobs;
pub mod maintenance;
pub mod preview;
pub mod runtime;

use std::path::Path;

use axum::Router;
use serde::Deserialize;

use drumsheet_pipeline::source::SourceDescriptor;

use crate::error::AppError;
use crate::state::AppState;

/// Build the route tree.
///
/// ```text
/// GET  /health                         liveness
/// POST /jobs                           submit a capture job
/// GET  /jobs/{job_id}                  status
/// GET  /jobs/{job_id}/files            manifest
/// POST /jobs/{job_id}/cancel           cooperative cancel
/// DELETE /jobs/{job_id}                purge workspace
/// POST /jobs/{job_id}/review-export    recompose a kept subset
/// POST /jobs/{job_id}/capture-crop     re-crop one capture
/// POST /preview/frame                  single ROI-chooser frame
/// POST /preview/source                 resolve/cache the source clip
/// GET  /runtime                        capability report
/// GET  /maintenance/cache-usage        jobs dir accounting
/// POST /maintenance/clear-cache        wipe workspaces and caches
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/jobs", jobs::router())
        .nest("/preview", preview::router())
        .merge(runtime::router())
        .nest("/maintenance", maintenance::router())
}

/// Source fields shared by job submission and the preview endpoints.
#[derive(Debug, Deserialize)]
pub struct SourceRequest {
    pub source_type: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub youtube_url: Option<String>,
}

impl SourceRequest {
    /// Validate and convert into a pipeline source descriptor.
    pub fn into_descriptor(self) -> Result<SourceDescriptor, AppError> {
        match self.source_type.as_str() {
            "file" => {
                let path = self.file_path.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
                    AppError::BadRequest(
                        "file_path is required when source_type is file".into(),
                    )
                })?;
                Ok(SourceDescriptor::File { path: path.into() })
            }
            "youtube" => {
                let url = self
                    .youtube_url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| {
                        AppError::BadRequest(
                            "youtube_url is required when source_type is youtube".into(),
                        )
                    })?;
                Ok(SourceDescriptor::Remote { url })
            }
            other => Err(AppError::BadRequest(format!(
                "unsupported source_type: {other}"
            ))),
        }
    }
}

/// Map a workspace file onto its `/jobs-files` URL when it lives under
/// the jobs root.
pub fn jobs_files_url(jobs_root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(jobs_root)
        .ok()
        .map(|rel| format!("/jobs-files/{}", rel.display()))
}
