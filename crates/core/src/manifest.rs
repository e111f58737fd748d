//! Published job output manifest.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResolution {
    pub width: u32,
    pub height: u32,
}

/// Runtime acceleration summary captured when the job ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// "gpu" when any hardware path was active, otherwise "cpu".
    pub overall_mode: String,
    /// Active ffmpeg decode mode (e.g. "cuda", "videotoolbox", "cpu").
    pub ffmpeg_mode: String,
    /// Image-processing acceleration mode ("cuda" | "opencl" | "cpu").
    pub opencv_mode: String,
    /// Which upscale backend the probe expects to use ("none" if none).
    pub upscale_engine_hint: String,
    pub gpu_name: Option<String>,
    pub cpu_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewExportInfo {
    /// Captures kept after path resolution and deduplication.
    pub kept_count: usize,
    /// Captures named in the request.
    pub requested_count: usize,
}

/// Record of a job's output files and runtime metadata. Every path is
/// absolute and lies under the job workspace directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub output_dir: String,
    #[serde(default)]
    pub images: Vec<String>,
    /// Per-capture pre-compose images offered for review.
    #[serde(default)]
    pub review_candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_sheet: Option<String>,
    #[serde(default)]
    pub upscaled_frames: Vec<String>,
    #[serde(default)]
    pub raw_frames: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_resolution: Option<SourceResolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_export: Option<ReviewExportInfo>,
}

impl Manifest {
    /// Every file path recorded in the manifest, in no particular order.
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.images
            .iter()
            .chain(self.review_candidates.iter())
            .chain(self.upscaled_frames.iter())
            .chain(self.raw_frames.iter())
            .map(String::as_str)
            .chain(self.pdf.as_deref())
            .chain(self.full_sheet.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_paths_cover_every_recorded_file() {
        let manifest = Manifest {
            output_dir: "/jobs/a/pages".into(),
            images: vec!["/jobs/a/pages/page_001.png".into()],
            review_candidates: vec!["/jobs/a/rectified/sheet_00000.png".into()],
            pdf: Some("/jobs/a/pages.pdf".into()),
            full_sheet: Some("/jobs/a/pages/sheet_complete.png".into()),
            upscaled_frames: vec!["/jobs/a/upscaled/upscaled_00000.png".into()],
            raw_frames: vec![],
            source_resolution: Some(SourceResolution {
                width: 1920,
                height: 1080,
            }),
            runtime: None,
            review_export: None,
        };
        let paths: Vec<&str> = manifest.file_paths().collect();
        assert_eq!(paths.len(), 5);
        assert!(paths.iter().all(|p| p.starts_with("/jobs/a/")));
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = Manifest {
            output_dir: "/jobs/a/pages".into(),
            images: vec!["/jobs/a/pages/page_001.png".into()],
            review_export: Some(ReviewExportInfo {
                kept_count: 3,
                requested_count: 4,
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.images, manifest.images);
        assert_eq!(back.review_export.unwrap().kept_count, 3);
        // Absent options stay absent rather than serializing as null.
        assert!(!json.contains("\"pdf\""));
    }
}
