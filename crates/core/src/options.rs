//! Enumerated per-stage option structs.
//!
//! The control surface accepts one option bag per pipeline stage; every
//! field is typed and validated before a job is accepted.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::geometry::Quad;
use crate::layout::LayoutHint;

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Frame sampling sensitivity. The fps mapping is fixed, not continuous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl CaptureSensitivity {
    pub fn sampling_fps(self) -> f64 {
        match self {
            CaptureSensitivity::Low => 0.6,
            CaptureSensitivity::Medium => 1.0,
            CaptureSensitivity::High => 1.8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractOptions {
    /// Explicit sampling rate; overrides the sensitivity mapping.
    pub sampling_fps: Option<f64>,
    pub sensitivity: CaptureSensitivity,
    pub start_sec: Option<f64>,
    pub end_sec: Option<f64>,
}

impl ExtractOptions {
    pub fn effective_fps(&self) -> f64 {
        match self.sampling_fps {
            Some(fps) if fps > 0.0 => fps,
            _ => self.sensitivity.sampling_fps(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(fps) = self.sampling_fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(CoreError::Validation(
                    "sampling_fps must be a positive number".into(),
                ));
            }
        }
        for (name, value) in [("start_sec", self.start_sec), ("end_sec", self.end_sec)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(CoreError::Validation(format!(
                        "{name} must be a non-negative number"
                    )));
                }
            }
        }
        if let (Some(start), Some(end)) = (self.start_sec, self.end_sec) {
            if end <= start {
                return Err(CoreError::Validation(
                    "end_sec must be greater than start_sec".into(),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectOptions {
    /// User-anchored ROI on the preview frame. Required for tracking;
    /// absent means the layout fallback region is used from frame one.
    pub roi: Option<Quad>,
    pub layout_hint: LayoutHint,
}

// ---------------------------------------------------------------------------
// Dedup / stitching
// ---------------------------------------------------------------------------

/// Temporal dedupe sensitivity. `Aggressive` maps to the "low" UI
/// setting (strongest suppression), `Sensitive` to "high".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupeLevel {
    Aggressive,
    #[default]
    Normal,
    Sensitive,
}

impl DedupeLevel {
    /// Hamming distance on the 64-bit perceptual hash that a capture
    /// must exceed against the last emitted one to survive dedup.
    pub fn hamming_threshold(self) -> u32 {
        match self {
            DedupeLevel::Aggressive => 18,
            DedupeLevel::Normal => 12,
            DedupeLevel::Sensitive => 6,
        }
    }
}

pub const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchOptions {
    pub enable: bool,
    /// Overlap search band as a fraction of capture height.
    pub overlap_threshold: f32,
    pub layout_hint: LayoutHint,
    pub dedupe_level: DedupeLevel,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            enable: false,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            layout_hint: LayoutHint::Auto,
            dedupe_level: DedupeLevel::Normal,
        }
    }
}

impl StitchOptions {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.overlap_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.overlap_threshold)
        {
            return Err(CoreError::Validation(
                "overlap_threshold must be within [0.0, 1.0]".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Upscaling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleOptions {
    pub enable: bool,
    /// Integer-like enlargement factor; only 2.0 and 3.0 are accepted.
    pub factor: f32,
    pub gpu_only: bool,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            enable: false,
            factor: 2.0,
            gpu_only: false,
        }
    }
}

impl UpscaleOptions {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.enable && self.factor != 2.0 && self.factor != 3.0 {
            return Err(CoreError::Validation(
                "upscale factor must be 2.0 or 3.0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Png,
    #[serde(alias = "jpeg")]
    Jpg,
    Pdf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub formats: Vec<ExportFormat>,
    pub include_raw_frames: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            formats: vec![ExportFormat::Png, ExportFormat::Pdf],
            include_raw_frames: false,
        }
    }
}

impl ExportOptions {
    /// Deduplicated formats in first-seen order; the default set when
    /// the request names none.
    pub fn normalized_formats(&self) -> Vec<ExportFormat> {
        let mut seen = Vec::new();
        for format in &self.formats {
            if !seen.contains(format) {
                seen.push(*format);
            }
        }
        if seen.is_empty() {
            seen = ExportOptions::default().formats;
        }
        seen
    }

    pub fn wants(&self, format: ExportFormat) -> bool {
        self.normalized_formats().contains(&format)
    }
}

// ---------------------------------------------------------------------------
// Job roll-up
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub extract: ExtractOptions,
    pub detect: DetectOptions,
    pub stitch: StitchOptions,
    pub upscale: UpscaleOptions,
    pub export: ExportOptions,
}

impl JobOptions {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.extract.validate()?;
        self.stitch.validate()?;
        self.upscale.validate()?;
        Ok(())
    }
}
