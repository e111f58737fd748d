//! Decoded frames and the lazy sequence over an extraction directory.

use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::error::PipelineError;

/// A decoded RGB frame. Produced by the frame source, consumed by the
/// tracker, never persisted beyond its extraction file.
pub struct Frame {
    /// Monotonic index from 0 in presentation order.
    pub index: u64,
    /// Presentation timestamp in seconds at the sampling rate.
    pub timestamp_secs: f64,
    pub image: RgbImage,
}

/// Lazy, index-ordered view over the numbered frame files produced by
/// an extraction run. Images are decoded one at a time as the iterator
/// advances.
pub struct FrameSequence {
    paths: Vec<PathBuf>,
    fps: f64,
}

impl FrameSequence {
    pub fn new(paths: Vec<PathBuf>, fps: f64) -> Self {
        Self { paths, fps }
    }

    /// Build from a directory of `frame_*.png` files in name order.
    pub fn from_dir(dir: &Path, fps: f64) -> std::io::Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with("frame_") && n.ends_with(".png")
                    })
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        Ok(Self { paths, fps })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Decode the frame at `index`.
    pub fn load(&self, index: usize) -> Result<Frame, PipelineError> {
        let path = self.paths.get(index).ok_or_else(|| {
            PipelineError::Internal(format!("frame index {index} out of range"))
        })?;
        let image = image::open(path)
            .map_err(|e| {
                PipelineError::DecodeFailed(format!(
                    "failed to read extracted frame {}: {e}",
                    path.display()
                ))
            })?
            .to_rgb8();
        Ok(Frame {
            index: index as u64,
            timestamp_secs: if self.fps > 0.0 {
                index as f64 / self.fps
            } else {
                0.0
            },
            image,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Frame, PipelineError>> + '_ {
        (0..self.paths.len()).map(|i| self.load(i))
    }
}
