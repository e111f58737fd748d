//! Per-job workspace layout and path containment.
//!
//! `jobs/<job_id>/` holds `frames/` (extracted), `rectified/`
//! (captures), `pages/` (final), `pages.pdf`, and `manifest.json`.
//! Intermediate stage output lives in `stitched/` and `upscaled/`.
//! The workspace is exclusively owned by its job and survives
//! completion until purged.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    root: PathBuf,
}

impl JobWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    pub fn rectified_dir(&self) -> PathBuf {
        self.root.join("rectified")
    }

    pub fn stitched_dir(&self) -> PathBuf {
        self.root.join("stitched")
    }

    pub fn upscaled_dir(&self) -> PathBuf {
        self.root.join("upscaled")
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.root.join("pages")
    }

    pub fn pdf_path(&self) -> PathBuf {
        self.root.join("pages.pdf")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    /// Create the workspace root and every stage directory.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.frames_dir(),
            self.rectified_dir(),
            self.stitched_dir(),
            self.upscaled_dir(),
            self.pages_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// True when `path` stays inside this workspace. Relative paths and
    /// any path containing a `..` component are rejected, so traversal
    /// cannot escape even for files that do not exist yet.
    pub fn contains(&self, path: &Path) -> bool {
        if !path.is_absolute() {
            return false;
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return false;
        }
        path.starts_with(&self.root)
    }
}

/// Recursive on-disk size of a file or directory tree. Unreadable
/// entries count as zero so cache accounting never fails a request.
pub fn path_size_bytes(path: &Path) -> u64 {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if metadata.is_file() || metadata.is_symlink() {
        return metadata.len();
    }

    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| path_size_bytes(&entry.path()))
        .sum()
}
