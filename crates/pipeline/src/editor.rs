//! Post-run capture editing: re-crop a single capture and re-export a
//! reviewed subset of pages.

use std::path::PathBuf;

use drumsheet_core::geometry::{Quad, MIN_CROP_EDGE_PX};
use drumsheet_core::manifest::ReviewExportInfo;
use drumsheet_core::options::ExportOptions;
use drumsheet_core::workspace::JobWorkspace;

use crate::compose::{compose_pages, ComposedOutput};
use crate::error::PipelineError;
use crate::stitch::PageCandidate;

/// Image extensions accepted for capture edits.
const CAPTURE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug, Clone)]
pub struct CaptureCrop {
    pub capture_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Resolve a client-supplied capture path against the job workspace.
///
/// The path must stay inside the workspace (traversal rejected) and
/// name an image file.
pub fn resolve_capture_path(
    workspace: &JobWorkspace,
    raw_path: &str,
    must_exist: bool,
) -> Result<PathBuf, PipelineError> {
    let trimmed = raw_path.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InputInvalid(
            "capture path must not be empty".into(),
        ));
    }
    let path = PathBuf::from(trimmed);
    if !workspace.contains(&path) {
        return Err(PipelineError::InputInvalid(format!(
            "capture path must be inside this job directory: {raw_path}"
        )));
    }
    let extension_ok = path
        .extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            CAPTURE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false);
    if !extension_ok {
        return Err(PipelineError::InputInvalid(format!(
            "unsupported capture format: {raw_path}"
        )));
    }
    if must_exist && !path.is_file() {
        return Err(PipelineError::InputInvalid(format!(
            "capture file not found: {raw_path}"
        )));
    }
    Ok(path)
}

/// Re-crop a produced capture with a quad given in the capture's own
/// pixel space, overwriting the file in place.
pub fn crop_capture(
    workspace: &JobWorkspace,
    raw_path: &str,
    quad: &Quad,
) -> Result<CaptureCrop, PipelineError> {
    let path = resolve_capture_path(workspace, raw_path, true)?;
    let image = image::open(&path)
        .map_err(|e| PipelineError::InputInvalid(format!("capture file could not be read: {e}")))?
        .to_rgb8();

    let (w, h) = image.dimensions();
    let clamped = quad.clamped(w as f32, h as f32);
    if clamped.mean_width() < MIN_CROP_EDGE_PX || clamped.mean_height() < MIN_CROP_EDGE_PX {
        return Err(PipelineError::InputInvalid(
            "roi is too small for capture crop".into(),
        ));
    }

    // Rectify in capture space: the quad's own pixel size becomes the
    // output size, so a full-image quad is the identity.
    let target_w = clamped.mean_width().round().max(2.0) as u32;
    let target_h = clamped.mean_height().round().max(2.0) as u32;
    let src: [(f32, f32); 4] = clamped.points.map(|p| (p.x, p.y));
    let dst: [(f32, f32); 4] = [
        (0.0, 0.0),
        (target_w as f32, 0.0),
        (target_w as f32, target_h as f32),
        (0.0, target_h as f32),
    ];
    let projection = imageproc::geometric_transformations::Projection::from_control_points(
        src, dst,
    )
    .ok_or_else(|| {
        PipelineError::InputInvalid("roi is degenerate and cannot be rectified".into())
    })?;

    let mut cropped = image::RgbImage::new(target_w, target_h);
    imageproc::geometric_transformations::warp_into(
        &image,
        &projection,
        imageproc::geometric_transformations::Interpolation::Bilinear,
        image::Rgb([255, 255, 255]),
        &mut cropped,
    );

    cropped
        .save(&path)
        .map_err(|e| PipelineError::ExportFailed(format!("failed to save cropped capture: {e}")))?;
    tracing::info!(capture = %path.display(), target_w, target_h, "capture crop saved");

    Ok(CaptureCrop {
        capture_path: path,
        width: target_w,
        height: target_h,
    })
}

/// Re-run composition over a kept subset of the review candidates.
///
/// Returns the new output plus the kept/requested counts. Nothing is
/// written until every kept path has been validated, so a failed
/// request leaves the previous export intact.
pub fn review_export(
    workspace: &JobWorkspace,
    keep_captures: &[String],
    options: &ExportOptions,
    scroll_mode: bool,
) -> Result<(ComposedOutput, ReviewExportInfo, Vec<PathBuf>), PipelineError> {
    let requested: Vec<&str> = keep_captures
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if requested.is_empty() {
        return Err(PipelineError::InputInvalid(
            "keep_captures must include at least one capture".into(),
        ));
    }

    let mut kept: Vec<PathBuf> = Vec::new();
    for raw in &requested {
        let resolved = resolve_capture_path(workspace, raw, true)?;
        if !kept.contains(&resolved) {
            kept.push(resolved);
        }
    }

    let mut candidates = Vec::with_capacity(kept.len());
    for (index, path) in kept.iter().enumerate() {
        let image = image::open(path)
            .map_err(|e| {
                PipelineError::InputInvalid(format!(
                    "capture could not be read: {}: {e}",
                    path.display()
                ))
            })?
            .to_rgb8();
        candidates.push(PageCandidate {
            image,
            frame_indices: vec![index as u64],
            cluster_id: None,
        });
    }

    let output = compose_pages(
        &candidates,
        options,
        scroll_mode,
        &workspace.pages_dir(),
        &workspace.pdf_path(),
    )?;
    let info = ReviewExportInfo {
        kept_count: kept.len(),
        requested_count: requested.len(),
    };
    Ok((output, info, kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn workspace() -> (tempfile::TempDir, JobWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = JobWorkspace::new(dir.path().join("job"));
        ws.ensure_dirs().unwrap();
        (dir, ws)
    }

    fn write_capture(ws: &JobWorkspace, name: &str) -> PathBuf {
        let path = ws.rectified_dir().join(name);
        let mut image = RgbImage::from_pixel(120, 80, Rgb([255, 255, 255]));
        for x in 20..100 {
            image.put_pixel(x, 40, Rgb([0, 0, 0]));
        }
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn paths_outside_the_workspace_are_rejected() {
        let (_dir, ws) = workspace();
        for raw in [
            "/etc/passwd.png",
            "../other/capture.png",
            "relative/capture.png",
        ] {
            let err = resolve_capture_path(&ws, raw, false).unwrap_err();
            assert!(matches!(err, PipelineError::InputInvalid(_)), "{raw}");
        }
        let traversal = format!("{}/rectified/../../elsewhere.png", ws.root().display());
        assert!(resolve_capture_path(&ws, &traversal, false).is_err());
    }

    #[test]
    fn non_image_extensions_are_rejected() {
        let (_dir, ws) = workspace();
        let raw = format!("{}/rectified/capture.txt", ws.root().display());
        assert!(resolve_capture_path(&ws, &raw, false).is_err());
    }

    #[test]
    fn crop_with_a_sub_quad_shrinks_the_capture() {
        let (_dir, ws) = workspace();
        let path = write_capture(&ws, "sheet_00000.png");
        let quad = Quad::from_rect(10.0, 10.0, 60.0, 40.0);
        let crop = crop_capture(&ws, &path.display().to_string(), &quad).unwrap();
        assert_eq!((crop.width, crop.height), (60, 40));
        let reloaded = image::open(&path).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (60, 40));
    }

    #[test]
    fn full_image_quad_preserves_pixels() {
        let (_dir, ws) = workspace();
        let path = write_capture(&ws, "sheet_00000.png");
        let before = image::open(&path).unwrap().to_rgb8();
        let quad = Quad::from_rect(0.0, 0.0, 120.0, 80.0);
        crop_capture(&ws, &path.display().to_string(), &quad).unwrap();
        let after = image::open(&path).unwrap().to_rgb8();
        assert_eq!(before, after);
    }

    #[test]
    fn tiny_crops_are_rejected() {
        let (_dir, ws) = workspace();
        let path = write_capture(&ws, "sheet_00000.png");
        let quad = Quad::from_rect(0.0, 0.0, 8.0, 8.0);
        let err = crop_capture(&ws, &path.display().to_string(), &quad).unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));
    }

    #[test]
    fn review_export_rejects_an_empty_keep_list() {
        let (_dir, ws) = workspace();
        let err = review_export(&ws, &[], &ExportOptions::default(), false).unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));

        let err = review_export(
            &ws,
            &["   ".to_string()],
            &ExportOptions::default(),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));
    }

    #[test]
    fn review_export_recomposes_the_kept_subset() {
        let (_dir, ws) = workspace();
        let a = write_capture(&ws, "sheet_00000.png");
        let _b = write_capture(&ws, "sheet_00001.png");
        let c = write_capture(&ws, "sheet_00002.png");

        let keep = vec![
            a.display().to_string(),
            c.display().to_string(),
            // Duplicates collapse.
            a.display().to_string(),
        ];
        let (output, info, kept) =
            review_export(&ws, &keep, &ExportOptions::default(), false).unwrap();
        assert_eq!(info.kept_count, 2);
        assert_eq!(info.requested_count, 3);
        assert_eq!(kept, vec![a, c]);
        assert_eq!(output.page_count, 2);
        assert!(ws.pages_dir().join("page_001.png").is_file());
        assert!(ws.pdf_path().is_file());
    }
}
