//! Page composition and export.
//!
//! Candidates are trimmed to their content, padded with a small print
//! margin, split into A4-proportioned pages when a strip grows too
//! tall, brought to a uniform width, and written out as numbered page
//! images plus an optional PDF. Multi-page scroll jobs additionally get
//! a `sheet_complete.png` with the whole strip.

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};

use drumsheet_core::options::{ExportFormat, ExportOptions};

use crate::error::PipelineError;
use crate::pdf;
use crate::rectify::content_bounding_box;
use crate::stitch::PageCandidate;

/// Margin added around trimmed content, per axis.
pub const PAGE_MARGIN_RATIO: f32 = 0.04;

/// A4 portrait height / width.
pub const A4_PORTRAIT_RATIO: f32 = 1.4142;

/// A page taller than this many A4 heights (at its own width) is split
/// at low-ink rows.
pub const PAGE_SPLIT_FACTOR: f32 = 3.0;

/// JPEG quality for exported pages.
const JPEG_QUALITY: u8 = 95;

/// Name of the concatenated full-strip export.
pub const SHEET_COMPLETE_NAME: &str = "sheet_complete.png";

#[derive(Debug, Default)]
pub struct ComposedOutput {
    /// Finished page files in reading order.
    pub images: Vec<PathBuf>,
    pub pdf: Option<PathBuf>,
    pub full_sheet: Option<PathBuf>,
    pub page_count: usize,
}

/// Compose and export the given candidates.
///
/// Previously exported pages are removed first so a review re-export
/// never leaves stale page files behind.
pub fn compose_pages(
    candidates: &[PageCandidate],
    options: &ExportOptions,
    scroll_mode: bool,
    pages_dir: &Path,
    pdf_path: &Path,
) -> Result<ComposedOutput, PipelineError> {
    if candidates.is_empty() {
        return Err(PipelineError::ExportFailed(
            "no pages available for export".into(),
        ));
    }
    std::fs::create_dir_all(pages_dir)
        .map_err(|e| PipelineError::ExportFailed(e.to_string()))?;
    clear_previous_output(pages_dir, pdf_path);

    // Trim, split, then normalize width across the whole job.
    let mut pages: Vec<RgbImage> = Vec::new();
    for candidate in candidates {
        let trimmed = trim_with_margin(&candidate.image);
        pages.extend(split_tall_page(trimmed));
    }
    let uniform_width = pages.iter().map(|p| p.width()).max().unwrap_or(1);
    let pages: Vec<RgbImage> = pages
        .into_iter()
        .map(|p| pad_to_width(p, uniform_width))
        .collect();

    let formats = options.normalized_formats();
    let wants_png = formats.contains(&ExportFormat::Png);
    let wants_jpg = formats.contains(&ExportFormat::Jpg);
    let wants_pdf = formats.contains(&ExportFormat::Pdf);

    let mut output = ComposedOutput {
        page_count: pages.len(),
        ..Default::default()
    };

    for (index, page) in pages.iter().enumerate() {
        let stem = format!("page_{:03}", index + 1);
        if wants_png {
            let path = pages_dir.join(format!("{stem}.png"));
            page.save(&path)
                .map_err(|e| PipelineError::ExportFailed(e.to_string()))?;
            output.images.push(path);
        }
        if wants_jpg {
            let path = pages_dir.join(format!("{stem}.jpg"));
            save_jpeg(page, &path)?;
            output.images.push(path);
        }
    }

    if scroll_mode && pages.len() >= 2 {
        let strip = stack_vertically(&pages);
        let path = pages_dir.join(SHEET_COMPLETE_NAME);
        strip
            .save(&path)
            .map_err(|e| PipelineError::ExportFailed(e.to_string()))?;
        output.full_sheet = Some(path);
    }

    if wants_pdf {
        let refs: Vec<&RgbImage> = pages.iter().collect();
        pdf::write_pdf(&refs, pdf_path)?;
        output.pdf = Some(pdf_path.to_path_buf());
    }

    tracing::info!(
        pages = output.page_count,
        files = output.images.len(),
        pdf = output.pdf.is_some(),
        "page export finished"
    );
    Ok(output)
}

/// Crop to the content bounding box and add the print margin. Blank
/// pages pass through untouched.
pub fn trim_with_margin(image: &RgbImage) -> RgbImage {
    let gray = image::imageops::grayscale(image);
    let Some(content) = content_bounding_box(&gray) else {
        return image.clone();
    };
    let (w, h) = image.dimensions();

    let margin_x = (content.w as f32 * PAGE_MARGIN_RATIO).ceil() as u32;
    let margin_y = (content.h as f32 * PAGE_MARGIN_RATIO).ceil() as u32;
    let x0 = content.x.saturating_sub(margin_x);
    let y0 = content.y.saturating_sub(margin_y);
    let x1 = (content.x + content.w + margin_x).min(w);
    let y1 = (content.y + content.h + margin_y).min(h);

    image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image()
}

/// Split an over-tall strip into A4-proportioned pages at low-ink rows,
/// preserving reading order. Every input row lands in exactly one page.
pub fn split_tall_page(image: RgbImage) -> Vec<RgbImage> {
    let (w, h) = image.dimensions();
    let target_h = ((w as f32 * A4_PORTRAIT_RATIO).round() as u32).max(1);
    if (h as f32) <= PAGE_SPLIT_FACTOR * target_h as f32 {
        return vec![image];
    }

    let density = row_ink_density(&image);
    let min_page = (target_h / 2).max(1);

    let mut pages = Vec::new();
    let mut start = 0u32;
    while start < h {
        let hard_end = (start + target_h).min(h);
        if hard_end >= h {
            pages.push(crop_rows(&image, start, h));
            break;
        }

        // Cut at the calmest row near the A4 boundary so staff lines
        // are not sliced through.
        let lo = (start + min_page).max(hard_end.saturating_sub((target_h as f32 * 0.15) as u32));
        let hi = (hard_end + (target_h as f32 * 0.10) as u32).min(h - 1);
        let cut = (lo..=hi)
            .min_by(|a, b| {
                density[*a as usize]
                    .total_cmp(&density[*b as usize])
                    .then(a.abs_diff(hard_end).cmp(&b.abs_diff(hard_end)))
            })
            .unwrap_or(hard_end)
            .max(start + 1);

        pages.push(crop_rows(&image, start, cut));
        start = cut;
    }
    pages
}

/// Ink density (0..1) per row.
fn row_ink_density(image: &RgbImage) -> Vec<f32> {
    let gray = image::imageops::grayscale(image);
    let (w, h) = gray.dimensions();
    let mut density = vec![0.0f32; h as usize];
    for (_, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] < 128 {
            density[y as usize] += 1.0;
        }
    }
    for value in &mut density {
        *value /= w.max(1) as f32;
    }
    density
}

fn crop_rows(image: &RgbImage, y0: u32, y1: u32) -> RgbImage {
    image::imageops::crop_imm(image, 0, y0, image.width(), y1 - y0).to_image()
}

fn pad_to_width(image: RgbImage, target_w: u32) -> RgbImage {
    if image.width() >= target_w {
        return image;
    }
    let offset = (target_w - image.width()) / 2;
    let mut padded = RgbImage::from_pixel(target_w, image.height(), Rgb([255, 255, 255]));
    image::imageops::replace(&mut padded, &image, offset as i64, 0);
    padded
}

fn stack_vertically(pages: &[RgbImage]) -> RgbImage {
    let width = pages.iter().map(|p| p.width()).max().unwrap_or(1);
    let height: u32 = pages.iter().map(|p| p.height()).sum();
    let mut strip = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let mut y = 0i64;
    for page in pages {
        image::imageops::replace(&mut strip, page, 0, y);
        y += page.height() as i64;
    }
    strip
}

fn save_jpeg(image: &RgbImage, path: &Path) -> Result<(), PipelineError> {
    let file = std::fs::File::create(path)
        .map_err(|e| PipelineError::ExportFailed(e.to_string()))?;
    let mut writer = std::io::BufWriter::new(file);
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|e| PipelineError::ExportFailed(e.to_string()))
}

fn clear_previous_output(pages_dir: &Path, pdf_path: &Path) {
    if let Ok(entries) = std::fs::read_dir(pages_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_page = name.starts_with("page_")
                && (name.ends_with(".png") || name.ends_with(".jpg"));
            if is_page || name == SHEET_COMPLETE_NAME {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    let _ = std::fs::remove_file(pdf_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// White page with black content bands; `width x height`.
    fn scored_page(width: u32, height: u32, band_period: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let in_band = (y % band_period) < band_period * 2 / 3;
            let in_x = x > width / 10 && x < width - width / 10;
            if in_band && in_x {
                Rgb([20, 20, 20])
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    fn candidate(image: RgbImage) -> PageCandidate {
        PageCandidate {
            image,
            frame_indices: vec![0],
            cluster_id: None,
        }
    }

    fn png_only() -> ExportOptions {
        ExportOptions {
            formats: vec![ExportFormat::Png],
            include_raw_frames: false,
        }
    }

    #[test]
    fn filenames_are_zero_padded_and_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let pages_dir = dir.path().join("pages");
        let out = compose_pages(
            &[
                candidate(scored_page(300, 200, 40)),
                candidate(scored_page(280, 200, 40)),
            ],
            &png_only(),
            false,
            &pages_dir,
            &dir.path().join("pages.pdf"),
        )
        .unwrap();

        let names: Vec<String> = out
            .images
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["page_001.png", "page_002.png"]);
    }

    #[test]
    fn page_width_is_constant_within_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let out = compose_pages(
            &[
                candidate(scored_page(300, 200, 40)),
                candidate(scored_page(220, 200, 40)),
            ],
            &png_only(),
            false,
            &dir.path().join("pages"),
            &dir.path().join("pages.pdf"),
        )
        .unwrap();

        let widths: Vec<u32> = out
            .images
            .iter()
            .map(|p| image::open(p).unwrap().width())
            .collect();
        assert_eq!(widths.len(), 2);
        assert_eq!(widths[0], widths[1]);
    }

    #[test]
    fn tall_strips_split_into_a4_proportioned_pages() {
        // 200 px wide: A4 height ~283 px, split threshold ~849 px.
        let tall = scored_page(200, 1400, 50);
        let pages = split_tall_page(tall);
        assert!(pages.len() >= 4, "got {} pages", pages.len());

        let total: u32 = pages.iter().map(|p| p.height()).sum();
        assert_eq!(total, 1400, "rows must be partitioned exactly");
        for page in &pages {
            assert!(page.height() <= 566, "page too tall: {}", page.height());
        }
    }

    #[test]
    fn short_pages_are_not_split() {
        let page = scored_page(200, 500, 50);
        assert_eq!(split_tall_page(page).len(), 1);
    }

    #[test]
    fn scroll_jobs_with_multiple_pages_get_the_full_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let pages_dir = dir.path().join("pages");
        let out = compose_pages(
            &[
                candidate(scored_page(300, 200, 40)),
                candidate(scored_page(300, 200, 40)),
            ],
            &png_only(),
            true,
            &pages_dir,
            &dir.path().join("pages.pdf"),
        )
        .unwrap();
        let full = out.full_sheet.expect("scroll mode emits the full sheet");
        assert_eq!(full.file_name().unwrap(), SHEET_COMPLETE_NAME);
        assert!(full.is_file());

        // Page-cluster jobs do not get one.
        let out = compose_pages(
            &[
                candidate(scored_page(300, 200, 40)),
                candidate(scored_page(300, 200, 40)),
            ],
            &png_only(),
            false,
            &pages_dir,
            &dir.path().join("pages.pdf"),
        )
        .unwrap();
        assert!(out.full_sheet.is_none());
        assert!(!pages_dir.join(SHEET_COMPLETE_NAME).exists());
    }

    #[test]
    fn re_export_removes_stale_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pages_dir = dir.path().join("pages");
        let pdf = dir.path().join("pages.pdf");

        compose_pages(
            &[
                candidate(scored_page(300, 200, 40)),
                candidate(scored_page(300, 200, 40)),
            ],
            &png_only(),
            false,
            &pages_dir,
            &pdf,
        )
        .unwrap();
        assert!(pages_dir.join("page_002.png").exists());

        compose_pages(
            &[candidate(scored_page(300, 200, 40))],
            &png_only(),
            false,
            &pages_dir,
            &pdf,
        )
        .unwrap();
        assert!(pages_dir.join("page_001.png").exists());
        assert!(!pages_dir.join("page_002.png").exists());
    }

    #[test]
    fn pdf_export_writes_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExportOptions {
            formats: vec![ExportFormat::Png, ExportFormat::Pdf],
            include_raw_frames: false,
        };
        let pdf = dir.path().join("pages.pdf");
        let out = compose_pages(
            &[candidate(scored_page(300, 200, 40))],
            &options,
            false,
            &dir.path().join("pages"),
            &pdf,
        )
        .unwrap();
        assert_eq!(out.pdf.as_deref(), Some(pdf.as_path()));
        assert!(std::fs::read(&pdf).unwrap().starts_with(b"%PDF-1.4"));
    }

    #[test]
    fn empty_candidate_list_is_an_export_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = compose_pages(
            &[],
            &png_only(),
            false,
            &dir.path().join("pages"),
            &dir.path().join("pages.pdf"),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::ExportFailed(_)));
    }
}
