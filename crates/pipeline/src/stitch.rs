//! Scroll stitching and page clustering.
//!
//! Scroll mode aligns each capture against the accumulated strip by
//! correlating row-luma profiles inside a bounded overlap band and
//! appends only the unseen rows, so no strip row is ever written twice.
//! A correlation peak under [`MIN_OVERLAP_CORRELATION`] starts a new
//! strip instead of forcing a bad joint. Page mode clusters captures by
//! perceptual hash and keeps the member with the largest content box.

use image::{Rgb, RgbImage};

use drumsheet_core::layout::LayoutMode;
use drumsheet_core::options::StitchOptions;
use drumsheet_core::phash::hamming_distance;

use crate::error::PipelineError;
use crate::rectify::RectifiedCapture;

/// Reject an overlap whose correlation peak is below this.
pub const MIN_OVERLAP_CORRELATION: f32 = 0.35;

/// Minimum rows required to trust a profile correlation.
const MIN_OVERLAP_ROWS: usize = 24;

/// Fraction of columns trimmed from each side before profiling, to keep
/// side overlays out of the row statistics.
const PROFILE_COLUMN_TRIM: f32 = 0.08;

/// A proposed output page with provenance for review.
#[derive(Debug)]
pub struct PageCandidate {
    pub image: RgbImage,
    /// Source frame indices that contributed to this page.
    pub frame_indices: Vec<u64>,
    /// Cluster ordinal in page mode.
    pub cluster_id: Option<usize>,
}

/// Assemble page candidates from deduplicated captures.
pub fn assemble_pages(
    captures: Vec<RectifiedCapture>,
    options: &StitchOptions,
    mode: LayoutMode,
) -> Result<Vec<PageCandidate>, PipelineError> {
    if captures.is_empty() {
        return Ok(Vec::new());
    }
    match mode {
        LayoutMode::PageTurn | LayoutMode::BottomBar => {
            Ok(cluster_pages(captures, options.dedupe_level.hamming_threshold()))
        }
        LayoutMode::FullScroll => {
            if !options.enable {
                Ok(captures
                    .into_iter()
                    .map(|c| PageCandidate {
                        image: c.image,
                        frame_indices: vec![c.frame_index],
                        cluster_id: None,
                    })
                    .collect())
            } else {
                scroll_stitch(captures, options.overlap_threshold)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scroll mode
// ---------------------------------------------------------------------------

struct StripBuilder {
    image: RgbImage,
    frame_indices: Vec<u64>,
}

impl StripBuilder {
    fn new(capture: RectifiedCapture) -> Self {
        Self {
            image: capture.image,
            frame_indices: vec![capture.frame_index],
        }
    }

    fn finish(self) -> PageCandidate {
        PageCandidate {
            image: self.image,
            frame_indices: self.frame_indices,
            cluster_id: None,
        }
    }
}

fn scroll_stitch(
    captures: Vec<RectifiedCapture>,
    overlap_band: f32,
) -> Result<Vec<PageCandidate>, PipelineError> {
    let band = if overlap_band > 0.0 { overlap_band } else { 0.2 };
    let mut pages: Vec<PageCandidate> = Vec::new();
    let mut captures = captures.into_iter();
    let first = captures.next().expect("checked non-empty");
    let mut strip = StripBuilder::new(first);
    let mut restarts = 0usize;

    for capture in captures {
        let (strip_img, next_img) = align_widths(strip.image, capture.image);
        strip.image = strip_img;

        let max_shift = ((next_img.height() as f32 * band).round() as usize).max(1);
        match estimate_scroll_offset(&strip.image, &next_img, max_shift) {
            Some((shift, correlation)) if correlation >= MIN_OVERLAP_CORRELATION => {
                tracing::debug!(shift, correlation, "scroll overlap accepted");
                if shift > 0 {
                    append_rows(&mut strip.image, &next_img, shift);
                }
                strip.frame_indices.push(capture.frame_index);
            }
            _ => {
                restarts += 1;
                tracing::debug!("no overlap peak above threshold, starting a new strip");
                pages.push(strip.finish());
                strip = StripBuilder::new(RectifiedCapture {
                    frame_index: capture.frame_index,
                    image: next_img,
                    hash: capture.hash,
                    content_box: capture.content_box,
                });
            }
        }
    }
    pages.push(strip.finish());

    if restarts > 0 {
        tracing::info!(restarts, strips = pages.len(), "scroll stitching restarted");
    }
    Ok(pages)
}

/// Estimate how many rows the capture scrolled past the strip's tail.
///
/// Returns `(shift, correlation)` for the best alignment of the
/// capture's top against the strip's bottom within `max_shift` rows.
fn estimate_scroll_offset(
    strip: &RgbImage,
    next: &RgbImage,
    max_shift: usize,
) -> Option<(usize, f32)> {
    let window = (next.height().min(strip.height())) as usize;
    if window < MIN_OVERLAP_ROWS {
        return None;
    }

    let tail = row_profile_tail(strip, window);
    let head = row_profile_tail(next, next.height() as usize);

    let mut best: Option<(usize, f32)> = None;
    for shift in 0..=max_shift.min(window - 1) {
        let overlap = window - shift;
        if overlap < MIN_OVERLAP_ROWS {
            break;
        }
        // Strip tail row (shift + i) lines up with capture row i.
        let corr = profile_correlation(&tail[shift..], &head[..overlap]);
        if best.map(|(_, c)| corr > c).unwrap_or(true) {
            best = Some((shift, corr));
        }
    }
    best
}

/// Mean luma per row over the last `rows` rows, side columns trimmed.
fn row_profile_tail(image: &RgbImage, rows: usize) -> Vec<f32> {
    let (w, h) = image.dimensions();
    let rows = rows.min(h as usize);
    let trim = ((w as f32 * PROFILE_COLUMN_TRIM) as u32).min(w / 4);
    let (x0, x1) = (trim, w - trim);

    let mut profile = Vec::with_capacity(rows);
    for y in (h as usize - rows)..h as usize {
        let mut sum = 0u64;
        for x in x0..x1 {
            let Rgb([r, g, b]) = *image.get_pixel(x, y as u32);
            sum += (r as u64 + g as u64 + b as u64) / 3;
        }
        profile.push(sum as f32 / (x1 - x0).max(1) as f32);
    }
    profile
}

/// Zero-mean normalized correlation of two equal-length profiles.
fn profile_correlation(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len() as f32;
    if n == 0.0 {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f32>() / n;
    let mean_b = b.iter().sum::<f32>() / n;

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (va, vb) in a.iter().zip(b.iter()) {
        let da = va - mean_a;
        let db = vb - mean_b;
        dot += da * db;
        norm_a += da * da;
        norm_b += db * db;
    }
    if norm_a < 1e-6 || norm_b < 1e-6 {
        // Flat overlap carries no alignment signal.
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Append the capture's bottom `shift` rows to the strip.
fn append_rows(strip: &mut RgbImage, next: &RgbImage, shift: usize) {
    let shift = shift.min(next.height() as usize) as u32;
    let (w, strip_h) = strip.dimensions();
    let mut grown = RgbImage::new(w, strip_h + shift);
    image::imageops::replace(&mut grown, strip, 0, 0);
    let new_rows = image::imageops::crop_imm(next, 0, next.height() - shift, w, shift).to_image();
    image::imageops::replace(&mut grown, &new_rows, 0, strip_h as i64);
    *strip = grown;
}

/// Pad the narrower image to the wider one's width with paper white,
/// centered.
fn align_widths(a: RgbImage, b: RgbImage) -> (RgbImage, RgbImage) {
    let target = a.width().max(b.width());
    (pad_to_width(a, target), pad_to_width(b, target))
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

// ---------------------------------------------------------------------------
// Page mode
// ---------------------------------------------------------------------------

/// Cluster captures by hash distance and keep one canonical page per
/// cluster: the member with the largest content bounding box.
fn cluster_pages(captures: Vec<RectifiedCapture>, threshold: u32) -> Vec<PageCandidate> {
    struct Cluster {
        hash: u64,
        frame_indices: Vec<u64>,
        canonical: usize,
        canonical_area: u64,
    }

    let mut slots: Vec<Option<RectifiedCapture>> = captures.into_iter().map(Some).collect();
    let mut clusters: Vec<Cluster> = Vec::new();

    for idx in 0..slots.len() {
        let (hash, frame_index, area) = {
            let capture = slots[idx].as_ref().expect("slot still filled");
            (
                capture.hash,
                capture.frame_index,
                capture.content_box.map(|b| b.area()).unwrap_or(0),
            )
        };
        match clusters
            .iter_mut()
            .find(|c| hamming_distance(hash, c.hash) <= threshold)
        {
            Some(cluster) => {
                cluster.frame_indices.push(frame_index);
                if area > cluster.canonical_area {
                    cluster.canonical = idx;
                    cluster.canonical_area = area;
                }
            }
            None => clusters.push(Cluster {
                hash,
                frame_indices: vec![frame_index],
                canonical: idx,
                canonical_area: area,
            }),
        }
    }

    clusters
        .into_iter()
        .enumerate()
        .map(|(cluster_id, cluster)| {
            let capture = slots[cluster.canonical].take().expect("canonical taken once");
            PageCandidate {
                image: capture.image,
                frame_indices: cluster.frame_indices,
                cluster_id: Some(cluster_id),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rectify::ContentBox;

    /// Tall virtual sheet with a distinctive luma per row.
    fn sheet_window(top: u32, height: u32, width: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |_, y| {
            let row = top + y;
            let v = ((row * 37) % 200 + 30) as u8;
            Rgb([v, v, v])
        })
    }

    fn capture(index: u64, image: RgbImage) -> RectifiedCapture {
        RectifiedCapture {
            frame_index: index,
            image,
            hash: 0,
            content_box: None,
        }
    }

    fn scroll_options() -> StitchOptions {
        StitchOptions {
            enable: true,
            overlap_threshold: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn constant_scroll_builds_one_exact_strip() {
        let captures = vec![
            capture(0, sheet_window(0, 120, 200)),
            capture(1, sheet_window(40, 120, 200)),
            capture(2, sheet_window(80, 120, 200)),
        ];
        let pages =
            assemble_pages(captures, &scroll_options(), LayoutMode::FullScroll).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].frame_indices, vec![0, 1, 2]);

        // Strip must equal the underlying sheet rows 0..200 exactly:
        // appended rows are copied, never rewritten or blended.
        let expected = sheet_window(0, 200, 200);
        assert_eq!(pages[0].image, expected);
    }

    #[test]
    fn strip_height_never_exceeds_sum_of_inputs() {
        let captures = vec![
            capture(0, sheet_window(0, 120, 200)),
            capture(1, sheet_window(55, 120, 200)),
        ];
        let pages =
            assemble_pages(captures, &scroll_options(), LayoutMode::FullScroll).unwrap();
        let total: u32 = pages.iter().map(|p| p.image.height()).sum();
        assert!(total <= 240);
    }

    #[test]
    fn uncorrelated_content_starts_a_new_strip() {
        let a = sheet_window(0, 120, 200);
        // Invert the pattern so every alignment anti-correlates.
        let b = RgbImage::from_fn(200, 120, |x, y| {
            let Rgb([v, ..]) = *a.get_pixel(x, y);
            Rgb([255 - v, 255 - v, 255 - v])
        });
        let pages = assemble_pages(
            vec![capture(0, a), capture(1, b)],
            &scroll_options(),
            LayoutMode::FullScroll,
        )
        .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].frame_indices, vec![0]);
        assert_eq!(pages[1].frame_indices, vec![1]);
    }

    #[test]
    fn disabled_stitching_passes_captures_through() {
        let captures = vec![
            capture(0, sheet_window(0, 60, 100)),
            capture(1, sheet_window(500, 60, 100)),
        ];
        let options = StitchOptions::default();
        let pages = assemble_pages(captures, &options, LayoutMode::FullScroll).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.cluster_id.is_none()));
    }

    #[test]
    fn mixed_widths_are_padded_not_cropped() {
        let captures = vec![
            capture(0, sheet_window(0, 120, 180)),
            capture(1, sheet_window(40, 120, 200)),
        ];
        let pages =
            assemble_pages(captures, &scroll_options(), LayoutMode::FullScroll).unwrap();
        for page in &pages {
            assert_eq!(page.image.width(), 200);
        }
    }

    #[test]
    fn near_hashes_cluster_and_largest_content_box_wins() {
        let small = RectifiedCapture {
            frame_index: 0,
            image: RgbImage::from_pixel(10, 10, Rgb([1, 1, 1])),
            hash: 0b0000,
            content_box: Some(ContentBox { x: 0, y: 0, w: 4, h: 4 }),
        };
        let large = RectifiedCapture {
            frame_index: 1,
            image: RgbImage::from_pixel(10, 10, Rgb([2, 2, 2])),
            hash: 0b0001,
            content_box: Some(ContentBox { x: 0, y: 0, w: 8, h: 8 }),
        };
        let distinct = RectifiedCapture {
            frame_index: 2,
            image: RgbImage::from_pixel(10, 10, Rgb([3, 3, 3])),
            hash: u64::MAX,
            content_box: None,
        };

        let options = StitchOptions::default();
        let pages = assemble_pages(
            vec![small, large, distinct],
            &options,
            LayoutMode::PageTurn,
        )
        .unwrap();
        assert_eq!(pages.len(), 2);
        // First cluster keeps the larger-content member as canonical.
        assert_eq!(pages[0].frame_indices, vec![0, 1]);
        assert_eq!(pages[0].image.get_pixel(0, 0).0, [2, 2, 2]);
        assert_eq!(pages[0].cluster_id, Some(0));
        assert_eq!(pages[1].frame_indices, vec![2]);
    }
}
