//! Perspective rectification of the tracked ROI.
//!
//! Each tracked quad is warped to a canonical rectangle whose shorter
//! side is [`RECTIFY_SHORT_SIDE`] px, the background tone is normalized
//! toward paper white, and a perceptual hash plus a content bounding
//! box are attached for the dedup and stitching stages.

use image::{GrayImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

use drumsheet_core::geometry::Quad;
use drumsheet_core::phash::perceptual_hash;

use crate::error::PipelineError;

/// Canonical shorter-side length of a rectified capture.
pub const RECTIFY_SHORT_SIDE: f32 = 1200.0;
pub const RECTIFY_SHORT_SIDE_MIN: f32 = 800.0;
pub const RECTIFY_SHORT_SIDE_MAX: f32 = 2000.0;

/// Background histogram mode is shifted to this luminance.
pub const BACKGROUND_TARGET_LUMA: f32 = 245.0;

/// Fraction of rows at the top and bottom sampled for the background
/// histogram.
const BACKGROUND_SAMPLE_ROWS: f32 = 0.05;

/// Luma below this counts as ink for the content bounding box.
const INK_LUMA_MAX: u8 = 128;

/// Minimum ink density for a row/column to count as content.
const CONTENT_DENSITY_MIN: f32 = 0.003;

/// Content bounding box in capture pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl ContentBox {
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

/// A warped rectangular capture from one frame.
pub struct RectifiedCapture {
    pub frame_index: u64,
    pub image: RgbImage,
    /// 64-bit perceptual hash of the rectified image.
    pub hash: u64,
    pub content_box: Option<ContentBox>,
}

/// Canonical output dimensions for a quad: the shorter side maps to
/// [`RECTIFY_SHORT_SIDE`] (clamped to the allowed range), preserving
/// the quad's aspect ratio.
pub fn target_dimensions(quad: &Quad) -> (u32, u32) {
    let w = quad.mean_width().max(1.0);
    let h = quad.mean_height().max(1.0);
    let short = w.min(h);
    let target_short = RECTIFY_SHORT_SIDE.clamp(RECTIFY_SHORT_SIDE_MIN, RECTIFY_SHORT_SIDE_MAX);
    let scale = target_short / short;
    (
        (w * scale).round().max(2.0) as u32,
        (h * scale).round().max(2.0) as u32,
    )
}

/// Warp the quad out of `frame` into a canonical rectangle.
pub fn rectify_image(
    frame: &RgbImage,
    quad: &Quad,
    frame_index: u64,
) -> Result<RectifiedCapture, PipelineError> {
    let (tw, th) = target_dimensions(quad);
    let src: [(f32, f32); 4] = quad.points.map(|p| (p.x, p.y));
    let dst: [(f32, f32); 4] = [
        (0.0, 0.0),
        (tw as f32, 0.0),
        (tw as f32, th as f32),
        (0.0, th as f32),
    ];

    let projection = Projection::from_control_points(src, dst).ok_or_else(|| {
        PipelineError::InputInvalid("roi is degenerate and cannot be rectified".into())
    })?;

    let mut warped = RgbImage::new(tw, th);
    warp_into(
        frame,
        &projection,
        Interpolation::Bilinear,
        Rgb([255, 255, 255]),
        &mut warped,
    );

    normalize_background(&mut warped);

    let gray = image::imageops::grayscale(&warped);
    let hash = perceptual_hash(gray.as_raw(), tw, th);
    let content_box = content_bounding_box(&gray);

    Ok(RectifiedCapture {
        frame_index,
        image: warped,
        hash,
        content_box,
    })
}

/// Shift the background tone so the histogram mode of the outer rows
/// lands near paper white, scaling luminance so black strokes stay
/// black.
pub fn normalize_background(image: &mut RgbImage) {
    let Some(mode) = background_mode(image) else {
        return;
    };
    if mode == 0 || (mode as f32) >= BACKGROUND_TARGET_LUMA {
        return;
    }
    let scale = BACKGROUND_TARGET_LUMA / mode as f32;
    for pixel in image.pixels_mut() {
        for channel in &mut pixel.0 {
            *channel = (*channel as f32 * scale).min(255.0) as u8;
        }
    }
}

/// Histogram mode of the luma in the top and bottom 5% of rows.
fn background_mode(image: &RgbImage) -> Option<u8> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let band = ((h as f32 * BACKGROUND_SAMPLE_ROWS).ceil() as u32).max(1).min(h);

    let mut histogram = [0u32; 256];
    let mut tally_row = |y: u32| {
        for x in 0..w {
            let Rgb([r, g, b]) = *image.get_pixel(x, y);
            let luma =
                (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as usize;
            histogram[luma.min(255)] += 1;
        }
    };
    for y in 0..band {
        tally_row(y);
    }
    for y in h.saturating_sub(band)..h {
        tally_row(y);
    }

    histogram
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)
        .map(|(value, _)| value as u8)
}

/// Bounding box of rows/columns whose ink density clears the floor.
pub fn content_bounding_box(gray: &GrayImage) -> Option<ContentBox> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return None;
    }

    let mut row_ink = vec![0u32; h as usize];
    let mut col_ink = vec![0u32; w as usize];
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] < INK_LUMA_MAX {
            row_ink[y as usize] += 1;
            col_ink[x as usize] += 1;
        }
    }

    let row_floor = (w as f32 * CONTENT_DENSITY_MIN).max(1.0) as u32;
    let col_floor = (h as f32 * CONTENT_DENSITY_MIN).max(1.0) as u32;
    let active_rows: Vec<u32> = (0..h).filter(|y| row_ink[*y as usize] >= row_floor).collect();
    let active_cols: Vec<u32> = (0..w).filter(|x| col_ink[*x as usize] >= col_floor).collect();

    let (&top, &bottom) = (active_rows.first()?, active_rows.last()?);
    let (&left, &right) = (active_cols.first()?, active_cols.last()?);
    Some(ContentBox {
        x: left,
        y: top,
        w: right - left + 1,
        h: bottom - top + 1,
    })
}
