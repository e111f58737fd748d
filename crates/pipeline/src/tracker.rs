//! Per-frame ROI tracking.
//!
//! The user-anchored quad is ground truth; tracking exists to survive
//! small camera jitter and to notice page changes. Each frame produces
//! a refined candidate, which is accepted only when it stays close to
//! the low-pass filtered quad. A run of low-confidence frames drops the
//! tracker onto the layout's fixed fallback region, and a correlation
//! collapse between consecutive rectified candidates marks a page
//! transition and restarts stabilization.

use std::collections::VecDeque;

use image::{GrayImage, RgbImage};

use drumsheet_core::geometry::{Point, Quad};
use drumsheet_core::layout::{fallback_region, tracking_profile, LayoutMode, TrackingProfile};

/// Per-frame tracking outcome flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    None,
    /// Content changed enough to be a page turn or scroll reset.
    PageTransition,
    /// Candidate rejected; the previous stabilized quad was reused.
    ConfidenceLow,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackedRegion {
    pub quad: Quad,
    pub event: TrackEvent,
}

/// Downscaled edge length for the content-change signature.
const SIGNATURE_SIZE: u32 = 64;

/// Row brightness (0..1) above which a row counts as part of a bright
/// score strip.
const STRIP_ROW_BRIGHTNESS_MIN: f32 = 0.54;

/// A detected bottom strip must be at least this tall.
const STRIP_MIN_HEIGHT_RATIO: f32 = 0.10;

/// A detected page region must occupy at least this share of the frame.
const PAGE_MIN_AREA_RATIO: f32 = 0.28;

pub struct RoiTracker {
    anchor: Quad,
    profile: TrackingProfile,
    frame_w: f32,
    frame_h: f32,
    history: VecDeque<Quad>,
    low_confidence_run: u32,
    fallback_active: bool,
    prev_signature: Option<GrayImage>,
}

impl RoiTracker {
    pub fn new(anchor: Quad, mode: LayoutMode, frame_w: u32, frame_h: u32) -> Self {
        let profile = tracking_profile(mode);
        let mut history = VecDeque::with_capacity(profile.smoothing_window);
        history.push_back(anchor);
        Self {
            anchor,
            profile,
            frame_w: frame_w as f32,
            frame_h: frame_h as f32,
            history,
            low_confidence_run: 0,
            fallback_active: false,
            prev_signature: None,
        }
    }

    pub fn mode(&self) -> LayoutMode {
        self.profile.mode
    }

    /// Track one frame, producing the stabilized quad and event flag.
    pub fn track(&mut self, image: &RgbImage) -> TrackedRegion {
        let gray = image::imageops::grayscale(image);
        let candidate = self.refine_candidate(&gray).unwrap_or(self.anchor);

        let filtered = self.filtered_quad();
        let mut event = TrackEvent::None;

        let shift = candidate.max_corner_shift(&filtered, self.frame_w, self.frame_h);
        let mut accepted = if shift > self.profile.max_corner_shift {
            self.low_confidence_run += 1;
            event = TrackEvent::ConfidenceLow;
            filtered
        } else {
            self.low_confidence_run = 0;
            self.push_history(candidate);
            self.filtered_quad()
        };

        if self.low_confidence_run > self.profile.max_low_confidence_run {
            accepted = fallback_region(self.profile.mode, self.frame_w, self.frame_h);
            if !self.fallback_active {
                tracing::warn!(
                    mode = self.profile.mode.as_str(),
                    "tracking confidence stayed low, switching to the fixed fallback region"
                );
                self.fallback_active = true;
            }
            self.history.clear();
            self.history.push_back(accepted);
        }

        // Content-change detection runs on the accepted region so a
        // stable quad with swapped content still registers.
        let signature = region_signature(&gray, &accepted);
        if let Some(prev) = &self.prev_signature {
            let correlation = normalized_correlation(prev, &signature);
            if correlation < self.profile.page_transition_correlation {
                event = TrackEvent::PageTransition;
                self.history.clear();
                self.history.push_back(accepted);
                self.low_confidence_run = 0;
            }
        }
        self.prev_signature = Some(signature);

        TrackedRegion {
            quad: accepted,
            event,
        }
    }

    fn push_history(&mut self, quad: Quad) {
        if self.history.len() >= self.profile.smoothing_window {
            self.history.pop_front();
        }
        self.history.push_back(quad);
    }

    /// Component-wise median over the accepted-quad window.
    fn filtered_quad(&self) -> Quad {
        if self.history.is_empty() {
            return self.anchor;
        }
        let mut points = [Point::new(0.0, 0.0); 4];
        for (corner, point) in points.iter_mut().enumerate() {
            let mut xs: Vec<f32> = self.history.iter().map(|q| q.points[corner].x).collect();
            let mut ys: Vec<f32> = self.history.iter().map(|q| q.points[corner].y).collect();
            xs.sort_by(f32::total_cmp);
            ys.sort_by(f32::total_cmp);
            *point = Point::new(xs[xs.len() / 2], ys[ys.len() / 2]);
        }
        Quad { points }
    }

    /// Refine the anchor against the current frame. `None` falls back
    /// to the anchor itself.
    fn refine_candidate(&self, gray: &GrayImage) -> Option<Quad> {
        match self.profile.mode {
            LayoutMode::BottomBar => detect_bottom_strip(gray),
            LayoutMode::FullScroll | LayoutMode::PageTurn => detect_page_region(gray),
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate detection
// ---------------------------------------------------------------------------

/// Find a bright, wide strip in the lower half of the frame: the shape
/// a rendered score bar takes in performance videos.
pub(crate) fn detect_bottom_strip(gray: &GrayImage) -> Option<Quad> {
    let (w, h) = gray.dimensions();
    if w < 16 || h < 16 {
        return None;
    }
    let y_start = (h as f32 * 0.45) as u32;

    // Mean brightness per row, normalized to 0..1.
    let mut bright_rows: Vec<bool> = Vec::with_capacity((h - y_start) as usize);
    for y in y_start..h {
        let mut sum = 0u64;
        for x in 0..w {
            sum += gray.get_pixel(x, y).0[0] as u64;
        }
        let mean = sum as f32 / (w as f32 * 255.0);
        bright_rows.push(mean > STRIP_ROW_BRIGHTNESS_MIN);
    }

    // Longest consecutive bright run.
    let mut best: Option<(usize, usize)> = None;
    let mut run_start: Option<usize> = None;
    for (idx, bright) in bright_rows.iter().chain([&false]).enumerate() {
        match (*bright, run_start) {
            (true, None) => run_start = Some(idx),
            (false, Some(start)) => {
                if best.map(|(s, e)| idx - 1 - start > e - s).unwrap_or(true) {
                    best = Some((start, idx - 1));
                }
                run_start = None;
            }
            _ => {}
        }
    }

    let (start, end) = best?;
    let y1 = y_start + start as u32;
    let y2 = y_start + end as u32;
    if (y2 - y1) < (h as f32 * STRIP_MIN_HEIGHT_RATIO) as u32 {
        return None;
    }

    let margin = (w as f32 * 0.01).max(1.0);
    Some(Quad::from_rect(
        margin,
        y1 as f32,
        w as f32 - margin * 2.0,
        (y2 - y1) as f32,
    ))
}

/// Find the dominant bright page region covering a plausible share of
/// the frame.
pub(crate) fn detect_page_region(gray: &GrayImage) -> Option<Quad> {
    let (w, h) = gray.dimensions();
    if w < 16 || h < 16 {
        return None;
    }
    let threshold = imageproc::contrast::otsu_level(gray).max(140);

    let mut min_x = w;
    let mut max_x = 0u32;
    let mut min_y = h;
    let mut max_y = 0u32;
    let mut bright = 0u64;
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] >= threshold {
            bright += 1;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }
    }
    if bright == 0 || min_x > max_x || min_y > max_y {
        return None;
    }

    let box_w = (max_x - min_x + 1) as f32;
    let box_h = (max_y - min_y + 1) as f32;
    let area_ratio = (box_w * box_h) / (w as f32 * h as f32);
    if area_ratio < PAGE_MIN_AREA_RATIO {
        return None;
    }
    Some(Quad::from_rect(min_x as f32, min_y as f32, box_w, box_h))
}

// ---------------------------------------------------------------------------
// Content-change signature
// ---------------------------------------------------------------------------

/// Downscaled crop of the region, used for frame-to-frame correlation.
fn region_signature(gray: &GrayImage, quad: &Quad) -> GrayImage {
    let (w, h) = gray.dimensions();
    let (x0, y0, x1, y1) = quad.bounding_box();
    let x0 = (x0.max(0.0) as u32).min(w.saturating_sub(1));
    let y0 = (y0.max(0.0) as u32).min(h.saturating_sub(1));
    let cw = ((x1.min(w as f32) - x0 as f32).max(1.0)) as u32;
    let ch = ((y1.min(h as f32) - y0 as f32).max(1.0)) as u32;

    let crop = image::imageops::crop_imm(gray, x0, y0, cw.max(1), ch.max(1)).to_image();
    image::imageops::resize(
        &crop,
        SIGNATURE_SIZE,
        SIGNATURE_SIZE,
        image::imageops::FilterType::Triangle,
    )
}

/// Zero-mean normalized correlation between two equally sized images,
/// in [-1, 1]. Two flat images correlate perfectly.
pub(crate) fn normalized_correlation(a: &GrayImage, b: &GrayImage) -> f32 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let n = (a.width() * a.height()) as f64;
    if n == 0.0 {
        return 1.0;
    }

    let mean = |img: &GrayImage| img.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n;
    let (mean_a, mean_b) = (mean(a), mean(b));

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let da = pa.0[0] as f64 - mean_a;
        let db = pb.0[0] as f64 - mean_b;
        dot += da * db;
        norm_a += da * da;
        norm_b += db * db;
    }
    if norm_a < 1e-9 || norm_b < 1e-9 {
        return 1.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}
