//! Layout hints, detection profiles, and fallback regions.
//!
//! The layout mode decides how the tracker refines the user's ROI, how
//! duplicates are collapsed, and whether the stitcher builds a scroll
//! strip or clusters pages.

use serde::{Deserialize, Serialize};

use crate::geometry::Quad;

/// Caller-supplied layout hint. `Auto` is resolved from the anchor
/// quad's aspect ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutHint {
    #[default]
    Auto,
    BottomBar,
    FullScroll,
    PageTurn,
}

/// Resolved layout mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    BottomBar,
    FullScroll,
    PageTurn,
}

impl LayoutMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LayoutMode::BottomBar => "bottom_bar",
            LayoutMode::FullScroll => "full_scroll",
            LayoutMode::PageTurn => "page_turn",
        }
    }
}

/// An anchor quad at least this wide relative to its height is treated
/// as a bottom score bar.
pub const BOTTOM_BAR_ASPECT_MIN: f32 = 2.25;

/// Resolve a layout hint against the anchor quad's aspect ratio.
///
/// An explicit hint wins. Otherwise an aspect ratio of at least
/// [`BOTTOM_BAR_ASPECT_MIN`] selects `bottom_bar` and anything else
/// falls back to `full_scroll`.
pub fn resolve_layout(hint: LayoutHint, anchor_aspect: Option<f32>) -> LayoutMode {
    match hint {
        LayoutHint::BottomBar => LayoutMode::BottomBar,
        LayoutHint::FullScroll => LayoutMode::FullScroll,
        LayoutHint::PageTurn => LayoutMode::PageTurn,
        LayoutHint::Auto => match anchor_aspect {
            Some(aspect) if aspect >= BOTTOM_BAR_ASPECT_MIN => LayoutMode::BottomBar,
            _ => LayoutMode::FullScroll,
        },
    }
}

// ---------------------------------------------------------------------------
// Tracking profile
// ---------------------------------------------------------------------------

/// Per-layout tracking parameters.
#[derive(Debug, Clone, Copy)]
pub struct TrackingProfile {
    pub mode: LayoutMode,
    /// Low-pass window over accepted quads.
    pub smoothing_window: usize,
    /// Reject a candidate whose corner moves further than this fraction
    /// of the frame dimension from the filtered quad.
    pub max_corner_shift: f32,
    /// Normalized correlation below this signals a page transition.
    pub page_transition_correlation: f32,
    /// Consecutive low-confidence frames tolerated before falling back
    /// to the layout's fixed region.
    pub max_low_confidence_run: u32,
}

/// Low-pass window over the last accepted quads.
pub const SMOOTHING_WINDOW: usize = 5;

/// Corner-shift rejection limit shared by all layouts.
pub const MAX_CORNER_SHIFT_RATIO: f32 = 0.08;

/// Correlation drop that signals a page transition.
pub const PAGE_TRANSITION_CORRELATION: f32 = 0.55;

/// Consecutive low-confidence frames before the fixed fallback region
/// takes over.
pub const MAX_LOW_CONFIDENCE_RUN: u32 = 3;

pub fn tracking_profile(mode: LayoutMode) -> TrackingProfile {
    TrackingProfile {
        mode,
        smoothing_window: SMOOTHING_WINDOW,
        max_corner_shift: MAX_CORNER_SHIFT_RATIO,
        page_transition_correlation: PAGE_TRANSITION_CORRELATION,
        max_low_confidence_run: MAX_LOW_CONFIDENCE_RUN,
    }
}

// ---------------------------------------------------------------------------
// Fallback regions
// ---------------------------------------------------------------------------

/// Bottom strip height as a fraction of the frame for `bottom_bar`.
pub const BOTTOM_FALLBACK_HEIGHT_RATIO: f32 = 0.30;

/// Centered box size as a fraction of the frame for the other layouts.
pub const CENTER_FALLBACK_RATIO: f32 = 0.80;

/// Fixed region used once tracking confidence stays low: the bottom 30%
/// of the frame for `bottom_bar`, a centered 80% box otherwise.
pub fn fallback_region(mode: LayoutMode, frame_w: f32, frame_h: f32) -> Quad {
    match mode {
        LayoutMode::BottomBar => {
            let top = frame_h * (1.0 - BOTTOM_FALLBACK_HEIGHT_RATIO);
            Quad::from_rect(0.0, top, frame_w, frame_h - top)
        }
        LayoutMode::FullScroll | LayoutMode::PageTurn => {
            let margin = (1.0 - CENTER_FALLBACK_RATIO) / 2.0;
            Quad::from_rect(
                frame_w * margin,
                frame_h * margin,
                frame_w * CENTER_FALLBACK_RATIO,
                frame_h * CENTER_FALLBACK_RATIO,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_hints_win_over_aspect() {
        assert_eq!(
            resolve_layout(LayoutHint::PageTurn, Some(5.0)),
            LayoutMode::PageTurn
        );
        assert_eq!(
            resolve_layout(LayoutHint::FullScroll, Some(5.0)),
            LayoutMode::FullScroll
        );
    }

    #[test]
    fn auto_picks_bottom_bar_for_wide_anchors() {
        assert_eq!(
            resolve_layout(LayoutHint::Auto, Some(2.25)),
            LayoutMode::BottomBar
        );
        assert_eq!(
            resolve_layout(LayoutHint::Auto, Some(2.24)),
            LayoutMode::FullScroll
        );
        assert_eq!(resolve_layout(LayoutHint::Auto, None), LayoutMode::FullScroll);
    }

    #[test]
    fn every_layout_smooths_over_the_last_five_quads() {
        assert_eq!(tracking_profile(LayoutMode::PageTurn).smoothing_window, 5);
        assert_eq!(tracking_profile(LayoutMode::BottomBar).smoothing_window, 5);
        assert_eq!(tracking_profile(LayoutMode::FullScroll).smoothing_window, 5);
    }

    #[test]
    fn bottom_fallback_covers_bottom_third() {
        let quad = fallback_region(LayoutMode::BottomBar, 1920.0, 1080.0);
        let (x0, y0, x1, y1) = quad.bounding_box();
        assert_eq!((x0, x1), (0.0, 1920.0));
        assert!((y0 - 756.0).abs() < 1e-3);
        assert_eq!(y1, 1080.0);
    }

    #[test]
    fn center_fallback_is_centered() {
        let quad = fallback_region(LayoutMode::FullScroll, 1000.0, 1000.0);
        let (x0, y0, x1, y1) = quad.bounding_box();
        assert_eq!((x0, y0, x1, y1), (100.0, 100.0, 900.0, 900.0));
    }

    #[test]
    fn layout_hint_deserializes_snake_case() {
        let hint: LayoutHint = serde_json::from_str("\"bottom_bar\"").unwrap();
        assert_eq!(hint, LayoutHint::BottomBar);
    }
}
