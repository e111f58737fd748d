//! Quadrilateral region-of-interest geometry.
//!
//! A [`Quad`] is four points in source-frame pixel coordinates, ordered
//! top-left, top-right, bottom-right, bottom-left. User-supplied points
//! arrive in arbitrary order and are normalized with [`Quad::ordered`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Minimum ROI area as a fraction of the source frame area. Anything
/// smaller is rejected as "too small" at validation time.
pub const MIN_ROI_AREA_RATIO: f32 = 0.01;

/// Minimum edge length (px) accepted when re-cropping a capture.
pub const MIN_CROP_EDGE_PX: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn distance(self, other: Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Four corner points ordered TL, TR, BR, BL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "QuadRepr", into = "QuadRepr")]
pub struct Quad {
    pub points: [Point; 4],
}

/// Wire representation: `[[x, y], [x, y], [x, y], [x, y]]`.
type QuadRepr = [[f32; 2]; 4];

impl From<QuadRepr> for Quad {
    fn from(repr: QuadRepr) -> Self {
        Quad::ordered(repr.map(|[x, y]| Point::new(x, y)))
    }
}

impl From<Quad> for QuadRepr {
    fn from(quad: Quad) -> Self {
        quad.points.map(|p| [p.x, p.y])
    }
}

impl Quad {
    /// Normalize four arbitrary corner points into TL, TR, BR, BL order.
    ///
    /// TL minimizes `x + y`, BR maximizes it; TR minimizes `y - x`,
    /// BL maximizes it.
    pub fn ordered(points: [Point; 4]) -> Self {
        fn sum(p: &Point) -> f32 {
            p.x + p.y
        }
        fn diff(p: &Point) -> f32 {
            p.y - p.x
        }

        let extreme = |key: fn(&Point) -> f32, largest: bool| {
            let mut best = points[0];
            for p in &points[1..] {
                let replace = if largest {
                    key(p) > key(&best)
                } else {
                    key(p) < key(&best)
                };
                if replace {
                    best = *p;
                }
            }
            best
        };

        let tl = extreme(sum, false);
        let br = extreme(sum, true);
        let tr = extreme(diff, false);
        let bl = extreme(diff, true);

        Self {
            points: [tl, tr, br, bl],
        }
    }

    /// Axis-aligned rectangle `[x, y] .. [x + w, y + h]`.
    pub fn from_rect(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            points: [
                Point::new(x, y),
                Point::new(x + w, y),
                Point::new(x + w, y + h),
                Point::new(x, y + h),
            ],
        }
    }

    /// The full `w x h` frame.
    pub fn full_frame(w: f32, h: f32) -> Self {
        Self::from_rect(0.0, 0.0, w, h)
    }

    pub fn top_left(&self) -> Point {
        self.points[0]
    }

    /// Shoelace area of the quadrilateral.
    pub fn area(&self) -> f32 {
        let p = &self.points;
        let mut acc = 0.0f32;
        for i in 0..4 {
            let j = (i + 1) % 4;
            acc += p[i].x * p[j].y - p[j].x * p[i].y;
        }
        (acc / 2.0).abs()
    }

    /// Mean top/bottom edge length.
    pub fn mean_width(&self) -> f32 {
        let [tl, tr, br, bl] = self.points;
        (tl.distance(tr) + bl.distance(br)) / 2.0
    }

    /// Mean left/right edge length.
    pub fn mean_height(&self) -> f32 {
        let [tl, tr, br, bl] = self.points;
        (tl.distance(bl) + tr.distance(br)) / 2.0
    }

    /// Width-over-height aspect ratio; 0 for degenerate quads.
    pub fn aspect_ratio(&self) -> f32 {
        let h = self.mean_height();
        if h <= f32::EPSILON {
            return 0.0;
        }
        self.mean_width() / h
    }

    /// Axis-aligned bounding box `(x0, y0, x1, y1)`.
    pub fn bounding_box(&self) -> (f32, f32, f32, f32) {
        let xs = self.points.map(|p| p.x);
        let ys = self.points.map(|p| p.y);
        let min = |vals: [f32; 4]| vals.iter().copied().fold(f32::INFINITY, f32::min);
        let max = |vals: [f32; 4]| vals.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (min(xs), min(ys), max(xs), max(ys))
    }

    /// Clamp every corner into `[0, w] x [0, h]`.
    pub fn clamped(&self, w: f32, h: f32) -> Self {
        Self {
            points: self
                .points
                .map(|p| Point::new(p.x.clamp(0.0, w), p.y.clamp(0.0, h))),
        }
    }

    /// Largest per-corner displacement against `other`, normalized by
    /// the larger frame dimension.
    pub fn max_corner_shift(&self, other: &Quad, frame_w: f32, frame_h: f32) -> f32 {
        let norm = frame_w.max(frame_h).max(1.0);
        self.points
            .iter()
            .zip(other.points.iter())
            .map(|(a, b)| a.distance(*b) / norm)
            .fold(0.0, f32::max)
    }

    /// Validate the quad against a source frame of `frame_w x frame_h`.
    ///
    /// Every corner must be finite and inside the frame; the area must
    /// be at least [`MIN_ROI_AREA_RATIO`] of the frame area.
    pub fn validate_in_frame(&self, frame_w: f32, frame_h: f32) -> Result<(), CoreError> {
        for p in &self.points {
            if !p.x.is_finite() || !p.y.is_finite() {
                return Err(CoreError::Validation(
                    "roi includes a non-finite coordinate".into(),
                ));
            }
            if p.x < 0.0 || p.y < 0.0 || p.x > frame_w || p.y > frame_h {
                return Err(CoreError::Validation(format!(
                    "roi point ({:.1}, {:.1}) lies outside the {frame_w}x{frame_h} frame",
                    p.x, p.y
                )));
            }
        }

        let frame_area = frame_w * frame_h;
        if frame_area <= 0.0 {
            return Err(CoreError::Validation("source frame has no area".into()));
        }
        if self.area() < frame_area * MIN_ROI_AREA_RATIO {
            return Err(CoreError::Validation(format!(
                "roi is too small: {:.2}% of the frame (minimum {:.0}%)",
                self.area() / frame_area * 100.0,
                MIN_ROI_AREA_RATIO * 100.0
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Quad {
        Quad::from_rect(10.0, 20.0, 100.0, 50.0)
    }

    #[test]
    fn ordered_sorts_shuffled_corners() {
        let quad = Quad::ordered([
            Point::new(110.0, 70.0),
            Point::new(10.0, 20.0),
            Point::new(10.0, 70.0),
            Point::new(110.0, 20.0),
        ]);
        assert_eq!(quad, square());
    }

    #[test]
    fn area_of_axis_aligned_rect() {
        assert!((square().area() - 5000.0).abs() < 1e-3);
    }

    #[test]
    fn aspect_ratio_of_wide_strip() {
        let strip = Quad::from_rect(0.0, 0.0, 450.0, 100.0);
        assert!((strip.aspect_ratio() - 4.5).abs() < 1e-3);
    }

    #[test]
    fn bounding_box_covers_all_corners() {
        let (x0, y0, x1, y1) = square().bounding_box();
        assert_eq!((x0, y0, x1, y1), (10.0, 20.0, 110.0, 70.0));
    }

    #[test]
    fn validate_rejects_out_of_frame_points() {
        let quad = Quad::from_rect(-5.0, 0.0, 100.0, 100.0);
        assert!(quad.validate_in_frame(640.0, 480.0).is_err());
    }

    #[test]
    fn validate_rejects_tiny_roi() {
        // 0.5% of a 640x480 frame.
        let quad = Quad::from_rect(0.0, 0.0, 40.0, 38.0);
        let err = quad.validate_in_frame(640.0, 480.0).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn validate_accepts_large_roi() {
        let quad = Quad::from_rect(10.0, 10.0, 600.0, 400.0);
        assert!(quad.validate_in_frame(640.0, 480.0).is_ok());
    }

    #[test]
    fn max_corner_shift_is_normalized() {
        let a = square();
        let b = Quad::from_rect(10.0, 20.0, 100.0, 114.0);
        // Bottom corners moved 64 px on a 640-wide frame.
        let shift = a.max_corner_shift(&b, 640.0, 480.0);
        assert!((shift - 0.1).abs() < 1e-3);
    }

    #[test]
    fn serde_round_trips_point_arrays() {
        let quad: Quad = serde_json::from_str("[[0,0],[100,0],[100,50],[0,50]]").unwrap();
        assert_eq!(quad, Quad::from_rect(0.0, 0.0, 100.0, 50.0));
        let json = serde_json::to_string(&quad).unwrap();
        assert_eq!(json, "[[0.0,0.0],[100.0,0.0],[100.0,50.0],[0.0,50.0]]");
    }
}
