//! Bounding-box geometry.
//!
//! Pure functions over axis-aligned boxes in pixel coordinates. A box that is
//! non-finite or inverted is *degenerate*: it has zero area and IoU 0 against
//! everything. Nothing in here panics on bad input.

use serde::{Deserialize, Serialize};

/// Axis-aligned box `(x1, y1, x2, y2)` with `x1 <= x2`, `y1 <= y2` when valid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    /// Fallback value for boxes that could not be parsed.
    pub const UNPARSEABLE: BBox = BBox {
        x1: 0.0,
        y1: 0.0,
        x2: 0.0,
        y2: 0.0,
    };

    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_array(coords: [f32; 4]) -> Self {
        Self::new(coords[0], coords[1], coords[2], coords[3])
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// All coordinates finite and corners ordered.
    pub fn is_valid(&self) -> bool {
        self.to_array().iter().all(|c| c.is_finite()) && self.x1 <= self.x2 && self.y1 <= self.y2
    }

    pub fn width(&self) -> f32 {
        if self.is_valid() {
            self.x2 - self.x1
        } else {
            0.0
        }
    }

    pub fn height(&self) -> f32 {
        if self.is_valid() {
            self.y2 - self.y1
        } else {
            0.0
        }
    }

    /// Area in pixels². Degenerate boxes have area 0.
    pub fn area(&self) -> f32 {
        let area = self.width() * self.height();
        if area.is_finite() {
            area
        } else {
            0.0
        }
    }

    /// Box center `(cx, cy)`. Finite for any finite box.
    pub fn center(&self) -> (f32, f32) {
        (midpoint(self.x1, self.x2), midpoint(self.y1, self.y2))
    }

    /// Bottom-center point `(cx, y2)`, where the object meets the ground.
    pub fn bottom_center(&self) -> (f32, f32) {
        (midpoint(self.x1, self.x2), self.y2)
    }
}

// Summed in f64 so two large f32 coordinates cannot overflow.
fn midpoint(a: f32, b: f32) -> f32 {
    ((f64::from(a) + f64::from(b)) / 2.0) as f32
}

/// Intersection-over-union of two boxes.
///
/// Returns 0 when the boxes do not overlap or either box has non-positive area.
/// Symmetric in its arguments.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let iw = a.x2.min(b.x2) - a.x1.max(b.x1);
    let ih = a.y2.min(b.y2) - a.y1.max(b.y1);
    if iw <= 0.0 || ih <= 0.0 {
        return 0.0;
    }

    let intersection = iw * ih;
    let union = area_a + area_b - intersection;
    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }
    (intersection / union).clamp(0.0, 1.0)
}

/// Euclidean distance between two points.
pub fn distance(a: (f32, f32), b: (f32, f32)) -> f64 {
    let dx = f64::from(b.0) - f64::from(a.0);
    let dy = f64::from(b.1) - f64::from(a.1);
    (dx * dx + dy * dy).sqrt()
}
