//! Bounding-box wire parsing.
//!
//! Boxes arrive from upstream writers in whichever shape they were stored:
//! - ordered list: `[x1, y1, x2, y2]`
//! - named corners: `{"x1": .., "y1": .., "x2": .., "y2": ..}`
//! - either of the above serialized into a JSON string
//!
//! Anything else is unparseable and maps to [`BBox::UNPARSEABLE`].

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::geometry::BBox;

/// Parse a box, returning `None` when the value has no usable box shape.
///
/// Lists may carry extra trailing elements; only the first four are read.
/// Named-corner objects default missing corners to 0.
pub fn try_parse_bbox(value: &Value) -> Option<BBox> {
    match value {
        Value::String(raw) => {
            let inner: Value = serde_json::from_str(raw.trim()).ok()?;
            if inner.is_string() {
                return None;
            }
            try_parse_bbox(&inner)
        }
        Value::Array(items) if items.len() >= 4 => {
            let mut coords = [0.0f32; 4];
            for (slot, item) in coords.iter_mut().zip(items.iter()) {
                *slot = coordinate(item)?;
            }
            Some(BBox::from_array(coords))
        }
        Value::Object(map) => {
            let mut coords = [0.0f32; 4];
            for (slot, key) in coords.iter_mut().zip(["x1", "y1", "x2", "y2"]) {
                if let Some(item) = map.get(key) {
                    *slot = coordinate(item)?;
                }
            }
            Some(BBox::from_array(coords))
        }
        _ => None,
    }
}

/// Parse a box, falling back to `(0, 0, 0, 0)` on unparseable input.
pub fn parse_bbox(value: &Value) -> BBox {
    match try_parse_bbox(value) {
        Some(bbox) => bbox,
        None => {
            log::debug!("bbox parse failed, using zero box: {}", value);
            BBox::UNPARSEABLE
        }
    }
}

/// Parse a box stored as JSON text (the detection history column).
///
/// Returns the box and whether it parsed cleanly.
pub fn parse_bbox_text(raw: &str) -> (BBox, bool) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("bbox column is not JSON ({}): {}", e, raw);
            return (BBox::UNPARSEABLE, false);
        }
    };
    match try_parse_bbox(&value) {
        Some(bbox) => (bbox, true),
        None => {
            log::debug!("bbox column has no box shape: {}", raw);
            (BBox::UNPARSEABLE, false)
        }
    }
}

/// Serde adapter for input records whose `bbox` field may take either shape.
pub fn deserialize_bbox<'de, D>(deserializer: D) -> Result<BBox, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_bbox(&value))
}

fn coordinate(item: &Value) -> Option<f32> {
    let v = match item {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let v = v as f32;
    v.is_finite().then_some(v)
}
