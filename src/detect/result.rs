use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

/// One observation from the external detector.
///
/// Immutable input unit. `timestamp_ms` is UTC milliseconds since the epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub camera_id: String,
    pub timestamp_ms: i64,
    pub class_name: String,
    /// Detector confidence (0.0-1.0).
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(
        camera_id: impl Into<String>,
        timestamp_ms: i64,
        class_name: impl Into<String>,
        confidence: f32,
        bbox: BBox,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            timestamp_ms,
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }
}

/// A detection tagged with the track identity the associator assigned.
///
/// This is the hand-off record between association and aggregation and is
/// what gets persisted in the detection history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedDetection {
    #[serde(flatten)]
    pub detection: Detection,
    pub track_id: Option<u64>,
}

impl TrackedDetection {
    pub fn new(detection: Detection, track_id: Option<u64>) -> Self {
        Self {
            detection,
            track_id,
        }
    }

    /// Anonymous observation (never associated with a track).
    pub fn anonymous(detection: Detection) -> Self {
        Self::new(detection, None)
    }
}
