use anyhow::{anyhow, Result};

use super::file::Frame;
use crate::geometry::BBox;
use crate::Detection;

const FRAME_INTERVAL_MS: i64 = 100;

/// Synthetic scene for `stub://` sources: one slow walker that lingers, one
/// fast walker that crosses the frame, and a low-confidence flicker.
pub(crate) struct SyntheticScene {
    camera_id: String,
    start_ms: i64,
    frame_count: u64,
}

impl SyntheticScene {
    pub(crate) fn new(camera_id: &str, start_ms: i64) -> Result<Self> {
        if camera_id.trim().is_empty() {
            return Err(anyhow!("stub:// source needs a camera id, e.g. stub://CAM_001"));
        }
        Ok(Self {
            camera_id: camera_id.to_string(),
            start_ms,
            frame_count: 0,
        })
    }

    pub(crate) fn next_frame(&mut self) -> Frame {
        self.frame_count += 1;
        let n = self.frame_count;
        let ts = self.start_ms + (n as i64) * FRAME_INTERVAL_MS;
        let t = n as f32;

        let mut detections = Vec::with_capacity(3);

        // Lingerer: drifts a couple of pixels per second.
        let x = 100.0 + (t * 0.2) % 40.0;
        detections.push(self.detection(ts, "person", 0.88, BBox::new(x, 200.0, x + 50.0, 340.0)));

        // Walker: crosses 640 px in ~16 s, then re-enters.
        let x = (t * 4.0) % 640.0;
        detections.push(self.detection(ts, "person", 0.92, BBox::new(x, 150.0, x + 40.0, 300.0)));

        if n % 7 == 0 {
            detections.push(self.detection(ts, "person", 0.3, BBox::new(500.0, 50.0, 520.0, 90.0)));
        }

        Frame {
            camera_id: self.camera_id.clone(),
            frame_id: n,
            detections,
        }
    }

    fn detection(&self, ts: i64, class_name: &str, confidence: f32, bbox: BBox) -> Detection {
        Detection::new(self.camera_id.clone(), ts, class_name, confidence, bbox)
    }
}
