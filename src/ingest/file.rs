//! Detection frame source.
//!
//! `FileSource` reads per-frame detection batches produced by the external
//! detector. Each line of the input is one JSON frame record:
//!
//! ```text
//! {"camera_id":"CAM_001","frame_id":12,"timestamp_ms":1700000000000,
//!  "detections":[{"class_name":"person","confidence":0.91,"bbox":[10,20,60,180]}]}
//! ```
//!
//! `path` may be a local file, `-` for stdin, or `stub://<camera_id>` for a
//! synthetic scene. Lines that fail to parse are logged, counted and skipped.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};

use super::synthetic::SyntheticScene;
use crate::detect::deserialize_bbox;
use crate::geometry::BBox;
use crate::{now_ms, Detection};

/// Configuration for a detection frame source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local path, `-` for stdin, or `stub://<camera_id>`.
    pub path: String,
    /// Stop after this many frames (synthetic sources run forever otherwise).
    pub max_frames: Option<u64>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: "-".to_string(),
            max_frames: None,
        }
    }
}

/// One frame's worth of detections for one camera.
#[derive(Clone, Debug)]
pub struct Frame {
    pub camera_id: String,
    pub frame_id: u64,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct FrameRecord {
    camera_id: String,
    frame_id: u64,
    /// Capture time; ingest time is used when absent.
    #[serde(default)]
    timestamp_ms: Option<i64>,
    #[serde(default)]
    detections: Vec<DetectionRecord>,
}

#[derive(Debug, Deserialize)]
struct DetectionRecord {
    #[serde(alias = "class", alias = "label")]
    class_name: String,
    #[serde(alias = "score")]
    confidence: f32,
    #[serde(default, deserialize_with = "deserialize_bbox")]
    bbox: BBox,
}

impl FrameRecord {
    fn into_frame(self, fallback_ts_ms: i64) -> Frame {
        let timestamp_ms = self.timestamp_ms.unwrap_or(fallback_ts_ms);
        let camera_id = self.camera_id;
        let detections = self
            .detections
            .into_iter()
            .map(|d| {
                Detection::new(
                    camera_id.clone(),
                    timestamp_ms,
                    d.class_name,
                    d.confidence,
                    d.bbox,
                )
            })
            .collect();
        Frame {
            camera_id,
            frame_id: self.frame_id,
            detections,
        }
    }
}

/// Parse one NDJSON frame line.
pub fn parse_frame_line(line: &str) -> Result<Frame> {
    parse_frame_record(line).map(|(frame, _)| frame)
}

/// Returns the frame and whether its timestamp was filled with ingest time.
fn parse_frame_record(line: &str) -> Result<(Frame, bool)> {
    let record: FrameRecord =
        serde_json::from_str(line).map_err(|e| anyhow!("parse error: {}", e))?;
    if record.camera_id.trim().is_empty() {
        return Err(anyhow!("frame record has empty camera_id"));
    }
    let filled = record.timestamp_ms.is_none();
    if filled {
        log::debug!(
            "camera {} frame {}: no timestamp_ms, using ingest time",
            record.camera_id,
            record.frame_id
        );
    }
    Ok((record.into_frame(now_ms()?), filled))
}

/// Detection frame source.
pub struct FileSource {
    backend: FileBackend,
    max_frames: Option<u64>,
    stats: FileStats,
}

enum FileBackend {
    Lines(Box<dyn BufRead + Send>),
    Synthetic(SyntheticScene),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        let path = config.path.trim();
        if path.is_empty() {
            return Err(anyhow!("frame source path must not be empty"));
        }
        let backend = if let Some(camera_id) = path.strip_prefix("stub://") {
            FileBackend::Synthetic(SyntheticScene::new(camera_id, now_ms()?)?)
        } else if path == "-" {
            FileBackend::Lines(Box::new(BufReader::new(std::io::stdin())))
        } else if path.contains("://") {
            return Err(anyhow!("frame source only supports local paths (no URL schemes)"));
        } else {
            let file = File::open(path)
                .map_err(|e| anyhow!("failed to open frame source {}: {}", path, e))?;
            FileBackend::Lines(Box::new(BufReader::new(file)))
        };
        log::info!("FileSource: reading frames from {}", path);
        Ok(Self {
            backend,
            max_frames: config.max_frames,
            stats: FileStats {
                path: path.to_string(),
                ..FileStats::default()
            },
        })
    }

    /// Next frame, or `None` once the source is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(max) = self.max_frames {
            if self.stats.frames_read >= max {
                return Ok(None);
            }
        }
        let frame = match &mut self.backend {
            FileBackend::Synthetic(scene) => Some(scene.next_frame()),
            FileBackend::Lines(reader) => next_line_frame(reader.as_mut(), &mut self.stats)?,
        };
        if frame.is_some() {
            self.stats.frames_read += 1;
        }
        Ok(frame)
    }

    pub fn stats(&self) -> FileStats {
        self.stats.clone()
    }
}

fn next_line_frame(reader: &mut dyn BufRead, stats: &mut FileStats) -> Result<Option<Frame>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| anyhow!("frame source read failed: {}", e))?;
        if n == 0 {
            return Ok(None);
        }
        stats.lines_read += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_frame_record(trimmed) {
            Ok((frame, filled)) => {
                if filled {
                    stats.timestamps_filled += 1;
                }
                return Ok(Some(frame));
            }
            Err(e) => {
                stats.lines_rejected += 1;
                log::warn!("skipping frame line {}: {}", stats.lines_read, e);
            }
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct FileStats {
    pub path: String,
    pub lines_read: u64,
    pub lines_rejected: u64,
    /// Frames that carried no `timestamp_ms` and got the ingest time.
    pub timestamps_filled: u64,
    pub frames_read: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_frame_with_both_bbox_shapes() {
        let frame = parse_frame_line(
            r#"{"camera_id":"CAM_001","frame_id":3,"timestamp_ms":1000,
                "detections":[
                  {"class_name":"person","confidence":0.9,"bbox":[0,0,10,10]},
                  {"class":"person","score":0.8,"bbox":{"x1":5,"y1":5,"x2":15,"y2":25}}
                ]}"#,
        )
        .unwrap();
        assert_eq!(frame.camera_id, "CAM_001");
        assert_eq!(frame.frame_id, 3);
        assert_eq!(frame.detections.len(), 2);
        assert_eq!(frame.detections[1].bbox, BBox::new(5.0, 5.0, 15.0, 25.0));
        assert!(frame.detections.iter().all(|d| d.timestamp_ms == 1000));
    }

    #[test]
    fn bad_bbox_does_not_reject_frame() {
        let frame = parse_frame_line(
            r#"{"camera_id":"CAM_001","frame_id":1,"timestamp_ms":0,
                "detections":[{"class_name":"person","confidence":0.9,"bbox":"junk"}]}"#,
        )
        .unwrap();
        assert_eq!(frame.detections[0].bbox, BBox::UNPARSEABLE);
    }

    #[test]
    fn file_source_skips_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"camera_id":"CAM_001","frame_id":1,"timestamp_ms":0}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"camera_id":"CAM_001","frame_id":2,"timestamp_ms":100}}"#).unwrap();
        writeln!(file, r#"{{"camera_id":"CAM_001","frame_id":3}}"#).unwrap();

        let mut source = FileSource::new(FileConfig {
            path: file.path().display().to_string(),
            max_frames: None,
        })
        .unwrap();
        let mut ids = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            ids.push(frame.frame_id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
        let stats = source.stats();
        assert_eq!(stats.lines_rejected, 1);
        assert_eq!(stats.timestamps_filled, 1);
        assert_eq!(stats.frames_read, 3);
    }

    #[test]
    fn rejects_url_paths() {
        assert!(FileSource::new(FileConfig {
            path: "http://example.com/frames".to_string(),
            max_frames: None,
        })
        .is_err());
    }

    #[test]
    fn synthetic_source_honours_frame_cap() {
        let mut source = FileSource::new(FileConfig {
            path: "stub://CAM_TEST".to_string(),
            max_frames: Some(5),
        })
        .unwrap();
        let mut last = 0;
        while let Some(frame) = source.next_frame().unwrap() {
            assert!(frame.frame_id > last);
            last = frame.frame_id;
        }
        assert_eq!(last, 5);
    }
}
