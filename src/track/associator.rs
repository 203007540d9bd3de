//! Online IoU association.
//!
//! One [`Associator`] per camera stream. Each call to [`Associator::update`]
//! takes one frame of detections and tags every confident detection with a
//! track id:
//!
//! 1. Detections with `confidence <= track_thresh` are dropped.
//! 2. Each remaining detection, in input order, is matched to the active track
//!    whose last box has the highest IoU strictly above `match_thresh`.
//!    No match starts a new track.
//! 3. Tracks not seen for `max_age` frames are evicted after the frame.
//!
//! Matching is greedy, not a global assignment: an earlier detection can take
//! a track a later detection overlaps better, and two detections in the same
//! frame may both land on one track (the later box wins). Downstream
//! thresholds are tuned against this behavior; swapping in an optimal
//! assignment changes track continuity.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::geometry::{iou, BBox};
use crate::{Detection, TrackedDetection};

const DEFAULT_TRACK_THRESH: f32 = 0.5;
const DEFAULT_MATCH_THRESH: f32 = 0.8;
const DEFAULT_MAX_AGE: u64 = 30;

#[derive(Clone, Debug, PartialEq)]
pub struct AssociatorConfig {
    /// Minimum confidence (exclusive) for a detection to be tracked.
    pub track_thresh: f32,
    /// Minimum IoU (exclusive) for a detection to continue a track.
    pub match_thresh: f32,
    /// Frames a track may go unseen before eviction.
    pub max_age: u64,
}

impl Default for AssociatorConfig {
    fn default() -> Self {
        Self {
            track_thresh: DEFAULT_TRACK_THRESH,
            match_thresh: DEFAULT_MATCH_THRESH,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

impl AssociatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.track_thresh) {
            return Err(anyhow!("track_thresh must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.match_thresh) {
            return Err(anyhow!("match_thresh must be within 0.0..=1.0"));
        }
        if self.max_age == 0 {
            return Err(anyhow!("max_age must be greater than zero"));
        }
        Ok(())
    }
}

/// Live association state for one object.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub track_id: u64,
    pub class_name: String,
    pub last_bbox: BBox,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
    /// Detections folded into this track.
    pub hits: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssociatorStats {
    pub frames: u64,
    pub detections_in: u64,
    pub below_threshold: u64,
    pub foreign_camera: u64,
    pub matched: u64,
    pub tracks_created: u64,
    pub tracks_evicted: u64,
}

/// Per-camera online associator.
pub struct Associator {
    camera_id: String,
    config: AssociatorConfig,
    /// Ordered by id so candidate scans and IoU ties are deterministic.
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    last_frame: Option<u64>,
    poisoned: Option<String>,
    stats: AssociatorStats,
}

impl Associator {
    pub fn new(camera_id: impl Into<String>, config: AssociatorConfig) -> Result<Self> {
        config.validate()?;
        let camera_id = camera_id.into();
        if camera_id.trim().is_empty() {
            return Err(anyhow!("associator camera_id must not be empty"));
        }
        log::info!(
            "associator ready for {} (track_thresh={}, match_thresh={}, max_age={})",
            camera_id,
            config.track_thresh,
            config.match_thresh,
            config.max_age
        );
        Ok(Self {
            camera_id,
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
            last_frame: None,
            poisoned: None,
            stats: AssociatorStats::default(),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn config(&self) -> &AssociatorConfig {
        &self.config
    }

    /// Process one frame and return the detections that received a track id.
    ///
    /// `frame_id` must not decrease between calls. A decreasing id is an
    /// ordering violation: the call fails and the associator refuses every
    /// later frame, since accepting it would corrupt track continuity.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame_id: u64,
    ) -> Result<Vec<TrackedDetection>> {
        if let Some(reason) = &self.poisoned {
            return Err(anyhow!(
                "associator for {} is halted after ordering violation: {}",
                self.camera_id,
                reason
            ));
        }
        if let Some(last) = self.last_frame {
            if frame_id < last {
                let reason = format!("frame_id {} arrived after frame_id {}", frame_id, last);
                log::error!("camera {}: {}", self.camera_id, reason);
                self.poisoned = Some(reason.clone());
                return Err(anyhow!(
                    "camera {}: out-of-order frame: {}",
                    self.camera_id,
                    reason
                ));
            }
        }
        self.last_frame = Some(frame_id);
        self.stats.frames += 1;

        let mut tracked = Vec::with_capacity(detections.len());
        for det in detections {
            self.stats.detections_in += 1;
            if det.camera_id != self.camera_id {
                self.stats.foreign_camera += 1;
                log::warn!(
                    "camera {}: dropping detection tagged for camera {}",
                    self.camera_id,
                    det.camera_id
                );
                continue;
            }
            // NaN confidence fails the comparison and is dropped here too.
            if !(det.confidence > self.config.track_thresh) {
                self.stats.below_threshold += 1;
                continue;
            }
            if !det.bbox.is_valid() {
                log::debug!(
                    "camera {} frame {}: degenerate bbox {:?} treated as zero-area",
                    self.camera_id,
                    frame_id,
                    det.bbox
                );
            }

            let track_id = match self.best_match(&det.bbox) {
                Some(track_id) => {
                    if let Some(track) = self.tracks.get_mut(&track_id) {
                        track.last_bbox = det.bbox;
                        track.last_seen_frame = frame_id;
                        track.class_name = det.class_name.clone();
                        track.hits += 1;
                    }
                    self.stats.matched += 1;
                    track_id
                }
                None => self.start_track(det, frame_id),
            };
            tracked.push(TrackedDetection::new(det.clone(), Some(track_id)));
        }

        self.evict_stale(frame_id);
        Ok(tracked)
    }

    fn best_match(&self, bbox: &BBox) -> Option<u64> {
        let mut best: Option<(u64, f32)> = None;
        for (id, track) in &self.tracks {
            let overlap = iou(bbox, &track.last_bbox);
            if overlap <= self.config.match_thresh {
                continue;
            }
            match best {
                Some((_, best_iou)) if overlap <= best_iou => {}
                _ => best = Some((*id, overlap)),
            }
        }
        best.map(|(id, _)| id)
    }

    fn start_track(&mut self, det: &Detection, frame_id: u64) -> u64 {
        let track_id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(
            track_id,
            Track {
                track_id,
                class_name: det.class_name.clone(),
                last_bbox: det.bbox,
                first_seen_frame: frame_id,
                last_seen_frame: frame_id,
                hits: 1,
            },
        );
        self.stats.tracks_created += 1;
        log::debug!(
            "camera {}: new track {} at frame {}",
            self.camera_id,
            track_id,
            frame_id
        );
        track_id
    }

    fn evict_stale(&mut self, frame_id: u64) {
        let max_age = self.config.max_age;
        let before = self.tracks.len();
        self.tracks
            .retain(|_, track| frame_id.saturating_sub(track.last_seen_frame) < max_age);
        let evicted = (before - self.tracks.len()) as u64;
        if evicted > 0 {
            self.stats.tracks_evicted += evicted;
            log::debug!(
                "camera {}: evicted {} stale track(s) at frame {}",
                self.camera_id,
                evicted,
                frame_id
            );
        }
    }

    /// Active tracks in id order.
    pub fn active_tracks(&self) -> Vec<&Track> {
        self.tracks.values().collect()
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    /// Id the next new track will receive.
    pub fn next_track_id(&self) -> u64 {
        self.next_id
    }

    /// Keep only the first observation of each track created at `frame_id`.
    ///
    /// Call with the output of [`Associator::update`] for that frame.
    pub fn first_sightings(
        &self,
        tracked: Vec<TrackedDetection>,
        frame_id: u64,
    ) -> Vec<TrackedDetection> {
        let mut kept = BTreeSet::new();
        tracked
            .into_iter()
            .filter(|t| {
                let Some(id) = t.track_id else {
                    return false;
                };
                let created_now = self
                    .tracks
                    .get(&id)
                    .map_or(false, |track| track.first_seen_frame == frame_id);
                created_now && kept.insert(id)
            })
            .collect()
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    pub fn is_halted(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn stats(&self) -> &AssociatorStats {
        &self.stats
    }
}

/// Independent associators keyed by camera, created on first frame.
///
/// An ordering violation halts only the offending camera's associator.
pub struct CameraAssociators {
    config: AssociatorConfig,
    by_camera: HashMap<String, Associator>,
}

impl CameraAssociators {
    pub fn new(config: AssociatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            by_camera: HashMap::new(),
        })
    }

    pub fn update(
        &mut self,
        camera_id: &str,
        detections: &[Detection],
        frame_id: u64,
    ) -> Result<Vec<TrackedDetection>> {
        if !self.by_camera.contains_key(camera_id) {
            let associator = Associator::new(camera_id, self.config.clone())?;
            self.by_camera.insert(camera_id.to_string(), associator);
        }
        let associator = self
            .by_camera
            .get_mut(camera_id)
            .ok_or_else(|| anyhow!("associator for {} missing", camera_id))?;
        associator.update(detections, frame_id)
    }

    pub fn get(&self, camera_id: &str) -> Option<&Associator> {
        self.by_camera.get(camera_id)
    }

    /// Drop a camera's associator so its stream can restart from scratch.
    pub fn reset(&mut self, camera_id: &str) -> bool {
        self.by_camera.remove(camera_id).is_some()
    }

    pub fn cameras(&self) -> Vec<String> {
        let mut cameras: Vec<String> = self.by_camera.keys().cloned().collect();
        cameras.sort();
        cameras
    }

    pub fn active_tracks_total(&self) -> usize {
        self.by_camera.values().map(Associator::active_count).sum()
    }
}
