//! Windowed track-state aggregation.
//!
//! Every cycle re-derives each track's [`TrackState`] from the raw,
//! identity-tagged detection history inside the window and commits the
//! result per camera in one transaction. Nothing is patched incrementally,
//! so re-running a cycle over unchanged history writes identical rows and a
//! failed cycle leaves the previous state in place.
//!
//! Tracks "exit" by eviction: once a state's `last_time` falls behind
//! `now - (window + eviction_grace)` its row is deleted on the next cycle.

use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use crate::detect::{parse_bbox_text, ClassFilter};
use crate::geometry::distance;
use crate::storage::{HistoryRow, TrackStore};
use crate::track::{TrackState, TrackStatus};

const DEFAULT_WINDOW_SECS: u64 = 60 * 60;
const DEFAULT_MIN_DETECTIONS: usize = 3;
const DEFAULT_LOITER_SECS: u64 = 120;
const DEFAULT_EVICTION_GRACE_SECS: u64 = 60 * 60;
const DEFAULT_SLOW_ZONE_SPEED: f64 = 5.0;
const DEFAULT_SLOW_ZONE_ID: i64 = 1;

/// Coarse zone assignment keyed off average speed.
///
/// Tracks slower than `max_speed` px/s are placed in `zone_id`; faster tracks
/// get no zone. This conflates "slow" with "in a zone" and is only a
/// heuristic; it does not test box positions against any polygon.
#[derive(Clone, Debug, PartialEq)]
pub struct SpeedZoneHeuristic {
    pub max_speed: f64,
    pub zone_id: i64,
}

impl Default for SpeedZoneHeuristic {
    fn default() -> Self {
        Self {
            max_speed: DEFAULT_SLOW_ZONE_SPEED,
            zone_id: DEFAULT_SLOW_ZONE_ID,
        }
    }
}

impl SpeedZoneHeuristic {
    pub fn zone_for(&self, avg_speed: f64) -> Option<i64> {
        if avg_speed < self.max_speed {
            Some(self.zone_id)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Rolling window of history considered each cycle.
    pub window: Duration,
    /// Groups with fewer detections are too sparse to trust.
    pub min_detections: usize,
    /// Dwell strictly above this is loitering.
    pub loiter_threshold: Duration,
    /// Extra age beyond `window` before a state is evicted.
    pub eviction_grace: Duration,
    pub class_filter: ClassFilter,
    pub zones: SpeedZoneHeuristic,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            min_detections: DEFAULT_MIN_DETECTIONS,
            loiter_threshold: Duration::from_secs(DEFAULT_LOITER_SECS),
            eviction_grace: Duration::from_secs(DEFAULT_EVICTION_GRACE_SECS),
            class_filter: ClassFilter::default(),
            zones: SpeedZoneHeuristic::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(anyhow!("aggregation window must be greater than zero"));
        }
        if self.min_detections == 0 {
            return Err(anyhow!("min_detections must be at least 1"));
        }
        if !self.zones.max_speed.is_finite() {
            return Err(anyhow!("slow zone speed must be finite"));
        }
        Ok(())
    }

    fn window_ms(&self) -> i64 {
        duration_ms(self.window)
    }

    fn retention_ms(&self) -> i64 {
        duration_ms(self.window).saturating_add(duration_ms(self.eviction_grace))
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Result of recomputing states from one camera's window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recomputed {
    pub states: Vec<TrackState>,
    pub detections_used: usize,
    pub filtered_out: usize,
    pub groups: usize,
    pub sparse_groups: usize,
    pub failed_groups: usize,
    pub malformed_bboxes: usize,
}

/// Outcome of one camera inside a cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CameraCycle {
    pub camera_id: String,
    pub detections_read: usize,
    pub groups: usize,
    pub sparse_groups: usize,
    pub failed_groups: usize,
    pub malformed_bboxes: usize,
    pub states_written: usize,
    pub states_evicted: usize,
    pub active: usize,
    pub loitering: usize,
}

/// Summary of one aggregation cycle across cameras.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub now_ms: i64,
    pub cameras: Vec<CameraCycle>,
    /// Cameras whose previous cycle was still running.
    pub cameras_skipped: Vec<String>,
    /// Cameras whose read or commit failed; their prior state is untouched.
    pub cameras_failed: Vec<(String, String)>,
}

impl CycleReport {
    /// True when every camera either committed or was skipped.
    pub fn is_success(&self) -> bool {
        self.cameras_failed.is_empty()
    }

    pub fn states_written(&self) -> usize {
        self.cameras.iter().map(|c| c.states_written).sum()
    }

    pub fn states_evicted(&self) -> usize {
        self.cameras.iter().map(|c| c.states_evicted).sum()
    }

    pub fn active(&self) -> usize {
        self.cameras.iter().map(|c| c.active).sum()
    }

    pub fn loitering(&self) -> usize {
        self.cameras.iter().map(|c| c.loitering).sum()
    }

    pub fn detections_read(&self) -> usize {
        self.cameras.iter().map(|c| c.detections_read).sum()
    }

    pub fn failed_groups(&self) -> usize {
        self.cameras.iter().map(|c| c.failed_groups).sum()
    }

    pub fn malformed_bboxes(&self) -> usize {
        self.cameras.iter().map(|c| c.malformed_bboxes).sum()
    }

    pub fn camera(&self, camera_id: &str) -> Option<&CameraCycle> {
        self.cameras.iter().find(|c| c.camera_id == camera_id)
    }
}

/// Per-camera single-flight locks.
///
/// Cycles for different cameras may overlap; two cycles for the same camera
/// may not.
#[derive(Debug, Default)]
pub struct CameraLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CameraLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, camera_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("camera lock registry poisoned"))?;
        Ok(locks
            .entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

enum CameraRun {
    Done(CameraCycle),
    Skipped,
}

/// Periodic track-state aggregator.
///
/// Shareable across threads; each thread brings its own store handle.
pub struct Aggregator {
    config: AggregatorConfig,
    locks: CameraLocks,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            locks: CameraLocks::new(),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Run one cycle over every camera with in-window history or persisted
    /// state.
    ///
    /// Fails outright only when the camera list cannot be read. Per-camera
    /// failures are reported in [`CycleReport::cameras_failed`] and leave that
    /// camera's persisted state unchanged.
    pub fn run_cycle(&self, store: &mut dyn TrackStore, now_ms: i64) -> Result<CycleReport> {
        let window_start = now_ms.saturating_sub(self.config.window_ms());
        let mut cameras: BTreeSet<String> =
            store.detection_cameras_since(window_start)?.into_iter().collect();
        cameras.extend(store.state_cameras()?);

        let mut report = CycleReport {
            now_ms,
            ..CycleReport::default()
        };
        for camera_id in cameras {
            match self.run_camera(store, &camera_id, now_ms) {
                Ok(CameraRun::Done(cycle)) => report.cameras.push(cycle),
                Ok(CameraRun::Skipped) => {
                    log::warn!("camera {}: previous cycle still running, skipped", camera_id);
                    report.cameras_skipped.push(camera_id);
                }
                Err(e) => {
                    log::error!("camera {}: cycle failed, prior state kept: {}", camera_id, e);
                    report.cameras_failed.push((camera_id, e.to_string()));
                }
            }
        }

        let window_secs = self.config.window.as_secs().max(1);
        log::info!(
            "cycle: {} tracks ({} active, {} loitering) written, {} evicted, {} detections ({:.2}/sec), {} cameras, {} skipped, {} failed",
            report.states_written(),
            report.active(),
            report.loitering(),
            report.states_evicted(),
            report.detections_read(),
            report.detections_read() as f64 / window_secs as f64,
            report.cameras.len(),
            report.cameras_skipped.len(),
            report.cameras_failed.len()
        );
        if report.failed_groups() > 0 || report.malformed_bboxes() > 0 {
            log::warn!(
                "cycle: {} track group(s) failed, {} malformed bbox(es) zeroed",
                report.failed_groups(),
                report.malformed_bboxes()
            );
        }
        Ok(report)
    }

    /// Run one cycle for a single camera.
    ///
    /// Returns `None` when another cycle for the camera is in progress.
    pub fn run_camera_cycle(
        &self,
        store: &mut dyn TrackStore,
        camera_id: &str,
        now_ms: i64,
    ) -> Result<Option<CameraCycle>> {
        match self.run_camera(store, camera_id, now_ms)? {
            CameraRun::Done(cycle) => Ok(Some(cycle)),
            CameraRun::Skipped => Ok(None),
        }
    }

    fn run_camera(
        &self,
        store: &mut dyn TrackStore,
        camera_id: &str,
        now_ms: i64,
    ) -> Result<CameraRun> {
        let lock = self.locks.lock_for(camera_id)?;
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(CameraRun::Skipped),
            // A panicked cycle wrote nothing past its transaction; the lock
            // itself guards no data.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let window_start = now_ms.saturating_sub(self.config.window_ms());
        let evict_before = now_ms.saturating_sub(self.config.retention_ms());

        let rows = store.detections_since(camera_id, window_start)?;
        let recomputed = self.recompute(&rows);
        let evicted = store.commit_track_states(camera_id, &recomputed.states, evict_before)?;

        let loitering = recomputed
            .states
            .iter()
            .filter(|s| s.status == TrackStatus::Loitering)
            .count();
        let cycle = CameraCycle {
            camera_id: camera_id.to_string(),
            detections_read: rows.len(),
            groups: recomputed.groups,
            sparse_groups: recomputed.sparse_groups,
            failed_groups: recomputed.failed_groups,
            malformed_bboxes: recomputed.malformed_bboxes,
            states_written: recomputed.states.len(),
            states_evicted: evicted,
            active: recomputed.states.len() - loitering,
            loitering,
        };
        log::debug!(
            "camera {}: {} detections, {} groups ({} sparse, {} failed), {} written, {} evicted",
            camera_id,
            cycle.detections_read,
            cycle.groups,
            cycle.sparse_groups,
            cycle.failed_groups,
            cycle.states_written,
            cycle.states_evicted
        );
        Ok(CameraRun::Done(cycle))
    }

    /// Recompute track states from history rows. Pure; no I/O.
    ///
    /// Rows may span cameras; they are grouped by `(camera_id, track_id)`.
    /// Output is ordered by `(camera_id, track_id)`.
    pub fn recompute(&self, rows: &[HistoryRow]) -> Recomputed {
        let mut out = Recomputed::default();
        let mut groups: HashMap<(&str, u64), Vec<&HistoryRow>> = HashMap::new();
        for row in rows {
            if !self.config.class_filter.matches(&row.class_name) {
                out.filtered_out += 1;
                continue;
            }
            out.detections_used += 1;
            groups
                .entry((row.camera_id.as_str(), row.track_id))
                .or_default()
                .push(row);
        }

        let mut keys: Vec<(&str, u64)> = groups.keys().copied().collect();
        keys.sort();
        out.groups = keys.len();

        for key in keys {
            let Some(mut group) = groups.remove(&key) else {
                continue;
            };
            if group.len() < self.config.min_detections {
                out.sparse_groups += 1;
                continue;
            }
            // Stable: equal timestamps keep history order.
            group.sort_by_key(|row| row.timestamp_ms);
            match self.compute_state(&group, &mut out.malformed_bboxes) {
                Ok(state) => out.states.push(state),
                Err(e) => {
                    out.failed_groups += 1;
                    log::warn!("camera {} track {}: group skipped: {}", key.0, key.1, e);
                }
            }
        }
        out
    }

    /// Malformed boxes count as the origin and are tallied in `malformed`;
    /// only a state that fails validation fails the group.
    fn compute_state(&self, group: &[&HistoryRow], malformed: &mut usize) -> Result<TrackState> {
        let first = group.first().ok_or_else(|| anyhow!("empty track group"))?;
        let last = group.last().ok_or_else(|| anyhow!("empty track group"))?;

        let mut centers = Vec::with_capacity(group.len());
        let mut area_sum = 0.0f64;
        for row in group {
            let (bbox, parsed) = parse_bbox_text(&row.bbox_json);
            if !parsed {
                *malformed += 1;
            }
            centers.push(bbox.center());
            area_sum += f64::from(bbox.area());
        }

        let mut speeds = Vec::with_capacity(group.len().saturating_sub(1));
        for (i, pair) in group.windows(2).enumerate() {
            let elapsed_ms = pair[1].timestamp_ms.saturating_sub(pair[0].timestamp_ms);
            let speed = if elapsed_ms > 0 {
                distance(centers[i], centers[i + 1]) / (elapsed_ms as f64 / 1000.0)
            } else {
                0.0
            };
            speeds.push(speed);
        }
        let avg_speed = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f64>() / speeds.len() as f64
        };

        let enter_time_ms = first.timestamp_ms;
        let last_time_ms = last.timestamp_ms;
        let total_dwell_sec = last_time_ms.saturating_sub(enter_time_ms) / 1000;
        let loiter_secs =
            i64::try_from(self.config.loiter_threshold.as_secs()).unwrap_or(i64::MAX);
        let status = if total_dwell_sec > loiter_secs {
            TrackStatus::Loitering
        } else {
            TrackStatus::Active
        };

        let state = TrackState {
            camera_id: first.camera_id.clone(),
            track_id: first.track_id,
            zone_id: self.config.zones.zone_for(avg_speed),
            class_name: first.class_name.clone(),
            enter_time_ms,
            last_time_ms,
            total_dwell_sec,
            detection_count: group.len() as u64,
            avg_speed,
            avg_bbox_area: area_sum / group.len() as f64,
            status,
        };
        state.validate()?;
        Ok(state)
    }
}
