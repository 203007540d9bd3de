use anyhow::{anyhow, Result};
use std::time::Duration;

use tempfile::TempDir;

use track_kernel::storage::HistoryRow;
use track_kernel::{
    shared_memory_uri, Aggregator, AggregatorConfig, BBox, CameraAssociators, Detection,
    SqliteTrackStore, TrackState, TrackStatus, TrackStore, TrackedDetection,
};

const NOW: i64 = 1_700_000_000_000;
const SEC: i64 = 1000;
const HOUR: i64 = 3600 * SEC;

fn raw(camera: &str, track_id: u64, ts: i64, bbox: &str) -> HistoryRow {
    HistoryRow {
        camera_id: camera.to_string(),
        track_id,
        timestamp_ms: ts,
        class_name: "person".to_string(),
        confidence: 0.9,
        bbox_json: bbox.to_string(),
    }
}

fn store_with(rows: &[HistoryRow]) -> SqliteTrackStore {
    let mut store = SqliteTrackStore::open(&shared_memory_uri()).unwrap();
    for row in rows {
        store.insert_raw_detection(row).unwrap();
    }
    store
}

/// Delegates to an inner store but fails commits for one camera.
struct FailingCommitStore {
    inner: SqliteTrackStore,
    fail_camera: String,
}

impl TrackStore for FailingCommitStore {
    fn append_detections(&mut self, detections: &[TrackedDetection]) -> Result<()> {
        self.inner.append_detections(detections)
    }

    fn detection_cameras_since(&mut self, since_ms: i64) -> Result<Vec<String>> {
        self.inner.detection_cameras_since(since_ms)
    }

    fn state_cameras(&mut self) -> Result<Vec<String>> {
        self.inner.state_cameras()
    }

    fn detections_since(&mut self, camera_id: &str, since_ms: i64) -> Result<Vec<HistoryRow>> {
        self.inner.detections_since(camera_id, since_ms)
    }

    fn commit_track_states(
        &mut self,
        camera_id: &str,
        states: &[TrackState],
        evict_before_ms: i64,
    ) -> Result<usize> {
        if camera_id == self.fail_camera {
            return Err(anyhow!("disk full"));
        }
        self.inner
            .commit_track_states(camera_id, states, evict_before_ms)
    }

    fn track_states(&mut self, camera_id: Option<&str>) -> Result<Vec<TrackState>> {
        self.inner.track_states(camera_id)
    }

    fn prune_detections(&mut self, before_ms: i64) -> Result<usize> {
        self.inner.prune_detections(before_ms)
    }
}

#[test]
fn loitering_track_seven() {
    let mut store = store_with(&[
        raw("CAM_001", 7, NOW - 200 * SEC, "[100,100,150,250]"),
        raw("CAM_001", 7, NOW - 135 * SEC, "[101,100,151,250]"),
        raw("CAM_001", 7, NOW - 70 * SEC, "[102,100,152,250]"),
    ]);
    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
    let report = aggregator.run_cycle(&mut store, NOW).unwrap();
    assert!(report.is_success());
    assert_eq!(report.loitering(), 1);

    let states = store.track_states(Some("CAM_001")).unwrap();
    assert_eq!(states.len(), 1);
    let s = &states[0];
    assert_eq!(s.track_id, 7);
    assert_eq!(s.total_dwell_sec, 130);
    assert_eq!(s.detection_count, 3);
    assert_eq!(s.status, TrackStatus::Loitering);
    assert_eq!(s.zone_id, Some(1));
    assert!((s.avg_bbox_area - 7500.0).abs() < 1e-6);
}

#[test]
fn cycle_is_idempotent() {
    let mut store = store_with(&[
        raw("CAM_001", 1, NOW - 50 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 1, NOW - 40 * SEC, "[100,0,110,10]"),
        raw("CAM_001", 1, NOW - 30 * SEC, "[200,0,210,10]"),
        raw("CAM_002", 3, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_002", 3, NOW - 10 * SEC, "[0,0,10,10]"),
        raw("CAM_002", 3, NOW - 5 * SEC, "[0,0,10,10]"),
    ]);
    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();

    let first = aggregator.run_cycle(&mut store, NOW).unwrap();
    let after_first = store.track_states(None).unwrap();
    let second = aggregator.run_cycle(&mut store, NOW).unwrap();
    let after_second = store.track_states(None).unwrap();

    assert_eq!(first.states_written(), 2);
    assert_eq!(second.states_written(), 2);
    assert_eq!(second.states_evicted(), 0);
    assert_eq!(after_first, after_second);

    let fast = after_first.iter().find(|s| s.camera_id == "CAM_001").unwrap();
    assert!((fast.avg_speed - 10.0).abs() < 1e-9);
    assert_eq!(fast.zone_id, None);
}

#[test]
fn stale_camera_tracks_are_evicted() {
    let mut store = store_with(&[
        raw("CAM_001", 1, NOW - 30 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 1, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 1, NOW - 10 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 2, NOW - 30 * SEC, "[50,50,60,60]"),
        raw("CAM_001", 2, NOW - 20 * SEC, "[50,50,60,60]"),
        raw("CAM_001", 2, NOW - 10 * SEC, "[50,50,60,60]"),
    ]);
    let aggregator = Aggregator::new(AggregatorConfig {
        window: Duration::from_secs(3600),
        eviction_grace: Duration::from_secs(0),
        ..AggregatorConfig::default()
    })
    .unwrap();

    aggregator.run_cycle(&mut store, NOW).unwrap();
    assert_eq!(store.track_states(Some("CAM_001")).unwrap().len(), 2);

    // Two hours on, both tracks were last seen 2 h ago against a 1 h window.
    let later = aggregator.run_cycle(&mut store, NOW + 2 * HOUR).unwrap();
    assert_eq!(later.states_evicted(), 2);
    assert_eq!(later.states_written(), 0);
    assert!(store.track_states(Some("CAM_001")).unwrap().is_empty());
}

#[test]
fn default_grace_keeps_states_one_extra_window() {
    let mut store = store_with(&[
        raw("CAM_001", 1, NOW - 30 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 1, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 1, NOW - 10 * SEC, "[0,0,10,10]"),
    ]);
    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
    aggregator.run_cycle(&mut store, NOW).unwrap();

    aggregator.run_cycle(&mut store, NOW + HOUR + 30 * SEC).unwrap();
    assert_eq!(store.track_states(None).unwrap().len(), 1);

    aggregator.run_cycle(&mut store, NOW + 2 * HOUR).unwrap();
    assert!(store.track_states(None).unwrap().is_empty());
}

#[test]
fn failed_camera_keeps_prior_state_and_others_proceed() {
    let inner = store_with(&[
        raw("CAM_BAD", 1, NOW - 30 * SEC, "[0,0,10,10]"),
        raw("CAM_BAD", 1, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_BAD", 1, NOW - 10 * SEC, "[0,0,10,10]"),
        raw("CAM_OK", 4, NOW - 30 * SEC, "[0,0,10,10]"),
        raw("CAM_OK", 4, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_OK", 4, NOW - 10 * SEC, "[0,0,10,10]"),
    ]);
    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();

    let mut store = FailingCommitStore {
        inner,
        fail_camera: "none".to_string(),
    };
    aggregator.run_cycle(&mut store, NOW).unwrap();
    let before = store.track_states(Some("CAM_BAD")).unwrap();
    assert_eq!(before.len(), 1);

    // New history would change CAM_BAD's dwell, but its commit fails.
    store
        .inner
        .insert_raw_detection(&raw("CAM_BAD", 1, NOW + 60 * SEC, "[0,0,10,10]"))
        .unwrap();
    store.fail_camera = "CAM_BAD".to_string();
    let report = aggregator.run_cycle(&mut store, NOW + 90 * SEC).unwrap();

    assert!(!report.is_success());
    assert_eq!(report.cameras_failed.len(), 1);
    assert_eq!(report.cameras_failed[0].0, "CAM_BAD");
    assert!(report.camera("CAM_OK").is_some());
    assert_eq!(store.track_states(Some("CAM_BAD")).unwrap(), before);
    assert_eq!(store.track_states(Some("CAM_OK")).unwrap().len(), 1);
}

#[test]
fn mixed_bbox_encodings_are_tolerated() {
    let mut store = store_with(&[
        raw("CAM_001", 9, NOW - 40 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 9, NOW - 30 * SEC, r#"{"x1":0,"y1":0,"x2":20,"y2":10}"#),
        raw("CAM_001", 9, NOW - 20 * SEC, r#""[0,0,10,30]""#),
        raw("CAM_001", 9, NOW - 10 * SEC, "not a box"),
    ]);
    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
    let report = aggregator.run_cycle(&mut store, NOW).unwrap();

    assert_eq!(report.malformed_bboxes(), 1);
    assert_eq!(report.failed_groups(), 0);
    let states = store.track_states(None).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].detection_count, 4);
    assert!((states[0].avg_bbox_area - 150.0).abs() < 1e-6);
}

#[test]
fn class_filter_and_sparse_groups() {
    let mut rows = vec![
        raw("CAM_001", 1, NOW - 30 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 1, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 2, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 2, NOW - 10 * SEC, "[0,0,10,10]"),
        raw("CAM_001", 2, NOW - 5 * SEC, "[0,0,10,10]"),
    ];
    // Track 1 reaches three rows only by counting a car.
    let mut car = raw("CAM_001", 1, NOW - 10 * SEC, "[0,0,10,10]");
    car.class_name = "car".to_string();
    rows.push(car);

    let mut store = store_with(&rows);
    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
    let report = aggregator.run_cycle(&mut store, NOW).unwrap();

    let cam = report.camera("CAM_001").unwrap();
    assert_eq!(cam.sparse_groups, 1);
    let ids: Vec<u64> = store
        .track_states(None)
        .unwrap()
        .iter()
        .map(|s| s.track_id)
        .collect();
    assert_eq!(ids, vec![2]);
}

#[test]
fn associator_output_feeds_aggregator_through_disk_store() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("tracks.db").display().to_string();
    let mut store = SqliteTrackStore::open(&db_path).unwrap();
    let mut associators = CameraAssociators::new(Default::default()).unwrap();

    // One slow walker over 150 s at 1 frame/s, plus a below-threshold flicker.
    for frame_id in 0..150u64 {
        let ts = NOW - 150 * SEC + frame_id as i64 * SEC;
        let x = frame_id as f32 * 0.5;
        let detections = vec![
            Detection::new("CAM_001", ts, "person", 0.9, BBox::new(x, 0.0, x + 40.0, 100.0)),
            Detection::new("CAM_001", ts, "person", 0.2, BBox::new(300.0, 0.0, 310.0, 10.0)),
        ];
        let tracked = associators
            .update("CAM_001", &detections, frame_id)
            .unwrap();
        store.append_detections(&tracked).unwrap();
    }

    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
    let report = aggregator.run_cycle(&mut store, NOW).unwrap();
    assert!(report.is_success());
    drop(store);

    let mut reopened = SqliteTrackStore::open(&db_path).unwrap();
    let states = reopened.track_states(Some("CAM_001")).unwrap();
    assert_eq!(states.len(), 1);
    let s = &states[0];
    assert_eq!(s.track_id, 1);
    assert_eq!(s.detection_count, 150);
    assert_eq!(s.total_dwell_sec, 149);
    assert_eq!(s.status, TrackStatus::Loitering);
    assert!((s.avg_speed - 0.5).abs() < 1e-3);
    assert_eq!(s.zone_id, Some(1));
}

#[test]
fn prune_drops_history_past_retention() {
    let mut store = store_with(&[
        raw("CAM_001", 1, NOW - 30 * HOUR, "[0,0,10,10]"),
        raw("CAM_001", 1, NOW - 10 * SEC, "[0,0,10,10]"),
    ]);
    assert_eq!(store.prune_detections(NOW - 24 * HOUR).unwrap(), 1);
    assert_eq!(store.detections_since("CAM_001", 0).unwrap().len(), 1);
}

#[test]
fn single_camera_cycle_touches_only_that_camera() {
    let mut store = store_with(&[
        raw("CAM_A", 1, NOW - 30 * SEC, "[0,0,10,10]"),
        raw("CAM_A", 1, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_A", 1, NOW - 10 * SEC, "[0,0,10,10]"),
        raw("CAM_B", 1, NOW - 30 * SEC, "[0,0,10,10]"),
        raw("CAM_B", 1, NOW - 20 * SEC, "[0,0,10,10]"),
        raw("CAM_B", 1, NOW - 10 * SEC, "[0,0,10,10]"),
    ]);
    let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
    let cycle = aggregator
        .run_camera_cycle(&mut store, "CAM_A", NOW)
        .unwrap()
        .expect("not contended");
    assert_eq!(cycle.states_written, 1);
    assert_eq!(cycle.active, 1);
    assert_eq!(store.state_cameras().unwrap(), vec!["CAM_A".to_string()]);
}
