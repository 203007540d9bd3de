use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, Row};
use std::collections::{BTreeMap, BTreeSet};

use crate::track::{TrackState, TrackStateKey, TrackStatus};
use crate::{open_db_connection, TrackedDetection};

/// One identity-tagged detection as read back from history.
///
/// `bbox_json` is left raw: history may hold boxes written by other tools in
/// either list or named-corner form, and the aggregator parses it.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryRow {
    pub camera_id: String,
    pub track_id: u64,
    pub timestamp_ms: i64,
    pub class_name: String,
    pub confidence: f32,
    pub bbox_json: String,
}

/// Durable store for detection history and aggregated track state.
pub trait TrackStore {
    /// Persist associator output. Rows without a track id are kept as
    /// anonymous observations and never aggregated.
    fn append_detections(&mut self, detections: &[TrackedDetection]) -> Result<()>;

    /// Cameras with tracked detections at or after `since_ms`.
    fn detection_cameras_since(&mut self, since_ms: i64) -> Result<Vec<String>>;

    /// Cameras that currently have persisted track state.
    fn state_cameras(&mut self) -> Result<Vec<String>>;

    /// Tracked detections for one camera at or after `since_ms`, ordered by
    /// `(track_id, timestamp_ms, insertion order)`.
    fn detections_since(&mut self, camera_id: &str, since_ms: i64) -> Result<Vec<HistoryRow>>;

    /// Atomically evict the camera's states with `last_time < evict_before_ms`
    /// and replace the rows of every track in `states`. Returns the number of
    /// evicted rows. Either everything commits or nothing changes.
    fn commit_track_states(
        &mut self,
        camera_id: &str,
        states: &[TrackState],
        evict_before_ms: i64,
    ) -> Result<usize>;

    /// Persisted states, optionally for one camera, ordered by key.
    fn track_states(&mut self, camera_id: Option<&str>) -> Result<Vec<TrackState>>;

    /// Drop detection history older than `before_ms`. Returns rows removed.
    fn prune_detections(&mut self, before_ms: i64) -> Result<usize>;
}

pub struct SqliteTrackStore {
    conn: Connection,
}

impl SqliteTrackStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              class_name TEXT NOT NULL,
              confidence REAL NOT NULL,
              bbox TEXT NOT NULL,
              track_id INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_detections_camera_ts
              ON detections(camera_id, timestamp_ms);

            CREATE TABLE IF NOT EXISTS track_states (
              camera_id TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              zone_id INTEGER,
              class_name TEXT NOT NULL,
              enter_time_ms INTEGER NOT NULL,
              last_time_ms INTEGER NOT NULL,
              total_dwell_sec INTEGER NOT NULL,
              detection_count INTEGER NOT NULL,
              avg_speed REAL NOT NULL,
              avg_bbox_area REAL NOT NULL,
              status TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_track_states_key
              ON track_states(camera_id, track_id, IFNULL(zone_id, -1));
            CREATE INDEX IF NOT EXISTS idx_track_states_last
              ON track_states(last_time_ms);
            "#,
        )?;
        Ok(())
    }

    /// Insert a raw history row with an arbitrary bbox payload.
    ///
    /// For importing history written by other tools; normal ingest goes
    /// through [`TrackStore::append_detections`].
    pub fn insert_raw_detection(&mut self, row: &HistoryRow) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO detections(camera_id, timestamp_ms, class_name, confidence, bbox, track_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                row.camera_id,
                row.timestamp_ms,
                row.class_name,
                f64::from(row.confidence),
                row.bbox_json,
                to_sql_id(row.track_id)?
            ],
        )?;
        Ok(())
    }
}

fn to_sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| anyhow!("track_id {} exceeds i64 range", id))
}

fn from_sql_id(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| anyhow!("corrupt track_id {}", id))
}

fn bbox_to_json(detection: &TrackedDetection) -> Result<String> {
    Ok(serde_json::to_string(&detection.detection.bbox.to_array())?)
}

fn state_from_row(row: &Row<'_>) -> Result<TrackState> {
    let track_id: i64 = row.get(1)?;
    let detection_count: i64 = row.get(7)?;
    let status: String = row.get(10)?;
    Ok(TrackState {
        camera_id: row.get(0)?,
        track_id: from_sql_id(track_id)?,
        zone_id: row.get(2)?,
        class_name: row.get(3)?,
        enter_time_ms: row.get(4)?,
        last_time_ms: row.get(5)?,
        total_dwell_sec: row.get(6)?,
        detection_count: u64::try_from(detection_count)
            .map_err(|_| anyhow!("corrupt detection_count {}", detection_count))?,
        avg_speed: row.get(8)?,
        avg_bbox_area: row.get(9)?,
        status: TrackStatus::parse(&status)?,
    })
}

impl TrackStore for SqliteTrackStore {
    fn append_detections(&mut self, detections: &[TrackedDetection]) -> Result<()> {
        if detections.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO detections(camera_id, timestamp_ms, class_name, confidence, bbox, track_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for tracked in detections {
                let det = &tracked.detection;
                let track_id = tracked.track_id.map(to_sql_id).transpose()?;
                stmt.execute(params![
                    det.camera_id,
                    det.timestamp_ms,
                    det.class_name,
                    f64::from(det.confidence),
                    bbox_to_json(tracked)?,
                    track_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn detection_cameras_since(&mut self, since_ms: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT camera_id FROM detections
            WHERE timestamp_ms >= ?1 AND track_id IS NOT NULL
            ORDER BY camera_id
            "#,
        )?;
        let cameras = stmt
            .query_map(params![since_ms], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cameras)
    }

    fn state_cameras(&mut self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT camera_id FROM track_states ORDER BY camera_id")?;
        let cameras = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cameras)
    }

    fn detections_since(&mut self, camera_id: &str, since_ms: i64) -> Result<Vec<HistoryRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT camera_id, track_id, timestamp_ms, class_name, confidence, bbox
            FROM detections
            WHERE camera_id = ?1 AND timestamp_ms >= ?2 AND track_id IS NOT NULL
            ORDER BY track_id ASC, timestamp_ms ASC, id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![camera_id, since_ms])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let track_id: i64 = row.get(1)?;
            let confidence: f64 = row.get(4)?;
            out.push(HistoryRow {
                camera_id: row.get(0)?,
                track_id: from_sql_id(track_id)?,
                timestamp_ms: row.get(2)?,
                class_name: row.get(3)?,
                confidence: confidence as f32,
                bbox_json: row.get(5)?,
            });
        }
        Ok(out)
    }

    fn commit_track_states(
        &mut self,
        camera_id: &str,
        states: &[TrackState],
        evict_before_ms: i64,
    ) -> Result<usize> {
        for state in states {
            if state.camera_id != camera_id {
                return Err(anyhow!(
                    "state for camera {} committed under camera {}",
                    state.camera_id,
                    camera_id
                ));
            }
        }

        // Dropping the transaction without commit rolls everything back.
        let tx = self.conn.transaction()?;
        let evicted = tx.execute(
            "DELETE FROM track_states WHERE camera_id = ?1 AND last_time_ms < ?2",
            params![camera_id, evict_before_ms],
        )?;
        {
            let mut clear = tx
                .prepare("DELETE FROM track_states WHERE camera_id = ?1 AND track_id = ?2")?;
            let mut insert = tx.prepare(
                r#"
                INSERT INTO track_states(
                  camera_id, track_id, zone_id, class_name, enter_time_ms, last_time_ms,
                  total_dwell_sec, detection_count, avg_speed, avg_bbox_area, status
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;
            for state in states {
                let track_id = to_sql_id(state.track_id)?;
                let detection_count = i64::try_from(state.detection_count)
                    .map_err(|_| anyhow!("detection_count exceeds i64 range"))?;
                clear.execute(params![camera_id, track_id])?;
                insert.execute(params![
                    state.camera_id,
                    track_id,
                    state.zone_id,
                    state.class_name,
                    state.enter_time_ms,
                    state.last_time_ms,
                    state.total_dwell_sec,
                    detection_count,
                    state.avg_speed,
                    state.avg_bbox_area,
                    state.status.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(evicted)
    }

    fn track_states(&mut self, camera_id: Option<&str>) -> Result<Vec<TrackState>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT camera_id, track_id, zone_id, class_name, enter_time_ms, last_time_ms,
                   total_dwell_sec, detection_count, avg_speed, avg_bbox_area, status
            FROM track_states
            WHERE ?1 IS NULL OR camera_id = ?1
            ORDER BY camera_id ASC, track_id ASC, IFNULL(zone_id, -1) ASC
            "#,
        )?;
        let mut rows = stmt.query(params![camera_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(state_from_row(row)?);
        }
        Ok(out)
    }

    fn prune_detections(&mut self, before_ms: i64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM detections WHERE timestamp_ms < ?1",
            params![before_ms],
        )?;
        Ok(removed)
    }
}

#[derive(Clone, Debug)]
struct InMemoryDetectionEntry {
    seq: u64,
    camera_id: String,
    timestamp_ms: i64,
    class_name: String,
    confidence: f32,
    bbox_json: String,
    track_id: Option<u64>,
}

/// In-memory twin of [`SqliteTrackStore`] with the same ordering and
/// commit semantics.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTrackStore {
    detections: Vec<InMemoryDetectionEntry>,
    states: BTreeMap<TrackStateKey, TrackState>,
    next_seq: u64,
}

impl InMemoryTrackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`SqliteTrackStore::insert_raw_detection`].
    pub fn insert_raw_detection(&mut self, row: &HistoryRow) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.detections.push(InMemoryDetectionEntry {
            seq,
            camera_id: row.camera_id.clone(),
            timestamp_ms: row.timestamp_ms,
            class_name: row.class_name.clone(),
            confidence: row.confidence,
            bbox_json: row.bbox_json.clone(),
            track_id: Some(row.track_id),
        });
    }

    pub fn detection_count(&self) -> usize {
        self.detections.len()
    }
}

impl TrackStore for InMemoryTrackStore {
    fn append_detections(&mut self, detections: &[TrackedDetection]) -> Result<()> {
        let mut staged = Vec::with_capacity(detections.len());
        for tracked in detections {
            let det = &tracked.detection;
            if let Some(id) = tracked.track_id {
                to_sql_id(id)?;
            }
            staged.push(InMemoryDetectionEntry {
                seq: self.next_seq + staged.len() as u64,
                camera_id: det.camera_id.clone(),
                timestamp_ms: det.timestamp_ms,
                class_name: det.class_name.clone(),
                confidence: det.confidence,
                bbox_json: bbox_to_json(tracked)?,
                track_id: tracked.track_id,
            });
        }
        self.next_seq += staged.len() as u64;
        self.detections.extend(staged);
        Ok(())
    }

    fn detection_cameras_since(&mut self, since_ms: i64) -> Result<Vec<String>> {
        let cameras: BTreeSet<String> = self
            .detections
            .iter()
            .filter(|d| d.timestamp_ms >= since_ms && d.track_id.is_some())
            .map(|d| d.camera_id.clone())
            .collect();
        Ok(cameras.into_iter().collect())
    }

    fn state_cameras(&mut self) -> Result<Vec<String>> {
        let cameras: BTreeSet<String> = self.states.keys().map(|k| k.camera_id.clone()).collect();
        Ok(cameras.into_iter().collect())
    }

    fn detections_since(&mut self, camera_id: &str, since_ms: i64) -> Result<Vec<HistoryRow>> {
        let mut selected: Vec<(u64, &InMemoryDetectionEntry)> = self
            .detections
            .iter()
            .filter(|d| d.camera_id == camera_id && d.timestamp_ms >= since_ms)
            .filter_map(|d| d.track_id.map(|id| (id, d)))
            .collect();
        selected.sort_by_key(|(id, d)| (*id, d.timestamp_ms, d.seq));
        Ok(selected
            .into_iter()
            .map(|(track_id, d)| HistoryRow {
                camera_id: d.camera_id.clone(),
                track_id,
                timestamp_ms: d.timestamp_ms,
                class_name: d.class_name.clone(),
                confidence: d.confidence,
                bbox_json: d.bbox_json.clone(),
            })
            .collect())
    }

    fn commit_track_states(
        &mut self,
        camera_id: &str,
        states: &[TrackState],
        evict_before_ms: i64,
    ) -> Result<usize> {
        for state in states {
            if state.camera_id != camera_id {
                return Err(anyhow!(
                    "state for camera {} committed under camera {}",
                    state.camera_id,
                    camera_id
                ));
            }
            to_sql_id(state.track_id)?;
        }

        let before = self.states.len();
        self.states
            .retain(|key, state| key.camera_id != camera_id || state.last_time_ms >= evict_before_ms);
        let evicted = before - self.states.len();

        for state in states {
            self.states
                .retain(|key, _| !(key.camera_id == camera_id && key.track_id == state.track_id));
            self.states.insert(state.key(), state.clone());
        }
        Ok(evicted)
    }

    fn track_states(&mut self, camera_id: Option<&str>) -> Result<Vec<TrackState>> {
        // Sort NULL zones first, matching IFNULL(zone_id, -1) in SQL.
        let mut out: Vec<TrackState> = self
            .states
            .values()
            .filter(|s| camera_id.map_or(true, |cam| s.camera_id == cam))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (&a.camera_id, a.track_id, a.zone_id.unwrap_or(-1))
                .cmp(&(&b.camera_id, b.track_id, b.zone_id.unwrap_or(-1)))
        });
        Ok(out)
    }

    fn prune_detections(&mut self, before_ms: i64) -> Result<usize> {
        let before = self.detections.len();
        self.detections.retain(|d| d.timestamp_ms >= before_ms);
        Ok(before - self.detections.len())
    }
}
