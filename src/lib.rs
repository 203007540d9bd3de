//! Track Kernel
//!
//! Turns per-frame object detections from a camera feed into stable track
//! identities, and periodically re-derives per-track behavioral state (dwell
//! time, movement speed, loitering) over a rolling window.
//!
//! # Architecture
//!
//! ```text
//! detector ──frames──▶ Associator (per camera) ──tracked detections──▶ store
//!                                                                       │
//!                    alerting ◀──TrackState── Aggregator (periodic) ◀───┘
//! ```
//!
//! The associator and the aggregator never share memory; the detection
//! history in the store is the only hand-off between them, so they run on
//! independent cadences.
//!
//! # Module Structure
//!
//! - `geometry`: boxes, IoU, center points
//! - `detect`: detection records, bbox wire parsing, class filters
//! - `ingest`: detection frame sources (NDJSON, synthetic)
//! - `track`: associator, aggregator, `TrackState`
//! - `storage`: `TrackStore` (SQLite and in-memory)
//! - `config`: layered file + environment configuration

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod geometry;
pub mod ingest;
pub mod storage;
pub mod track;

pub use detect::{parse_bbox, ClassFilter, Detection, TrackedDetection};
pub use geometry::{iou, BBox};
pub use ingest::{FileConfig, FileSource, Frame};
pub use storage::{HistoryRow, InMemoryTrackStore, SqliteTrackStore, TrackStore};
pub use track::{
    Aggregator, AggregatorConfig, Associator, AssociatorConfig, CameraAssociators, CycleReport,
    TrackState, TrackStatus,
};

/// URI for a private, shared-cache in-memory database (tests, demos).
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:track_kernel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

// -------------------- Time --------------------

/// Wall-clock UTC milliseconds since the epoch.
pub fn now_ms() -> Result<i64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(i64::try_from(elapsed.as_millis())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_memory_uris_are_distinct() {
        assert_ne!(shared_memory_uri(), shared_memory_uri());
        assert!(shared_memory_uri().starts_with("file:track_kernel_"));
    }

    #[test]
    fn shared_memory_db_is_visible_across_connections() -> Result<()> {
        let uri = shared_memory_uri();
        let a = open_db_connection(&uri)?;
        a.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
        let b = open_db_connection(&uri)?;
        let x: i64 = b.query_row("SELECT x FROM t", [], |row| row.get(0))?;
        assert_eq!(x, 7);
        Ok(())
    }

    #[test]
    fn now_ms_is_after_2020() -> Result<()> {
        assert!(now_ms()? > 1_577_836_800_000);
        Ok(())
    }
}
