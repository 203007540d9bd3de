//! trackd - online track association daemon.
//!
//! Reads per-frame detection batches, assigns track ids per camera and
//! appends the tracked observations to the detection history.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use track_kernel::config::TrackerConfig;
use track_kernel::{CameraAssociators, FileConfig, FileSource, SqliteTrackStore, TrackStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RecordMode {
    /// Every tracked observation (needed for dwell and speed).
    All,
    /// Only the first observation of each new track id.
    FirstSighting,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Assign track ids to detection frames and record them")]
struct Args {
    /// Frame source: NDJSON file, `-` for stdin, or `stub://<camera_id>`.
    #[arg(long, env = "TRACK_SOURCE", default_value = "-")]
    source: String,

    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,

    /// Which observations to write to the detection history.
    #[arg(long, value_enum, env = "TRACK_RECORD_MODE", default_value_t = RecordMode::All)]
    record: RecordMode,

    /// Database path (overrides TRACK_DB_PATH and the config file).
    #[arg(long)]
    db: Option<String>,

    /// Seconds between health log lines.
    #[arg(long, default_value_t = 5)]
    health_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = TrackerConfig::load()?;
    if let Some(db) = args.db.clone() {
        cfg.db_path = db;
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })?;

    let mut store = SqliteTrackStore::open(&cfg.db_path)?;
    let mut associators = CameraAssociators::new(cfg.associator.clone())?;
    let mut source = FileSource::new(FileConfig {
        path: args.source.clone(),
        max_frames: args.max_frames,
    })?;
    let synthetic = args.source.trim().starts_with("stub://");

    log::info!("trackd running. writing to {}", cfg.db_path);
    log::info!(
        "track_thresh={} match_thresh={} max_age={} record={:?}",
        cfg.associator.track_thresh,
        cfg.associator.match_thresh,
        cfg.associator.max_age,
        args.record
    );

    let mut recorded = 0u64;
    let mut rejected_frames = 0u64;
    let mut last_health_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        let Some(frame) = source.next_frame()? else {
            log::info!("frame source exhausted");
            break;
        };

        let tracked = match associators.update(&frame.camera_id, &frame.detections, frame.frame_id)
        {
            Ok(tracked) => tracked,
            Err(e) => {
                rejected_frames += 1;
                log::warn!("frame {} rejected: {}", frame.frame_id, e);
                continue;
            }
        };

        let to_record = match (args.record, associators.get(&frame.camera_id)) {
            (RecordMode::FirstSighting, Some(associator)) => {
                associator.first_sightings(tracked, frame.frame_id)
            }
            _ => tracked,
        };
        if !to_record.is_empty() {
            store.append_detections(&to_record)?;
            recorded += to_record.len() as u64;
        }

        if last_health_log.elapsed() >= Duration::from_secs(args.health_secs.max(1)) {
            let stats = source.stats();
            log::info!(
                "source={} frames={} rejected_lines={} filled_timestamps={} rejected_frames={} cameras={} active_tracks={} recorded={}",
                stats.path,
                stats.frames_read,
                stats.lines_rejected,
                stats.timestamps_filled,
                rejected_frames,
                associators.cameras().len(),
                associators.active_tracks_total(),
                recorded
            );
            last_health_log = Instant::now();
        }

        // Synthetic scenes are paced at ~10 fps.
        if synthetic {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    for camera_id in associators.cameras() {
        if let Some(associator) = associators.get(&camera_id) {
            let stats = associator.stats();
            log::info!(
                "camera {}: frames={} detections={} below_threshold={} matched={} created={} evicted={}",
                camera_id,
                stats.frames,
                stats.detections_in,
                stats.below_threshold,
                stats.matched,
                stats.tracks_created,
                stats.tracks_evicted
            );
        }
    }
    log::info!("trackd stopped. {} observations recorded", recorded);
    Ok(())
}
