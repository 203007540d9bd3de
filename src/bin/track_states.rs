//! track_states - dump persisted track states as JSON.

use anyhow::Result;
use clap::Parser;
use std::io::Write;

use track_kernel::config::TrackerConfig;
use track_kernel::{SqliteTrackStore, TrackStatus, TrackStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Print persisted track states as JSON")]
struct Args {
    /// Database path (overrides TRACK_DB_PATH and the config file).
    #[arg(long)]
    db: Option<String>,

    /// Only this camera.
    #[arg(long)]
    camera: Option<String>,

    /// Only loitering tracks.
    #[arg(long)]
    loitering: bool,

    /// One JSON object per line instead of a pretty array.
    #[arg(long)]
    ndjson: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mut cfg = TrackerConfig::load()?;
    if let Some(db) = args.db {
        cfg.db_path = db;
    }

    let mut store = SqliteTrackStore::open(&cfg.db_path)?;
    let mut states = store.track_states(args.camera.as_deref())?;
    if args.loitering {
        states.retain(|s| s.status == TrackStatus::Loitering);
    }
    log::info!("{} track state(s) from {}", states.len(), cfg.db_path);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.ndjson {
        for state in &states {
            writeln!(out, "{}", serde_json::to_string(state)?)?;
        }
    } else {
        writeln!(out, "{}", serde_json::to_string_pretty(&states)?)?;
    }
    Ok(())
}
