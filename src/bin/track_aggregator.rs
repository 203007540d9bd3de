//! track_aggregator - periodic track-state recompute.
//!
//! Every interval, recomputes per-track state over the rolling window for
//! each camera, commits it, and prunes detection history past retention.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use track_kernel::config::TrackerConfig;
use track_kernel::{now_ms, Aggregator, CycleReport, SqliteTrackStore, TrackStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Recompute windowed track states on an interval")]
struct Args {
    /// Run a single cycle and exit (nonzero if any camera failed).
    #[arg(long)]
    once: bool,

    /// Database path (overrides TRACK_DB_PATH and the config file).
    #[arg(long)]
    db: Option<String>,

    /// Seconds between cycles (overrides TRACK_INTERVAL_SECS).
    #[arg(long)]
    interval_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = TrackerConfig::load()?;
    if let Some(db) = args.db.clone() {
        cfg.db_path = db;
    }
    if let Some(secs) = args.interval_secs {
        if secs == 0 {
            return Err(anyhow!("--interval-secs must be greater than zero"));
        }
        cfg.interval = Duration::from_secs(secs);
    }

    let mut store = SqliteTrackStore::open(&cfg.db_path)?;
    let aggregator = Aggregator::new(cfg.aggregator.clone())?;

    log::info!("track_aggregator running. reading {}", cfg.db_path);
    log::info!(
        "window={}s min_detections={} loiter={}s eviction_grace={}s filter={} interval={}s",
        cfg.aggregator.window.as_secs(),
        cfg.aggregator.min_detections,
        cfg.aggregator.loiter_threshold.as_secs(),
        cfg.aggregator.eviction_grace.as_secs(),
        cfg.aggregator.class_filter.describe(),
        cfg.interval.as_secs()
    );

    if args.once {
        let report = run_once(&aggregator, &mut store, &cfg)?;
        if !report.is_success() {
            return Err(anyhow!(
                "{} camera(s) failed: {}",
                report.cameras_failed.len(),
                failed_summary(&report)
            ));
        }
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })?;

    let mut next_cycle = Instant::now();
    while running.load(Ordering::SeqCst) {
        if Instant::now() >= next_cycle {
            // A cycle failure is logged and retried next interval.
            if let Err(e) = run_once(&aggregator, &mut store, &cfg) {
                log::error!("cycle failed: {}", e);
            }
            next_cycle = Instant::now() + cfg.interval;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    log::info!("track_aggregator stopped");
    Ok(())
}

fn run_once(
    aggregator: &Aggregator,
    store: &mut SqliteTrackStore,
    cfg: &TrackerConfig,
) -> Result<CycleReport> {
    let now = now_ms()?;
    let report = aggregator.run_cycle(store, now)?;
    if !report.is_success() {
        log::warn!("cycle: failed cameras: {}", failed_summary(&report));
    }

    let retention_ms = i64::try_from(cfg.history_retention.as_millis())?;
    match store.prune_detections(now.saturating_sub(retention_ms)) {
        Ok(0) => {}
        Ok(pruned) => log::info!("pruned {} detection(s) past retention", pruned),
        Err(e) => log::warn!("detection prune failed: {}", e),
    }
    Ok(report)
}

fn failed_summary(report: &CycleReport) -> String {
    report
        .cameras_failed
        .iter()
        .map(|(camera, err)| format!("{} ({})", camera, err))
        .collect::<Vec<_>>()
        .join(", ")
}
