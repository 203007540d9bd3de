use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::detect::ClassFilter;
use crate::track::{AggregatorConfig, AssociatorConfig, SpeedZoneHeuristic};

const DEFAULT_DB_PATH: &str = "tracks.db";
const DEFAULT_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_HISTORY_RETENTION_SECS: u64 = 60 * 60 * 24;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrackerConfigFile {
    db_path: Option<String>,
    associator: Option<AssociatorConfigFile>,
    aggregator: Option<AggregatorConfigFile>,
    history: Option<HistoryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AssociatorConfigFile {
    track_thresh: Option<f32>,
    match_thresh: Option<f32>,
    max_age: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AggregatorConfigFile {
    window_secs: Option<u64>,
    min_detections: Option<usize>,
    loiter_threshold_secs: Option<u64>,
    eviction_grace_secs: Option<u64>,
    class_filter: Option<String>,
    slow_zone_speed: Option<f64>,
    slow_zone_id: Option<i64>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HistoryConfigFile {
    retention_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub db_path: String,
    pub associator: AssociatorConfig,
    pub aggregator: AggregatorConfig,
    /// Time between aggregation cycles.
    pub interval: Duration,
    /// How long raw detection history is kept.
    pub history_retention: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            associator: AssociatorConfig::default(),
            aggregator: AggregatorConfig::default(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            history_retention: Duration::from_secs(DEFAULT_HISTORY_RETENTION_SECS),
        }
    }
}

impl TrackerConfig {
    /// Load from `TRACK_CONFIG` (if set), then apply `TRACK_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRACK_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, then apply `TRACK_*` overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrackerConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let assoc = file.associator.unwrap_or_default();
        let agg = file.aggregator.unwrap_or_default();

        let associator = AssociatorConfig {
            track_thresh: assoc
                .track_thresh
                .unwrap_or(defaults.associator.track_thresh),
            match_thresh: assoc
                .match_thresh
                .unwrap_or(defaults.associator.match_thresh),
            max_age: assoc.max_age.unwrap_or(defaults.associator.max_age),
        };

        let class_filter = match agg.class_filter.as_deref() {
            Some(spec) => ClassFilter::parse(spec)?,
            None => defaults.aggregator.class_filter.clone(),
        };
        let aggregator = AggregatorConfig {
            window: agg
                .window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.aggregator.window),
            min_detections: agg
                .min_detections
                .unwrap_or(defaults.aggregator.min_detections),
            loiter_threshold: agg
                .loiter_threshold_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.aggregator.loiter_threshold),
            eviction_grace: agg
                .eviction_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.aggregator.eviction_grace),
            class_filter,
            zones: SpeedZoneHeuristic {
                max_speed: agg
                    .slow_zone_speed
                    .unwrap_or(defaults.aggregator.zones.max_speed),
                zone_id: agg
                    .slow_zone_id
                    .unwrap_or(defaults.aggregator.zones.zone_id),
            },
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            associator,
            aggregator,
            interval: agg
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            history_retention: file
                .history
                .and_then(|history| history.retention_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.history_retention),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("TRACK_DB_PATH") {
            self.db_path = path;
        }
        if let Some(v) = env_parse::<f32>("TRACK_THRESH")? {
            self.associator.track_thresh = v;
        }
        if let Some(v) = env_parse::<f32>("TRACK_MATCH_THRESH")? {
            self.associator.match_thresh = v;
        }
        if let Some(v) = env_parse::<u64>("TRACK_MAX_AGE")? {
            self.associator.max_age = v;
        }
        if let Some(v) = env_parse::<u64>("TRACK_WINDOW_SECS")? {
            self.aggregator.window = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("TRACK_MIN_DETECTIONS")? {
            self.aggregator.min_detections = v;
        }
        if let Some(v) = env_parse::<u64>("TRACK_LOITER_SECS")? {
            self.aggregator.loiter_threshold = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("TRACK_EVICTION_GRACE_SECS")? {
            self.aggregator.eviction_grace = Duration::from_secs(v);
        }
        if let Some(spec) = env_nonempty("TRACK_CLASS_FILTER") {
            self.aggregator.class_filter = ClassFilter::parse(&spec)?;
        }
        if let Some(v) = env_parse::<u64>("TRACK_INTERVAL_SECS")? {
            self.interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("TRACK_HISTORY_RETENTION_SECS")? {
            self.history_retention = Duration::from_secs(v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        self.associator.validate()?;
        self.aggregator.validate()?;
        if self.interval.is_zero() {
            return Err(anyhow!("aggregation interval must be greater than zero"));
        }
        if self.history_retention < self.aggregator.window {
            return Err(anyhow!(
                "history retention ({}s) must cover the aggregation window ({}s)",
                self.history_retention.as_secs(),
                self.aggregator.window.as_secs()
            ));
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_nonempty(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<TrackerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
