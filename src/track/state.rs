use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Behavioral status of an aggregated track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Active,
    Loitering,
    /// Never written by the aggregator: an exited track is simply evicted.
    /// Kept so rows written by other tools still read back.
    Exited,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Active => "active",
            TrackStatus::Loitering => "loitering",
            TrackStatus::Exited => "exited",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "active" => Ok(TrackStatus::Active),
            "loitering" => Ok(TrackStatus::Loitering),
            "exited" => Ok(TrackStatus::Exited),
            other => Err(anyhow!("unknown track status {:?}", other)),
        }
    }
}

/// Storage key of a [`TrackState`] row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackStateKey {
    pub camera_id: String,
    pub track_id: u64,
    pub zone_id: Option<i64>,
}

/// Aggregated per-track summary over the rolling window.
///
/// Recomputed wholesale from raw detection history every cycle; never
/// patched incrementally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    pub camera_id: String,
    pub track_id: u64,
    /// Best-effort zone from the speed heuristic, not geometric containment.
    pub zone_id: Option<i64>,
    pub class_name: String,
    pub enter_time_ms: i64,
    pub last_time_ms: i64,
    /// `last_time - enter_time` in whole seconds.
    pub total_dwell_sec: i64,
    pub detection_count: u64,
    /// Mean center displacement per second (pixels/sec).
    pub avg_speed: f64,
    /// Mean box area (pixels²).
    pub avg_bbox_area: f64,
    pub status: TrackStatus,
}

impl TrackState {
    pub fn key(&self) -> TrackStateKey {
        TrackStateKey {
            camera_id: self.camera_id.clone(),
            track_id: self.track_id,
            zone_id: self.zone_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.track_id == 0 {
            return Err(anyhow!("track_id must be positive"));
        }
        if self.enter_time_ms > self.last_time_ms {
            return Err(anyhow!(
                "enter_time {} is after last_time {}",
                self.enter_time_ms,
                self.last_time_ms
            ));
        }
        if self.detection_count == 0 {
            return Err(anyhow!("detection_count must be at least 1"));
        }
        if self.total_dwell_sec < 0 {
            return Err(anyhow!("total_dwell_sec must not be negative"));
        }
        if !self.avg_speed.is_finite() || self.avg_speed < 0.0 {
            return Err(anyhow!("avg_speed is not a finite non-negative number"));
        }
        if !self.avg_bbox_area.is_finite() || self.avg_bbox_area < 0.0 {
            return Err(anyhow!("avg_bbox_area is not a finite non-negative number"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TrackState {
        TrackState {
            camera_id: "CAM_001".to_string(),
            track_id: 7,
            zone_id: Some(1),
            class_name: "person".to_string(),
            enter_time_ms: 0,
            last_time_ms: 130_000,
            total_dwell_sec: 130,
            detection_count: 3,
            avg_speed: 0.5,
            avg_bbox_area: 100.0,
            status: TrackStatus::Loitering,
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [TrackStatus::Active, TrackStatus::Loitering, TrackStatus::Exited] {
            assert_eq!(TrackStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TrackStatus::parse("lost").is_err());
    }

    #[test]
    fn validate_catches_broken_invariants() {
        assert!(state().validate().is_ok());

        let mut s = state();
        s.enter_time_ms = s.last_time_ms + 1;
        assert!(s.validate().is_err());

        let mut s = state();
        s.detection_count = 0;
        assert!(s.validate().is_err());

        let mut s = state();
        s.avg_speed = f64::INFINITY;
        assert!(s.validate().is_err());
    }

    #[test]
    fn serializes_status_lowercase() {
        let json = serde_json::to_value(state()).unwrap();
        assert_eq!(json["status"], "loitering");
    }
}
