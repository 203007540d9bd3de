//! Track identity and track-state aggregation.
//!
//! - `associator`: per-frame, per-camera online IoU association
//! - `aggregator`: periodic windowed recompute of per-track summaries
//! - `state`: the aggregated `TrackState` row

pub mod aggregator;
pub mod associator;
mod state;

pub use aggregator::{
    Aggregator, AggregatorConfig, CameraCycle, CameraLocks, CycleReport, Recomputed,
    SpeedZoneHeuristic,
};
pub use associator::{Associator, AssociatorConfig, AssociatorStats, CameraAssociators, Track};
pub use state::{TrackState, TrackStateKey, TrackStatus};
