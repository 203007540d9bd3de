//! Detection ingestion sources.
//!
//! Sources deliver per-frame detection batches from the external detector:
//! - NDJSON files or stdin
//! - Synthetic `stub://` scenes (testing, demos)
//!
//! Sources do not associate or persist anything; they hand `Frame`s to the
//! per-camera associator.

pub mod file;
mod synthetic;

pub use file::{parse_frame_line, FileConfig, FileSource, FileStats, Frame};
