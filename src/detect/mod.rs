mod bbox;
mod filter;
mod result;

pub use bbox::{deserialize_bbox, parse_bbox, parse_bbox_text, try_parse_bbox};
pub use filter::ClassFilter;
pub use result::{Detection, TrackedDetection};
