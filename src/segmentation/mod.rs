pub mod algorithm;
pub mod config;
pub mod intervals;

pub use algorithm::{group_frames, FrameGroup};
pub use config::SegmentationConfig;
pub use intervals::{build_app_intervals, AppInterval};
