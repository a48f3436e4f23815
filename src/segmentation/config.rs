/// Configuration for the frame grouping pass with tunable thresholds.
#[derive(Debug, Clone)]
pub struct SegmentationConfig {
    /// Hard cap on frames per segment; a run longer than this is split.
    pub max_frames_per_segment: usize,

    /// Largest pause between consecutive frames that still counts as
    /// continuous recording, in seconds. Anything longer starts a new
    /// segment.
    pub max_gap_seconds: f64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_frames_per_segment: 150,
            max_gap_seconds: 60.0,
        }
    }
}
