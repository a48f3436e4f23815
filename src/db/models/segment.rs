use serde::{Deserialize, Serialize};

/// One encoded video segment as indexed in the metadata store.
///
/// `video_path` is stored absolute; readers resolve relative values from
/// older rows against the data root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub id: String,
    /// Capture date as YYYY-MM-DD.
    pub date: String,
    pub start_ts: f64,
    pub end_ts: f64,
    pub frame_count: u32,
    pub fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size_bytes: u64,
    pub video_path: String,
}

impl SegmentRecord {
    pub fn duration_secs(&self) -> f64 {
        (self.end_ts - self.start_ts).max(0.0)
    }

    /// Whether the given timestamp falls inside this segment, bounds
    /// included.
    pub fn covers(&self, ts: f64) -> bool {
        self.start_ts <= ts && ts <= self.end_ts
    }
}

/// Aggregate counters used by the status report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub segment_count: u64,
    pub interval_count: u64,
    pub video_bytes: u64,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}
