use serde::{Deserialize, Serialize};

/// A continuous stretch of one frontmost app, as indexed for the timeline.
///
/// `app_id` is `None` for stretches where no app could be identified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppIntervalRecord {
    pub id: String,
    pub app_id: Option<String>,
    /// Capture date as YYYY-MM-DD.
    pub date: String,
    pub start_ts: f64,
    pub end_ts: f64,
}
