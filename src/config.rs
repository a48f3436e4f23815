use std::collections::HashSet;
use std::path::Path;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_PROCESSING_INTERVAL_MINUTES: u32 = 5;
pub const DEFAULT_FFMPEG_CRF: u8 = 28;
pub const DEFAULT_VIDEO_FPS: u32 = 30;

pub const VALID_PROCESSING_INTERVALS: [u32; 6] = [1, 5, 10, 15, 30, 60];

/// How long captured data is kept before cleanup may reclaim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    #[serde(rename = "never")]
    Never,
    #[serde(rename = "1_day")]
    OneDay,
    #[serde(rename = "1_week")]
    OneWeek,
    #[serde(rename = "1_month")]
    OneMonth,
}

impl RetentionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicy::Never => "never",
            RetentionPolicy::OneDay => "1_day",
            RetentionPolicy::OneWeek => "1_week",
            RetentionPolicy::OneMonth => "1_month",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "never" => Some(RetentionPolicy::Never),
            "1_day" => Some(RetentionPolicy::OneDay),
            "1_week" => Some(RetentionPolicy::OneWeek),
            "1_month" => Some(RetentionPolicy::OneMonth),
            _ => None,
        }
    }

    /// Maximum age before data becomes eligible for cleanup.
    /// `None` means data is kept forever.
    pub fn max_age(&self) -> Option<chrono::Duration> {
        match self {
            RetentionPolicy::Never => None,
            RetentionPolicy::OneDay => Some(chrono::Duration::days(1)),
            RetentionPolicy::OneWeek => Some(chrono::Duration::days(7)),
            RetentionPolicy::OneMonth => Some(chrono::Duration::days(30)),
        }
    }
}

/// What happens to capture ticks while an excluded app is frontmost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionMode {
    /// Tick produces no frame at all.
    #[serde(rename = "skip")]
    Skip,
    /// Tick produces an opaque placeholder frame so the timeline has no hole.
    #[serde(rename = "invisible")]
    Redact,
}

impl ExclusionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionMode::Skip => "skip",
            ExclusionMode::Redact => "invisible",
        }
    }
}

/// User-facing configuration loaded from `config.json`.
///
/// Loading never fails: a missing or unreadable file yields defaults, and
/// each invalid value independently falls back to its own default, so one
/// bad key cannot take the whole service down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(deserialize_with = "de_version")]
    pub version: String,
    #[serde(deserialize_with = "de_processing_interval")]
    pub processing_interval_minutes: u32,
    #[serde(deserialize_with = "de_frame_policy")]
    pub temp_retention_policy: RetentionPolicy,
    #[serde(deserialize_with = "de_recording_policy")]
    pub recording_retention_policy: RetentionPolicy,
    #[serde(deserialize_with = "de_exclusion_mode")]
    pub exclusion_mode: ExclusionMode,
    #[serde(deserialize_with = "de_excluded_apps")]
    pub excluded_apps: Vec<String>,
    #[serde(deserialize_with = "de_ffmpeg_crf")]
    pub ffmpeg_crf: u8,
    #[serde(deserialize_with = "de_video_fps")]
    pub video_fps: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            version: DEFAULT_VERSION.to_string(),
            processing_interval_minutes: DEFAULT_PROCESSING_INTERVAL_MINUTES,
            temp_retention_policy: RetentionPolicy::OneWeek,
            recording_retention_policy: RetentionPolicy::Never,
            exclusion_mode: ExclusionMode::Skip,
            excluded_apps: Vec::new(),
            ffmpeg_crf: DEFAULT_FFMPEG_CRF,
            video_fps: DEFAULT_VIDEO_FPS,
        }
    }
}

impl AppConfig {
    /// Loads configuration from the given file, falling back to defaults if
    /// the file is missing or unparseable.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                log::warn!(
                    "Failed to read config at {}, using defaults: {}",
                    path.display(),
                    err
                );
                return AppConfig::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                log::warn!(
                    "Failed to parse config at {}, using defaults: {}",
                    path.display(),
                    err
                );
                AppConfig::default()
            }
        }
    }

    pub fn is_app_excluded(&self, app_id: &str) -> bool {
        self.excluded_apps.iter().any(|excluded| excluded == app_id)
    }
}

fn is_valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty()
        && app_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
}

// Per-field deserializers. Each one accepts any JSON value and falls back
// to the field default when the value is missing, mistyped, or out of range.

fn de_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value.as_str() {
        Some(s) => s.to_string(),
        None => DEFAULT_VERSION.to_string(),
    })
}

fn de_processing_interval<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value.as_u64() {
        Some(n) if VALID_PROCESSING_INTERVALS.contains(&(n as u32)) => n as u32,
        _ => DEFAULT_PROCESSING_INTERVAL_MINUTES,
    })
}

fn de_policy_or<'de, D: Deserializer<'de>>(
    deserializer: D,
    fallback: RetentionPolicy,
) -> Result<RetentionPolicy, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(RetentionPolicy::parse)
        .unwrap_or(fallback))
}

fn de_frame_policy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RetentionPolicy, D::Error> {
    de_policy_or(deserializer, RetentionPolicy::OneWeek)
}

fn de_recording_policy<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<RetentionPolicy, D::Error> {
    de_policy_or(deserializer, RetentionPolicy::Never)
}

fn de_exclusion_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ExclusionMode, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value.as_str() {
        Some("invisible") => ExclusionMode::Redact,
        Some("skip") => ExclusionMode::Skip,
        _ => ExclusionMode::Skip,
    })
}

fn de_excluded_apps<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    let entries = match value.as_array() {
        Some(entries) => entries,
        None => return Ok(Vec::new()),
    };

    let mut seen = HashSet::new();
    let mut apps = Vec::new();
    for entry in entries {
        if let Some(raw) = entry.as_str() {
            let trimmed = raw.trim();
            if is_valid_app_id(trimmed) && seen.insert(trimmed.to_string()) {
                apps.push(trimmed.to_string());
            }
        }
    }
    Ok(apps)
}

fn de_ffmpeg_crf<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value.as_u64() {
        Some(n) if n <= 51 => n as u8,
        _ => DEFAULT_FFMPEG_CRF,
    })
}

fn de_video_fps<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value.as_u64() {
        Some(n) if n > 0 && n <= u32::MAX as u64 => n as u32,
        _ => DEFAULT_VIDEO_FPS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_when_file_missing() {
        let config = AppConfig::load(Path::new("/nonexistent/config.json"));
        assert_eq!(config.processing_interval_minutes, 5);
        assert_eq!(config.temp_retention_policy, RetentionPolicy::OneWeek);
        assert_eq!(config.recording_retention_policy, RetentionPolicy::Never);
        assert_eq!(config.exclusion_mode, ExclusionMode::Skip);
        assert_eq!(config.ffmpeg_crf, 28);
        assert_eq!(config.video_fps, 30);
    }

    #[test]
    fn invalid_values_fall_back_per_field() {
        let raw = r#"{
            "processing_interval_minutes": 7,
            "temp_retention_policy": "2_weeks",
            "recording_retention_policy": "1_month",
            "exclusion_mode": "blur",
            "ffmpeg_crf": 99,
            "video_fps": -5
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.processing_interval_minutes, 5);
        assert_eq!(config.temp_retention_policy, RetentionPolicy::OneWeek);
        assert_eq!(
            config.recording_retention_policy,
            RetentionPolicy::OneMonth
        );
        assert_eq!(config.exclusion_mode, ExclusionMode::Skip);
        assert_eq!(config.ffmpeg_crf, 28);
        assert_eq!(config.video_fps, 30);
    }

    #[test]
    fn mistyped_values_fall_back_without_failing_siblings() {
        let raw = r#"{
            "processing_interval_minutes": "ten",
            "video_fps": 24,
            "excluded_apps": "com.example.app"
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.processing_interval_minutes, 5);
        assert_eq!(config.video_fps, 24);
        assert!(config.excluded_apps.is_empty());
    }

    #[test]
    fn excluded_apps_filtered_and_deduplicated() {
        let raw = r#"{
            "excluded_apps": [
                "com.apple.Safari",
                "  com.1password.app  ",
                "bad app id",
                "",
                "com.apple.Safari",
                42
            ]
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(
            config.excluded_apps,
            vec!["com.apple.Safari", "com.1password.app"]
        );
        assert!(config.is_app_excluded("com.apple.Safari"));
        assert!(!config.is_app_excluded("com.apple.Terminal"));
    }

    #[test]
    fn exclusion_mode_invisible_maps_to_redact() {
        let raw = r#"{"exclusion_mode": "invisible"}"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.exclusion_mode, ExclusionMode::Redact);
        assert_eq!(config.exclusion_mode.as_str(), "invisible");
    }

    #[test]
    fn policy_round_trips_through_strings() {
        for policy in [
            RetentionPolicy::Never,
            RetentionPolicy::OneDay,
            RetentionPolicy::OneWeek,
            RetentionPolicy::OneMonth,
        ] {
            assert_eq!(RetentionPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(RetentionPolicy::parse("2_months"), None);
    }

    #[test]
    fn policy_max_age() {
        assert_eq!(RetentionPolicy::Never.max_age(), None);
        assert_eq!(
            RetentionPolicy::OneDay.max_age(),
            Some(chrono::Duration::days(1))
        );
        assert_eq!(
            RetentionPolicy::OneMonth.max_age(),
            Some(chrono::Duration::days(30))
        );
    }
}
