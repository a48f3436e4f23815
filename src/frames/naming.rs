//! Frame filename scheme.
//!
//! Every captured frame is named `YYYYMMDD-HHMMSS-<id>-<app>` with no
//! extension. The timestamp prefix sorts chronologically and parses back to
//! epoch seconds, the 8-char id keeps same-second captures unique, and the
//! trailing app id records what was frontmost at capture time.

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use uuid::Uuid;

/// Extensions stripped when recovering an app id from a filename. Frames are
/// stored extensionless, but names from older builds may still carry one.
const MEDIA_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "mp4", "mov"];

const TS_PREFIX_LEN: usize = 15;

fn parse_digits(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn parse_prefix(name: &str) -> Option<chrono::NaiveDateTime> {
    if name.len() < TS_PREFIX_LEN || !name.is_char_boundary(TS_PREFIX_LEN) {
        return None;
    }
    if name.as_bytes()[8] != b'-' {
        return None;
    }

    let year = parse_digits(&name[0..4])? as i32;
    let month = parse_digits(&name[4..6])?;
    let day = parse_digits(&name[6..8])?;
    let hour = parse_digits(&name[9..11])?;
    let minute = parse_digits(&name[11..13])?;
    let second = parse_digits(&name[13..15])?;

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

/// Extracts the capture timestamp in epoch seconds from a frame name, or
/// `None` if the name does not carry a valid `YYYYMMDD-HHMMSS` prefix.
/// The prefix is interpreted in local time, matching how frames are named
/// at capture.
pub fn parse_timestamp(name: &str) -> Option<f64> {
    let naive = parse_prefix(name)?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(local.timestamp() as f64)
}

/// Extracts the app id from a frame name, dropping a trailing media
/// extension when present. Returns `None` when the name carries no app part.
pub fn parse_app_id(name: &str) -> Option<String> {
    parse_prefix(name)?;

    let rest = name[TS_PREFIX_LEN..].strip_prefix('-')?;
    let (_, mut app_id) = rest.split_once('-')?;
    if app_id.is_empty() {
        return None;
    }

    if let Some((stem, ext)) = app_id.rsplit_once('.') {
        if MEDIA_EXTENSIONS.contains(&ext) {
            app_id = stem;
        }
    }

    if app_id.is_empty() {
        None
    } else {
        Some(app_id.to_string())
    }
}

/// Normalizes an app bundle id for filename use. Letters, digits, and dots
/// pass through; every other run of characters collapses to a single
/// underscore. An empty id becomes `unknown`.
pub fn sanitize_app_id(app_id: &str) -> String {
    if app_id.is_empty() {
        return "unknown".to_string();
    }

    let mut sanitized = String::with_capacity(app_id.len());
    let mut in_replaced_run = false;
    for c in app_id.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            sanitized.push(c);
            in_replaced_run = false;
        } else if !in_replaced_run {
            sanitized.push('_');
            in_replaced_run = true;
        }
    }
    sanitized
}

/// Converts a compact `YYYYMMDD` date into the dashed `YYYY-MM-DD` form the
/// database uses as its date key. Directories and frame names stay compact.
pub fn dashed_date(date: &str) -> String {
    if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) {
        format!("{}-{}-{}", &date[0..4], &date[4..6], &date[6..8])
    } else {
        date.to_string()
    }
}

/// Builds a fresh frame name for a capture taken at `timestamp` while
/// `app_id` was frontmost.
pub fn generate_frame_name(timestamp: DateTime<Local>, app_id: Option<&str>) -> String {
    let short_id = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        timestamp.format("%Y%m%d-%H%M%S"),
        &short_id[..8],
        sanitize_app_id(app_id.unwrap_or("unknown")),
    )
}
