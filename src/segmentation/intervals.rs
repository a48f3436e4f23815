use crate::frames::Frame;

/// A continuous run of one frontmost app across a day's frames.
///
/// `app_id` is `None` for stretches captured without a known app; those
/// still become intervals so the timeline has no unexplained holes.
#[derive(Debug, Clone, PartialEq)]
pub struct AppInterval {
    pub app_id: Option<String>,
    pub start_ts: f64,
    pub end_ts: f64,
}

/// Folds one day of timestamp-ordered frames into per-app activity
/// intervals, independent of how the same frames are grouped into videos.
///
/// A run closes at its own last frame, not at the first frame of the next
/// app, so neighboring intervals never overlap.
pub fn build_app_intervals(frames: &[Frame]) -> Vec<AppInterval> {
    let Some(first) = frames.first() else {
        return Vec::new();
    };

    let mut intervals = Vec::new();
    let mut current_app = first.app_id.clone();
    let mut current_start = first.ts;
    let mut last_ts = first.ts;

    for frame in &frames[1..] {
        if frame.app_id == current_app {
            last_ts = frame.ts;
            continue;
        }

        intervals.push(AppInterval {
            app_id: current_app,
            start_ts: current_start,
            end_ts: last_ts,
        });

        current_app = frame.app_id.clone();
        current_start = frame.ts;
        last_ts = frame.ts;
    }

    intervals.push(AppInterval {
        app_id: current_app,
        start_ts: current_start,
        end_ts: last_ts,
    });

    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn mock_frame(ts: f64, app_id: Option<&str>) -> Frame {
        Frame {
            path: PathBuf::from(format!("frame-{ts}")),
            ts,
            app_id: app_id.map(str::to_string),
            width: 1920,
            height: 1080,
            file_size_bytes: 1024,
        }
    }

    #[test]
    fn empty_day_has_no_intervals() {
        assert!(build_app_intervals(&[]).is_empty());
    }

    #[test]
    fn single_app_spans_the_whole_day() {
        let frames = vec![
            mock_frame(1000.0, Some("com.a")),
            mock_frame(1002.0, Some("com.a")),
            mock_frame(1004.0, Some("com.a")),
        ];

        let intervals = build_app_intervals(&frames);
        assert_eq!(
            intervals,
            vec![AppInterval {
                app_id: Some("com.a".to_string()),
                start_ts: 1000.0,
                end_ts: 1004.0,
            }]
        );
    }

    #[test]
    fn app_switch_closes_run_at_its_last_frame() {
        let frames = vec![
            mock_frame(1000.0, Some("com.a")),
            mock_frame(1002.0, Some("com.a")),
            mock_frame(1010.0, Some("com.b")),
            mock_frame(1012.0, Some("com.b")),
        ];

        let intervals = build_app_intervals(&frames);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].end_ts, 1002.0);
        assert_eq!(intervals[1].start_ts, 1010.0);
        assert_eq!(intervals[1].end_ts, 1012.0);
    }

    #[test]
    fn unknown_app_runs_become_intervals_too() {
        let frames = vec![
            mock_frame(1000.0, Some("com.a")),
            mock_frame(1002.0, None),
            mock_frame(1004.0, None),
            mock_frame(1006.0, Some("com.a")),
        ];

        let intervals = build_app_intervals(&frames);
        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[1].app_id, None);
        assert_eq!(intervals[1].start_ts, 1002.0);
        assert_eq!(intervals[1].end_ts, 1004.0);
        assert_eq!(intervals[2].app_id.as_deref(), Some("com.a"));
    }

    #[test]
    fn single_frame_run_has_zero_width() {
        let frames = vec![
            mock_frame(1000.0, Some("com.a")),
            mock_frame(1002.0, Some("com.b")),
            mock_frame(1004.0, Some("com.a")),
        ];

        let intervals = build_app_intervals(&frames);
        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[1].start_ts, 1002.0);
        assert_eq!(intervals[1].end_ts, 1002.0);
    }
}
