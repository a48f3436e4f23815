//! The processing pipeline: raw frames in, indexed video segments out.
//!
//! A run works date by date. For each date it scans the frame store, skips
//! everything already covered by the index, groups what remains, and turns
//! each group into one encoded video plus one atomic metadata commit.
//! A failed group costs only that group; the run carries on and reports an
//! aggregate status at the end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;

use crate::config::AppConfig;
use crate::db::models::{generate_record_id, AppIntervalRecord, SegmentRecord};
use crate::db::Database;
use crate::encoder::{EncodeRequest, SegmentEncoder};
use crate::frames::{naming, FrameStore};
use crate::paths::{self, DataPaths};
use crate::retention::{CleanupOptions, CleanupReport, RetentionEngine, STALE_PART_MAX_AGE};
use crate::segmentation::{build_app_intervals, group_frames, FrameGroup, SegmentationConfig};
use crate::storage;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// A failed metadata commit gets one more chance after this pause, enough
/// to ride out lock contention from a concurrently reading viewer.
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How a processing run went, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    AllSucceeded,
    PartialFailure,
    NoneSucceeded,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::AllSucceeded => 0,
            RunStatus::NoneSucceeded => 1,
            RunStatus::PartialFailure => 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Process exactly this date (YYYYMMDD) and leave retention alone.
    /// `None` runs the full scheduled pass over every pending date.
    pub date: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct DayReport {
    succeeded: usize,
    failed: usize,
}

pub struct Processor {
    db: Database,
    paths: DataPaths,
    config: AppConfig,
    encoder: Arc<dyn SegmentEncoder>,
    segmentation: SegmentationConfig,
}

impl Processor {
    pub fn new(
        db: Database,
        paths: DataPaths,
        config: AppConfig,
        encoder: Arc<dyn SegmentEncoder>,
    ) -> Self {
        Processor {
            db,
            paths,
            config,
            encoder,
            segmentation: SegmentationConfig::default(),
        }
    }

    /// Runs the pipeline and reports how much of the pending work landed.
    pub async fn run(&self, options: &ProcessOptions) -> Result<RunStatus> {
        let store = FrameStore::new(self.paths.frames_root());

        let (dates, scheduled) = match &options.date {
            Some(date) => {
                if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
                    bail!("invalid date {date:?}, expected YYYYMMDD");
                }
                (vec![date.clone()], false)
            }
            None => (store.list_dates()?, true),
        };

        if scheduled {
            // Clear leftovers from interrupted runs before adding new work
            let retention = RetentionEngine::new(self.db.clone(), self.paths.clone());
            let mut report = CleanupReport::default();
            if let Err(err) = retention.cleanup_orphans(false, &mut report).await {
                log_warn!("Orphan cleanup failed: {err:#}");
            }
            retention.sweep_stale_parts(STALE_PART_MAX_AGE, false, &mut report);
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for date in &dates {
            // Encoding into a full disk only makes the situation worse, so
            // a breached watermark aborts the whole run as fatal
            storage::ensure_free_space(&self.paths.data_root())?;

            match self.process_day(&store, date).await {
                Ok(report) => {
                    succeeded += report.succeeded;
                    failed += report.failed;
                }
                Err(err) => {
                    log_error!("Processing failed for {date}: {err:#}");
                    failed += 1;
                }
            }
        }

        if scheduled {
            self.run_retention().await;
        }

        let status = aggregate_status(succeeded, failed);
        log_info!(
            "Processing finished: {succeeded} segment(s) written, {failed} failure(s)"
        );
        Ok(status)
    }

    /// Encodes and indexes everything still pending for one date.
    async fn process_day(&self, store: &FrameStore, date: &str) -> Result<DayReport> {
        let mut report = DayReport::default();
        let dashed_date = naming::dashed_date(date);

        let mut frames = store.scan_day(date)?;
        if let Some(mark) = self.db.processed_through(&dashed_date).await? {
            frames.retain(|frame| frame.ts > mark);
        }
        if frames.is_empty() {
            return Ok(report);
        }

        let groups = group_frames(frames, &self.segmentation);
        log_info!(
            "Processing {date}: {} group(s) pending",
            groups.len()
        );

        let segment_day_dir = DataPaths::day_dir(&self.paths.segments_root(), date);
        paths::create_private_dir(&segment_day_dir).with_context(|| {
            format!(
                "failed to create segment directory {}",
                segment_day_dir.display()
            )
        })?;

        for group in groups {
            let segment_id = generate_record_id();
            let video_path = segment_day_dir.join(format!("{segment_id}.mp4"));

            let request = EncodeRequest {
                frame_paths: group.frames.iter().map(|f| f.path.clone()).collect(),
                dest_path: video_path.clone(),
                fps: f64::from(self.config.video_fps),
                crf: self.config.ffmpeg_crf,
            };

            let encoded = match self.encoder.encode(request).await {
                Ok(encoded) => encoded,
                Err(err) => {
                    log_error!(
                        "Encode failed for group {}..{} of {date}, skipping it: {err:#}",
                        group.start_ts,
                        group.end_ts
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let record = SegmentRecord {
                id: segment_id,
                date: dashed_date.clone(),
                start_ts: group.start_ts,
                end_ts: group.end_ts,
                frame_count: group.frame_count() as u32,
                fps: Some(f64::from(self.config.video_fps)),
                width: encoded.width.or(Some(group.width)),
                height: encoded.height.or(Some(group.height)),
                file_size_bytes: encoded.file_size_bytes,
                video_path: video_path.to_string_lossy().into_owned(),
            };
            let intervals = interval_records(&group, &dashed_date);

            match self.commit_with_retry(&record, &intervals).await {
                Ok(()) => {
                    log_info!(
                        "Wrote segment {} ({} frames, {})",
                        record.id,
                        record.frame_count,
                        record.date
                    );
                    report.succeeded += 1;
                }
                Err(err) => {
                    log_error!("Failed to index segment {}: {err:#}", record.id);
                    // Without its row the video is unreachable and the same
                    // frames will re-encode next run, so drop the file now
                    if let Err(remove_err) = std::fs::remove_file(&video_path) {
                        log_warn!(
                            "Failed to remove unindexed video {}: {remove_err}",
                            video_path.display()
                        );
                    }
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn commit_with_retry(
        &self,
        record: &SegmentRecord,
        intervals: &[AppIntervalRecord],
    ) -> Result<()> {
        match self.db.commit_group(record, intervals).await {
            Ok(()) => Ok(()),
            Err(first_err) => {
                log_warn!(
                    "Indexing segment {} failed, retrying once: {first_err:#}",
                    record.id
                );
                tokio::time::sleep(COMMIT_RETRY_DELAY).await;
                self.db.commit_group(record, intervals).await
            }
        }
    }

    async fn run_retention(&self) {
        let retention = RetentionEngine::new(self.db.clone(), self.paths.clone());
        let options = CleanupOptions {
            frame_policy: self.config.temp_retention_policy,
            recording_policy: self.config.recording_retention_policy,
            orphaned: false,
            vacuum: false,
            dry_run: false,
        };

        match retention.run(&options, Local::now()).await {
            Ok(report) => {
                if report.frames_deleted > 0 || report.segments_deleted > 0 {
                    log_info!(
                        "Retention reclaimed {} frame(s) and {} recording(s)",
                        report.frames_deleted,
                        report.segments_deleted
                    );
                }
            }
            Err(err) => log_error!("Retention pass failed: {err:#}"),
        }
    }
}

fn aggregate_status(succeeded: usize, failed: usize) -> RunStatus {
    if failed == 0 {
        RunStatus::AllSucceeded
    } else if succeeded == 0 {
        RunStatus::NoneSucceeded
    } else {
        RunStatus::PartialFailure
    }
}

fn interval_records(group: &FrameGroup, dashed_date: &str) -> Vec<AppIntervalRecord> {
    build_app_intervals(&group.frames)
        .into_iter()
        .map(|interval| AppIntervalRecord {
            id: generate_record_id(),
            app_id: interval.app_id,
            date: dashed_date.to_string(),
            start_ts: interval.start_ts,
            end_ts: interval.end_ts,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use image::{ImageFormat, RgbaImage};

    use crate::config::RetentionPolicy;
    use crate::encoder::EncodedVideo;

    /// Encoder double: writes a small file where the video would go. Groups
    /// whose frames mention the poison app fail outright; groups mentioning
    /// the hugefile app report a byte size no SQLite INTEGER can hold, which
    /// makes the metadata commit fail after a successful encode.
    #[derive(Default)]
    struct FakeEncoder {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl SegmentEncoder for FakeEncoder {
        async fn encode(&self, request: EncodeRequest) -> Result<EncodedVideo> {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            let mentions = |needle: &str| {
                request
                    .frame_paths
                    .iter()
                    .any(|path| path.to_string_lossy().contains(needle))
            };
            if mentions("com.poison") {
                bail!("synthetic encoder failure");
            }

            std::fs::write(&request.dest_path, vec![0u8; 1024])?;
            Ok(EncodedVideo {
                file_size_bytes: if mentions("com.hugefile") { u64::MAX } else { 1024 },
                width: None,
                height: None,
            })
        }
    }

    struct Pipeline {
        _tmp: tempfile::TempDir,
        paths: DataPaths,
        db: Database,
        encoder: Arc<FakeEncoder>,
        processor: Processor,
    }

    fn pipeline() -> Pipeline {
        pipeline_with_config(AppConfig {
            temp_retention_policy: RetentionPolicy::Never,
            recording_retention_policy: RetentionPolicy::Never,
            ..AppConfig::default()
        })
    }

    fn pipeline_with_config(config: AppConfig) -> Pipeline {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::from_base(tmp.path().to_path_buf());
        paths.ensure_data_directories().unwrap();

        let db = Database::new(paths.database_path()).unwrap();
        let encoder = Arc::new(FakeEncoder::default());
        let processor = Processor::new(
            db.clone(),
            paths.clone(),
            config,
            encoder.clone(),
        );

        Pipeline {
            _tmp: tmp,
            paths,
            db,
            encoder,
            processor,
        }
    }

    /// Writes `count` tiny PNG frames two seconds apart starting at the
    /// given local time of day.
    fn write_frames(
        paths: &DataPaths,
        date: &str,
        start_hms: (u32, u32, u32),
        count: usize,
        width: u32,
        height: u32,
        app: &str,
    ) {
        let store = FrameStore::new(paths.frames_root());
        let day = store.prepare_day_dir(date).unwrap();

        let naive_date = NaiveDate::parse_from_str(date, "%Y%m%d").unwrap();
        let base = naive_date
            .and_hms_opt(start_hms.0, start_hms.1, start_hms.2)
            .unwrap();

        let image = RgbaImage::from_pixel(width, height, image::Rgba([40, 40, 40, 255]));
        for i in 0..count {
            let at = base + chrono::Duration::seconds(i as i64 * 2);
            let name = format!("{}-{i:08x}-{app}", at.format("%Y%m%d-%H%M%S"));
            image
                .save_with_format(day.join(&name), ImageFormat::Png)
                .unwrap();
        }
    }

    fn targeted(date: &str) -> ProcessOptions {
        ProcessOptions {
            date: Some(date.to_string()),
        }
    }

    #[tokio::test]
    async fn full_day_becomes_three_segments() {
        let p = pipeline();
        write_frames(&p.paths, "20250207", (10, 0, 0), 450, 16, 9, "com.example.app");

        let status = p.processor.run(&targeted("20250207")).await.unwrap();
        assert_eq!(status, RunStatus::AllSucceeded);

        let segments = p.db.segments_for_date("2025-02-07").await.unwrap();
        let counts: Vec<u32> = segments.iter().map(|s| s.frame_count).collect();
        assert_eq!(counts, vec![150, 150, 150]);

        for segment in &segments {
            assert!(Path::new(&segment.video_path).is_file());
            assert_eq!(segment.width, Some(16));
            assert_eq!(segment.height, Some(9));
            assert_eq!(segment.fps, Some(30.0));
        }

        // Segments tile the day without overlap
        assert!(segments[0].end_ts < segments[1].start_ts);
        assert!(segments[1].end_ts < segments[2].start_ts);
    }

    #[tokio::test]
    async fn resolution_change_closes_the_open_group() {
        let p = pipeline();
        write_frames(&p.paths, "20250207", (10, 0, 0), 100, 16, 9, "com.example.app");
        write_frames(&p.paths, "20250207", (11, 0, 0), 200, 25, 14, "com.example.app");

        let status = p.processor.run(&targeted("20250207")).await.unwrap();
        assert_eq!(status, RunStatus::AllSucceeded);

        let segments = p.db.segments_for_date("2025-02-07").await.unwrap();
        let shapes: Vec<(u32, Option<u32>)> = segments
            .iter()
            .map(|s| (s.frame_count, s.width))
            .collect();
        assert_eq!(
            shapes,
            vec![(100, Some(16)), (150, Some(25)), (50, Some(25))]
        );
    }

    #[tokio::test]
    async fn long_capture_pause_splits_segments() {
        let p = pipeline();
        // 100 frames, a 90 second hole, then 100 more
        write_frames(&p.paths, "20250207", (10, 0, 0), 100, 16, 9, "com.example.app");
        write_frames(&p.paths, "20250207", (10, 4, 48), 100, 16, 9, "com.example.app");

        p.processor.run(&targeted("20250207")).await.unwrap();

        let segments = p.db.segments_for_date("2025-02-07").await.unwrap();
        let counts: Vec<u32> = segments.iter().map(|s| s.frame_count).collect();
        assert_eq!(counts, vec![100, 100]);
    }

    #[tokio::test]
    async fn rerun_reprocesses_nothing() {
        let p = pipeline();
        write_frames(&p.paths, "20250207", (10, 0, 0), 200, 16, 9, "com.example.app");

        p.processor.run(&targeted("20250207")).await.unwrap();
        let first_pass = p.db.segments_for_date("2025-02-07").await.unwrap();
        let attempts_after_first = p.encoder.attempts.load(Ordering::SeqCst);

        let status = p.processor.run(&targeted("20250207")).await.unwrap();
        assert_eq!(status, RunStatus::AllSucceeded);

        let second_pass = p.db.segments_for_date("2025-02-07").await.unwrap();
        assert_eq!(first_pass, second_pass);
        assert_eq!(p.encoder.attempts.load(Ordering::SeqCst), attempts_after_first);
    }

    #[tokio::test]
    async fn new_frames_after_a_run_extend_the_day() {
        let p = pipeline();
        write_frames(&p.paths, "20250207", (10, 0, 0), 50, 16, 9, "com.example.app");
        p.processor.run(&targeted("20250207")).await.unwrap();

        write_frames(&p.paths, "20250207", (12, 0, 0), 30, 16, 9, "com.example.app");
        p.processor.run(&targeted("20250207")).await.unwrap();

        let segments = p.db.segments_for_date("2025-02-07").await.unwrap();
        let counts: Vec<u32> = segments.iter().map(|s| s.frame_count).collect();
        assert_eq!(counts, vec![50, 30]);
    }

    #[tokio::test]
    async fn failed_group_spares_the_rest_of_the_run() {
        let p = pipeline();
        write_frames(&p.paths, "20250206", (10, 0, 0), 20, 16, 9, "com.example.app");
        write_frames(&p.paths, "20250207", (10, 0, 0), 20, 16, 9, "com.poison.app");
        write_frames(&p.paths, "20250208", (10, 0, 0), 20, 16, 9, "com.example.app");

        let status = p.processor.run(&ProcessOptions::default()).await.unwrap();
        assert_eq!(status, RunStatus::PartialFailure);
        assert_eq!(status.exit_code(), 2);

        assert_eq!(p.db.segments_for_date("2025-02-06").await.unwrap().len(), 1);
        assert!(p.db.segments_for_date("2025-02-07").await.unwrap().is_empty());
        assert_eq!(p.db.segments_for_date("2025-02-08").await.unwrap().len(), 1);

        // The poisoned day's frames are untouched and wait for a fix
        let store = FrameStore::new(p.paths.frames_root());
        assert_eq!(store.scan_day_raw("20250207").unwrap().len(), 20);
    }

    #[tokio::test]
    async fn failed_encode_is_not_retried() {
        let p = pipeline();
        write_frames(&p.paths, "20250207", (10, 0, 0), 10, 16, 9, "com.poison.app");

        let status = p.processor.run(&targeted("20250207")).await.unwrap();
        assert_eq!(status, RunStatus::NoneSucceeded);
        assert_eq!(status.exit_code(), 1);
        assert_eq!(p.encoder.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_commit_drops_the_video_file() {
        let p = pipeline();
        write_frames(&p.paths, "20250207", (10, 0, 0), 10, 16, 9, "com.hugefile.app");

        let status = p.processor.run(&targeted("20250207")).await.unwrap();
        assert_eq!(status, RunStatus::NoneSucceeded);

        // No row, and the unindexed video did not survive either
        assert!(p.db.segments_for_date("2025-02-07").await.unwrap().is_empty());
        let chunk_day = p.paths.segments_root().join("202502").join("07");
        let leftovers = std::fs::read_dir(&chunk_day).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn app_switches_index_into_intervals() {
        let p = pipeline();
        write_frames(&p.paths, "20250207", (10, 0, 0), 10, 16, 9, "com.apple.Safari");
        write_frames(&p.paths, "20250207", (10, 1, 0), 10, 16, 9, "com.apple.Terminal");

        p.processor.run(&targeted("20250207")).await.unwrap();

        let apps: Vec<Option<String>> = p
            .db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT app_id FROM appsegments ORDER BY start_ts ASC")?;
                let mut rows = stmt.query([])?;
                let mut apps = Vec::new();
                while let Some(row) = rows.next()? {
                    apps.push(row.get(0)?);
                }
                Ok(apps)
            })
            .await
            .unwrap();

        assert_eq!(
            apps,
            vec![
                Some("com.apple.Safari".to_string()),
                Some("com.apple.Terminal".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn targeted_run_does_not_delete_anything() {
        let p = pipeline_with_config(AppConfig {
            temp_retention_policy: RetentionPolicy::OneDay,
            recording_retention_policy: RetentionPolicy::OneDay,
            ..AppConfig::default()
        });

        // Ancient covered frame and its segment row, both way past policy
        let store = FrameStore::new(p.paths.frames_root());
        let day = store.prepare_day_dir("20200101").unwrap();
        let old_frame = day.join("20200101-100000-aaaaaaaa-com.app");
        std::fs::write(&old_frame, b"old").unwrap();
        let old_ts = naming::parse_timestamp("20200101-100000-aaaaaaaa-com.app").unwrap();
        let old_video = p.paths.segments_root().join("202001/01/old.mp4");
        std::fs::create_dir_all(old_video.parent().unwrap()).unwrap();
        std::fs::write(&old_video, b"old video").unwrap();
        p.db.upsert_segment(&SegmentRecord {
            id: "old".to_string(),
            date: "2020-01-01".to_string(),
            start_ts: old_ts - 5.0,
            end_ts: old_ts + 5.0,
            frame_count: 5,
            fps: Some(30.0),
            width: Some(16),
            height: Some(9),
            file_size_bytes: 9,
            video_path: old_video.to_string_lossy().into_owned(),
        })
        .await
        .unwrap();

        write_frames(&p.paths, "20250207", (10, 0, 0), 10, 16, 9, "com.example.app");
        p.processor.run(&targeted("20250207")).await.unwrap();

        assert!(old_frame.exists());
        assert!(old_video.exists());
        assert_eq!(p.db.segments_for_date("2020-01-01").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scheduled_run_applies_retention() {
        let p = pipeline_with_config(AppConfig {
            temp_retention_policy: RetentionPolicy::OneDay,
            recording_retention_policy: RetentionPolicy::Never,
            ..AppConfig::default()
        });

        // An old day processes and then its frames, now covered, age out
        write_frames(&p.paths, "20200101", (10, 0, 0), 10, 16, 9, "com.example.app");

        let status = p.processor.run(&ProcessOptions::default()).await.unwrap();
        assert_eq!(status, RunStatus::AllSucceeded);

        assert_eq!(p.db.segments_for_date("2020-01-01").await.unwrap().len(), 1);
        let store = FrameStore::new(p.paths.frames_root());
        assert!(store.scan_day_raw("20200101").unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_run_drops_orphan_rows_first() {
        let p = pipeline();
        p.db.upsert_segment(&SegmentRecord {
            id: "ghost".to_string(),
            date: "2025-01-01".to_string(),
            start_ts: 100.0,
            end_ts: 200.0,
            frame_count: 10,
            fps: Some(30.0),
            width: Some(16),
            height: Some(9),
            file_size_bytes: 10,
            video_path: "/nowhere/ghost.mp4".to_string(),
        })
        .await
        .unwrap();

        let status = p.processor.run(&ProcessOptions::default()).await.unwrap();
        assert_eq!(status, RunStatus::AllSucceeded);
        assert!(p.db.all_segments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_target_date() {
        let p = pipeline();
        assert!(p.processor.run(&targeted("2025-02-07")).await.is_err());
        assert!(p.processor.run(&targeted("tomorrow")).await.is_err());
    }

    #[test]
    fn status_aggregation_covers_all_outcomes() {
        assert_eq!(aggregate_status(0, 0), RunStatus::AllSucceeded);
        assert_eq!(aggregate_status(3, 0), RunStatus::AllSucceeded);
        assert_eq!(aggregate_status(2, 1), RunStatus::PartialFailure);
        assert_eq!(aggregate_status(0, 2), RunStatus::NoneSucceeded);
    }
}
