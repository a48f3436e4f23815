//! Retention: reclaims disk space from frames, recordings, and leftovers.
//!
//! Deletion never races the index into an inconsistent state. A raw frame
//! is deleted only once a segment covers its timestamp, so unprocessed
//! capture survives any cleanup schedule. A recording's video file goes
//! before its database row, so a crash between the two leaves an orphaned
//! row (harmless, cleaned later) rather than a row pointing at nothing the
//! viewer would trip over.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};

use crate::config::RetentionPolicy;
use crate::db::Database;
use crate::frames::{naming, FrameStore};
use crate::paths::DataPaths;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// A `.part` file this old can no longer belong to a live encode, which
/// gives up after five minutes.
pub const STALE_PART_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub frame_policy: RetentionPolicy,
    pub recording_policy: RetentionPolicy,
    pub orphaned: bool,
    pub vacuum: bool,
    pub dry_run: bool,
}

/// What one cleanup pass did (or, under dry run, would have done).
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub frames_deleted: usize,
    /// Old frames held back because no segment covers them yet.
    pub frames_kept_uncovered: usize,
    pub frame_bytes_freed: u64,
    pub segments_deleted: usize,
    pub segment_bytes_freed: u64,
    pub intervals_deleted: usize,
    pub orphan_rows_deleted: usize,
    pub stale_parts_deleted: usize,
    pub errors: usize,
}

impl CleanupReport {
    pub fn bytes_freed(&self) -> u64 {
        self.frame_bytes_freed + self.segment_bytes_freed
    }
}

pub struct RetentionEngine {
    db: Database,
    paths: DataPaths,
}

impl RetentionEngine {
    pub fn new(db: Database, paths: DataPaths) -> Self {
        RetentionEngine { db, paths }
    }

    /// Runs one full cleanup pass. Individual files and rows fail softly
    /// (logged and counted); only listing the work, which nothing else can
    /// proceed without, aborts the pass.
    pub async fn run(
        &self,
        options: &CleanupOptions,
        now: DateTime<Local>,
    ) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        self.cleanup_frames(options.frame_policy, now, options.dry_run, &mut report)
            .await?;
        self.cleanup_recordings(options.recording_policy, now, options.dry_run, &mut report)
            .await?;

        if options.orphaned {
            self.cleanup_orphans(options.dry_run, &mut report).await?;
            self.sweep_stale_parts(STALE_PART_MAX_AGE, options.dry_run, &mut report);
        }

        if options.vacuum && !options.dry_run {
            self.db.vacuum().await?;
            log_info!("Database vacuumed");
        }

        Ok(report)
    }

    /// Deletes raw frames older than the policy cutoff, but only those
    /// whose timestamp falls inside an indexed segment. Uncovered old
    /// frames are counted and kept for a later pass.
    async fn cleanup_frames(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Local>,
        dry_run: bool,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let Some(cutoff_ts) = cutoff_ts(policy, now) else {
            return Ok(());
        };

        let store = FrameStore::new(self.paths.frames_root());
        for date in store.list_dates()? {
            let ranges = self
                .db
                .segment_ranges_for_date(&naming::dashed_date(&date))
                .await?;

            let files = match store.scan_day_raw(&date) {
                Ok(files) => files,
                Err(err) => {
                    log_warn!("Skipping frame cleanup for {date}: {err:#}");
                    report.errors += 1;
                    continue;
                }
            };

            for file in files {
                if file.ts >= cutoff_ts {
                    continue;
                }
                if !covers(&ranges, file.ts) {
                    report.frames_kept_uncovered += 1;
                    continue;
                }

                if dry_run {
                    report.frames_deleted += 1;
                    report.frame_bytes_freed += file.file_size_bytes;
                    continue;
                }

                match std::fs::remove_file(&file.path) {
                    Ok(()) => {
                        report.frames_deleted += 1;
                        report.frame_bytes_freed += file.file_size_bytes;
                    }
                    Err(err) => {
                        log_warn!("Failed to delete frame {}: {err}", file.path.display());
                        report.errors += 1;
                    }
                }
            }
        }

        if !dry_run {
            prune_empty_day_dirs(store.root());
        }
        Ok(())
    }

    /// Deletes recordings older than the policy cutoff, file first and row
    /// second, then drops app intervals that ended before the cutoff.
    async fn cleanup_recordings(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Local>,
        dry_run: bool,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let Some(cutoff_ts) = cutoff_ts(policy, now) else {
            return Ok(());
        };

        for segment in self.db.segments_older_than(cutoff_ts).await? {
            if dry_run {
                report.segments_deleted += 1;
                report.segment_bytes_freed += segment.file_size_bytes;
                continue;
            }

            let video_path = self.resolve_video_path(&segment.video_path);
            match std::fs::remove_file(&video_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    // Keep the row; a row without a file is recoverable,
                    // the reverse is invisible to every later pass
                    log_warn!(
                        "Failed to delete video {}, keeping its row: {err}",
                        video_path.display()
                    );
                    report.errors += 1;
                    continue;
                }
            }

            match self.db.delete_segment(&segment.id).await {
                Ok(()) => {
                    report.segments_deleted += 1;
                    report.segment_bytes_freed += segment.file_size_bytes;
                }
                Err(err) => {
                    log_warn!("Failed to delete segment row {}: {err:#}", segment.id);
                    report.errors += 1;
                }
            }
        }

        if dry_run {
            report.intervals_deleted = self.db.count_app_intervals_before(cutoff_ts).await?;
        } else {
            report.intervals_deleted = self.db.delete_app_intervals_before(cutoff_ts).await?;
            prune_empty_day_dirs(&self.paths.segments_root());
        }
        Ok(())
    }

    /// Drops segment rows whose video file no longer exists.
    pub async fn cleanup_orphans(&self, dry_run: bool, report: &mut CleanupReport) -> Result<()> {
        for segment in self.db.all_segments().await? {
            if self.resolve_video_path(&segment.video_path).is_file() {
                continue;
            }

            if dry_run {
                report.orphan_rows_deleted += 1;
                continue;
            }

            match self.db.delete_segment(&segment.id).await {
                Ok(()) => {
                    log_info!(
                        "Removed orphaned row {} ({} is gone)",
                        segment.id,
                        segment.video_path
                    );
                    report.orphan_rows_deleted += 1;
                }
                Err(err) => {
                    log_warn!("Failed to delete orphaned row {}: {err:#}", segment.id);
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Removes `.part` files left behind by interrupted encodes once they
    /// are old enough that no live encode can still own them.
    pub fn sweep_stale_parts(
        &self,
        max_age: Duration,
        dry_run: bool,
        report: &mut CleanupReport,
    ) {
        for part in find_part_files(&self.paths.segments_root()) {
            let stale = std::fs::metadata(&part)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if !stale {
                continue;
            }

            if dry_run {
                report.stale_parts_deleted += 1;
                continue;
            }

            match std::fs::remove_file(&part) {
                Ok(()) => {
                    log_info!("Removed stale encode leftover {}", part.display());
                    report.stale_parts_deleted += 1;
                }
                Err(err) => {
                    log_warn!("Failed to remove {}: {err}", part.display());
                    report.errors += 1;
                }
            }
        }
    }

    /// Rows written by current builds hold absolute paths; relative paths
    /// from older data resolve against the data root.
    fn resolve_video_path(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.data_root().join(path)
        }
    }
}

fn cutoff_ts(policy: RetentionPolicy, now: DateTime<Local>) -> Option<f64> {
    policy.max_age().map(|age| (now - age).timestamp() as f64)
}

fn covers(ranges: &[(f64, f64)], ts: f64) -> bool {
    ranges.iter().any(|(start, end)| ts >= *start && ts <= *end)
}

fn find_part_files(root: &Path) -> Vec<PathBuf> {
    let mut parts = Vec::new();
    let Ok(months) = std::fs::read_dir(root) else {
        return parts;
    };
    for month in months.flatten() {
        let Ok(days) = std::fs::read_dir(month.path()) else {
            continue;
        };
        for day in days.flatten() {
            let Ok(files) = std::fs::read_dir(day.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().is_some_and(|ext| ext == "part") {
                    parts.push(path);
                }
            }
        }
    }
    parts
}

/// Removes day directories emptied by cleanup, then month directories
/// emptied in turn. `remove_dir` refuses non-empty directories, so a race
/// with a concurrent writer loses harmlessly.
fn prune_empty_day_dirs(root: &Path) {
    let Ok(months) = std::fs::read_dir(root) else {
        return;
    };
    for month in months.flatten() {
        if !month.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Ok(days) = std::fs::read_dir(month.path()) {
            for day in days.flatten() {
                if day.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    let _ = std::fs::remove_dir(day.path());
                }
            }
        }
        let _ = std::fs::remove_dir(month.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AppIntervalRecord, SegmentRecord};
    use chrono::TimeZone;

    fn test_paths(tmp: &tempfile::TempDir) -> DataPaths {
        let paths = DataPaths::from_base(tmp.path().to_path_buf());
        paths.ensure_data_directories().unwrap();
        paths
    }

    fn segment_row(id: &str, date: &str, start_ts: f64, end_ts: f64, video_path: &str) -> SegmentRecord {
        SegmentRecord {
            id: id.to_string(),
            date: date.to_string(),
            start_ts,
            end_ts,
            frame_count: 10,
            fps: Some(30.0),
            width: Some(1920),
            height: Some(1080),
            file_size_bytes: 2048,
            video_path: video_path.to_string(),
        }
    }

    fn options(frame_policy: RetentionPolicy, recording_policy: RetentionPolicy) -> CleanupOptions {
        CleanupOptions {
            frame_policy,
            recording_policy,
            orphaned: false,
            vacuum: false,
            dry_run: false,
        }
    }

    fn long_ago() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn old_frames_go_only_when_covered() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let db = Database::new(paths.database_path()).unwrap();

        let store = FrameStore::new(paths.frames_root());
        let day = store.prepare_day_dir("20240101").unwrap();
        let covered = day.join("20240101-120000-aaaaaaaa-com.app");
        let uncovered = day.join("20240101-130000-bbbbbbbb-com.app");
        std::fs::write(&covered, vec![0u8; 64]).unwrap();
        std::fs::write(&uncovered, vec![0u8; 64]).unwrap();

        let covered_ts = naming::parse_timestamp("20240101-120000-aaaaaaaa-com.app").unwrap();
        db.upsert_segment(&segment_row(
            "s1",
            "2024-01-01",
            covered_ts - 10.0,
            covered_ts + 10.0,
            "/nowhere/s1.mp4",
        ))
        .await
        .unwrap();

        let engine = RetentionEngine::new(db, paths);
        let report = engine
            .run(
                &options(RetentionPolicy::OneDay, RetentionPolicy::Never),
                long_ago(),
            )
            .await
            .unwrap();

        assert!(!covered.exists());
        assert!(uncovered.exists());
        assert_eq!(report.frames_deleted, 1);
        assert_eq!(report.frames_kept_uncovered, 1);
        assert_eq!(report.frame_bytes_freed, 64);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn recent_frames_survive_even_when_covered() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let db = Database::new(paths.database_path()).unwrap();

        let store = FrameStore::new(paths.frames_root());
        let day = store.prepare_day_dir("20240531").unwrap();
        let recent = day.join("20240531-235950-cccccccc-com.app");
        std::fs::write(&recent, vec![0u8; 64]).unwrap();

        let ts = naming::parse_timestamp("20240531-235950-cccccccc-com.app").unwrap();
        db.upsert_segment(&segment_row(
            "s1",
            "2024-05-31",
            ts - 5.0,
            ts + 5.0,
            "/nowhere/s1.mp4",
        ))
        .await
        .unwrap();

        let engine = RetentionEngine::new(db, paths);
        let report = engine
            .run(
                &options(RetentionPolicy::OneDay, RetentionPolicy::Never),
                long_ago(),
            )
            .await
            .unwrap();

        assert!(recent.exists());
        assert_eq!(report.frames_deleted, 0);
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let db = Database::new(paths.database_path()).unwrap();

        let store = FrameStore::new(paths.frames_root());
        let day = store.prepare_day_dir("20240101").unwrap();
        let frame = day.join("20240101-120000-aaaaaaaa-com.app");
        std::fs::write(&frame, vec![0u8; 32]).unwrap();

        let ts = naming::parse_timestamp("20240101-120000-aaaaaaaa-com.app").unwrap();
        let video = paths.segments_root().join("202401/01/s1.mp4");
        std::fs::create_dir_all(video.parent().unwrap()).unwrap();
        std::fs::write(&video, vec![0u8; 16]).unwrap();
        db.commit_group(
            &segment_row(
                "s1",
                "2024-01-01",
                ts - 10.0,
                ts + 10.0,
                video.to_str().unwrap(),
            ),
            &[AppIntervalRecord {
                id: "i1".to_string(),
                app_id: Some("com.app".to_string()),
                date: "2024-01-01".to_string(),
                start_ts: ts - 10.0,
                end_ts: ts + 10.0,
            }],
        )
        .await
        .unwrap();

        let engine = RetentionEngine::new(db.clone(), paths);
        let mut opts = options(RetentionPolicy::OneDay, RetentionPolicy::OneDay);
        opts.dry_run = true;
        let report = engine.run(&opts, long_ago()).await.unwrap();

        assert!(frame.exists());
        assert!(video.exists());
        assert_eq!(db.all_segments().await.unwrap().len(), 1);
        assert_eq!(report.frames_deleted, 1);
        assert_eq!(report.segments_deleted, 1);
        assert_eq!(report.intervals_deleted, 1);
    }

    #[tokio::test]
    async fn recording_cleanup_removes_file_then_row() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let db = Database::new(paths.database_path()).unwrap();

        let video = paths.segments_root().join("202401/01/s1.mp4");
        std::fs::create_dir_all(video.parent().unwrap()).unwrap();
        std::fs::write(&video, vec![0u8; 128]).unwrap();

        let ts = naming::parse_timestamp("20240101-120000-aaaaaaaa-com.app").unwrap();
        db.commit_group(
            &segment_row(
                "s1",
                "2024-01-01",
                ts,
                ts + 20.0,
                video.to_str().unwrap(),
            ),
            &[
                AppIntervalRecord {
                    id: "i-old".to_string(),
                    app_id: Some("com.app".to_string()),
                    date: "2024-01-01".to_string(),
                    start_ts: ts,
                    end_ts: ts + 20.0,
                },
                AppIntervalRecord {
                    id: "i-new".to_string(),
                    app_id: Some("com.app".to_string()),
                    date: "2024-05-31".to_string(),
                    start_ts: 1e12,
                    end_ts: 1e12 + 20.0,
                },
            ],
        )
        .await
        .unwrap();

        let engine = RetentionEngine::new(db.clone(), paths);
        let report = engine
            .run(
                &options(RetentionPolicy::Never, RetentionPolicy::OneDay),
                long_ago(),
            )
            .await
            .unwrap();

        assert!(!video.exists());
        assert!(!video.parent().unwrap().exists(), "empty day dir pruned");
        assert!(db.all_segments().await.unwrap().is_empty());
        assert_eq!(report.segments_deleted, 1);
        assert_eq!(report.segment_bytes_freed, 2048);
        assert_eq!(report.intervals_deleted, 1);
    }

    #[tokio::test]
    async fn undeletable_video_keeps_its_row() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let db = Database::new(paths.database_path()).unwrap();

        // A directory where the video should be makes remove_file fail
        // without depending on permission handling
        let video = paths.segments_root().join("202401/01/s1.mp4");
        std::fs::create_dir_all(&video).unwrap();

        let ts = naming::parse_timestamp("20240101-120000-aaaaaaaa-com.app").unwrap();
        db.upsert_segment(&segment_row(
            "s1",
            "2024-01-01",
            ts,
            ts + 20.0,
            video.to_str().unwrap(),
        ))
        .await
        .unwrap();

        let engine = RetentionEngine::new(db.clone(), paths);
        let report = engine
            .run(
                &options(RetentionPolicy::Never, RetentionPolicy::OneDay),
                long_ago(),
            )
            .await
            .unwrap();

        assert_eq!(db.all_segments().await.unwrap().len(), 1);
        assert_eq!(report.segments_deleted, 0);
        assert_eq!(report.errors, 1);
    }

    #[tokio::test]
    async fn orphaned_rows_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let db = Database::new(paths.database_path()).unwrap();

        let present = paths.segments_root().join("202401/01/here.mp4");
        std::fs::create_dir_all(present.parent().unwrap()).unwrap();
        std::fs::write(&present, vec![0u8; 8]).unwrap();

        db.upsert_segment(&segment_row(
            "here",
            "2024-01-01",
            100.0,
            200.0,
            present.to_str().unwrap(),
        ))
        .await
        .unwrap();
        db.upsert_segment(&segment_row(
            "gone",
            "2024-01-01",
            300.0,
            400.0,
            "/nowhere/gone.mp4",
        ))
        .await
        .unwrap();

        let engine = RetentionEngine::new(db.clone(), paths);
        let mut report = CleanupReport::default();
        engine.cleanup_orphans(false, &mut report).await.unwrap();

        let remaining = db.all_segments().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "here");
        assert_eq!(report.orphan_rows_deleted, 1);
    }

    #[tokio::test]
    async fn part_sweep_honors_age_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let db = Database::new(paths.database_path()).unwrap();

        let day = paths.segments_root().join("202401/01");
        std::fs::create_dir_all(&day).unwrap();
        let part = day.join("s1.mp4.part");
        std::fs::write(&part, vec![0u8; 8]).unwrap();

        let engine = RetentionEngine::new(db, paths);

        let mut report = CleanupReport::default();
        engine.sweep_stale_parts(STALE_PART_MAX_AGE, false, &mut report);
        assert!(part.exists(), "fresh part must survive");
        assert_eq!(report.stale_parts_deleted, 0);

        engine.sweep_stale_parts(Duration::ZERO, false, &mut report);
        assert!(!part.exists());
        assert_eq!(report.stale_parts_deleted, 1);
    }
}
