use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;

mod migrations;
pub mod models;

use migrations::run_migrations;
use models::{AppIntervalRecord, SegmentRecord, StoreStats};

/// How long a statement waits on a locked database before failing. The
/// timeline viewer reads the same file, so short lock contention is normal.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

#[derive(Debug)]
struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("value {value} is negative"))
}

fn to_u32(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("value {value} does not fit in u32"))
}

/// Async handle to the metadata store.
///
/// All SQLite work happens on one dedicated worker thread; callers hand it
/// closures and await the result over a oneshot channel. Cloning shares the
/// same worker.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("playback-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(
                            Err(anyhow::Error::new(err).context("failed to open SQLite database")),
                        );
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }
                if let Err(err) = conn.busy_timeout(BUSY_TIMEOUT) {
                    error!("Failed to set busy timeout: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Inserts or replaces one segment row.
    pub async fn upsert_segment(&self, segment: &SegmentRecord) -> Result<()> {
        let record = segment.clone();
        self.execute(move |conn| upsert_segment_stmt(conn, &record)).await
    }

    /// Inserts or replaces a batch of app intervals in one transaction.
    pub async fn upsert_app_intervals(&self, intervals: &[AppIntervalRecord]) -> Result<()> {
        let intervals = intervals.to_vec();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open interval transaction")?;
            for interval in &intervals {
                upsert_interval_stmt(&tx, interval)?;
            }
            tx.commit().context("failed to commit app intervals")?;
            Ok(())
        })
        .await
    }

    /// Commits one segment together with the app intervals it closes, in a
    /// single transaction. Either everything lands or nothing does, so a
    /// crash can never index a segment without its intervals.
    pub async fn commit_group(
        &self,
        segment: &SegmentRecord,
        intervals: &[AppIntervalRecord],
    ) -> Result<()> {
        let segment = segment.clone();
        let intervals = intervals.to_vec();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open group transaction")?;
            upsert_segment_stmt(&tx, &segment)?;
            for interval in &intervals {
                upsert_interval_stmt(&tx, interval)?;
            }
            tx.commit().context("failed to commit segment group")?;
            Ok(())
        })
        .await
    }

    /// Latest end timestamp already indexed for a date, or `None` when the
    /// date has no segments yet. Frames at or before this mark have been
    /// processed.
    pub async fn processed_through(&self, date: &str) -> Result<Option<f64>> {
        let date = date.to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT MAX(end_ts) FROM segments WHERE date = ?1",
                params![date],
                |row| row.get::<_, Option<f64>>(0),
            )
            .with_context(|| "failed to query processed-through mark")
        })
        .await
    }

    pub async fn segments_for_date(&self, date: &str) -> Result<Vec<SegmentRecord>> {
        let date = date.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date, start_ts, end_ts, frame_count, fps, width, height,
                        file_size_bytes, video_path
                 FROM segments
                 WHERE date = ?1
                 ORDER BY start_ts ASC",
            )?;

            let mut rows = stmt.query(params![date])?;
            let mut segments = Vec::new();
            while let Some(row) = rows.next()? {
                segments.push(read_segment(row)?);
            }
            Ok(segments)
        })
        .await
    }

    /// Segments overlapping the timestamp range `[from_ts, to_ts]`, bounds
    /// included, ordered by start.
    pub async fn segments_in_range(&self, from_ts: f64, to_ts: f64) -> Result<Vec<SegmentRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date, start_ts, end_ts, frame_count, fps, width, height,
                        file_size_bytes, video_path
                 FROM segments
                 WHERE start_ts <= ?1 AND end_ts >= ?2
                 ORDER BY start_ts ASC",
            )?;

            let mut rows = stmt.query(params![to_ts, from_ts])?;
            let mut segments = Vec::new();
            while let Some(row) = rows.next()? {
                segments.push(read_segment(row)?);
            }
            Ok(segments)
        })
        .await
    }

    pub async fn all_segments(&self) -> Result<Vec<SegmentRecord>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date, start_ts, end_ts, frame_count, fps, width, height,
                        file_size_bytes, video_path
                 FROM segments
                 ORDER BY start_ts ASC",
            )?;

            let mut rows = stmt.query([])?;
            let mut segments = Vec::new();
            while let Some(row) = rows.next()? {
                segments.push(read_segment(row)?);
            }
            Ok(segments)
        })
        .await
    }

    /// Segments that started before the cutoff, oldest first. Retention
    /// deletes these together with their video files.
    pub async fn segments_older_than(&self, cutoff_ts: f64) -> Result<Vec<SegmentRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date, start_ts, end_ts, frame_count, fps, width, height,
                        file_size_bytes, video_path
                 FROM segments
                 WHERE start_ts < ?1
                 ORDER BY start_ts ASC",
            )?;

            let mut rows = stmt.query(params![cutoff_ts])?;
            let mut segments = Vec::new();
            while let Some(row) = rows.next()? {
                segments.push(read_segment(row)?);
            }
            Ok(segments)
        })
        .await
    }

    /// The `[start_ts, end_ts]` spans indexed for a date. Frame cleanup
    /// checks coverage against these without loading full rows.
    pub async fn segment_ranges_for_date(&self, date: &str) -> Result<Vec<(f64, f64)>> {
        let date = date.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT start_ts, end_ts FROM segments WHERE date = ?1 ORDER BY start_ts ASC",
            )?;

            let mut rows = stmt.query(params![date])?;
            let mut ranges = Vec::new();
            while let Some(row) = rows.next()? {
                ranges.push((row.get(0)?, row.get(1)?));
            }
            Ok(ranges)
        })
        .await
    }

    pub async fn delete_segment(&self, segment_id: &str) -> Result<()> {
        let segment_id = segment_id.to_string();
        self.execute(move |conn| {
            conn.execute("DELETE FROM segments WHERE id = ?1", params![segment_id])
                .with_context(|| "failed to delete segment")?;
            Ok(())
        })
        .await
    }

    /// Deletes app intervals that ended before the cutoff. Returns how many
    /// rows were removed.
    pub async fn delete_app_intervals_before(&self, cutoff_ts: f64) -> Result<usize> {
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM appsegments WHERE end_ts < ?1",
                params![cutoff_ts],
            )
            .with_context(|| "failed to delete old app intervals")
        })
        .await
    }

    /// Counts app intervals that ended before the cutoff without touching
    /// them, for dry-run reporting.
    pub async fn count_app_intervals_before(&self, cutoff_ts: f64) -> Result<usize> {
        self.execute(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM appsegments WHERE end_ts < ?1",
                    params![cutoff_ts],
                    |row| row.get(0),
                )
                .with_context(|| "failed to count old app intervals")?;
            Ok(to_u64(count)? as usize)
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.execute(|conn| {
            let (segment_count, video_bytes, first_date, last_date) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(file_size_bytes), 0), MIN(date), MAX(date)
                     FROM segments",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .with_context(|| "failed to query segment stats")?;

            let interval_count: i64 = conn
                .query_row("SELECT COUNT(*) FROM appsegments", [], |row| row.get(0))
                .with_context(|| "failed to query interval stats")?;

            Ok(StoreStats {
                segment_count: to_u64(segment_count)?,
                interval_count: to_u64(interval_count)?,
                video_bytes: to_u64(video_bytes)?,
                first_date,
                last_date,
            })
        })
        .await
    }

    /// Rebuilds the database file to reclaim space from deleted rows.
    pub async fn vacuum(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute_batch("VACUUM")
                .with_context(|| "failed to vacuum database")?;
            Ok(())
        })
        .await
    }

    pub async fn check_integrity(&self) -> Result<bool> {
        self.execute(|conn| {
            let result: String = conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))
                .with_context(|| "failed to run integrity check")?;
            Ok(result == "ok")
        })
        .await
    }
}

fn upsert_segment_stmt(conn: &Connection, record: &SegmentRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO segments
         (id, date, start_ts, end_ts, frame_count, fps, width, height, file_size_bytes, video_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id,
            record.date,
            record.start_ts,
            record.end_ts,
            i64::from(record.frame_count),
            record.fps,
            record.width.map(i64::from),
            record.height.map(i64::from),
            to_i64(record.file_size_bytes)?,
            record.video_path,
        ],
    )
    .with_context(|| "failed to upsert segment")?;
    Ok(())
}

fn upsert_interval_stmt(conn: &Connection, record: &AppIntervalRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO appsegments
         (id, app_id, date, start_ts, end_ts)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.app_id,
            record.date,
            record.start_ts,
            record.end_ts,
        ],
    )
    .with_context(|| "failed to upsert app interval")?;
    Ok(())
}

fn read_segment(row: &rusqlite::Row<'_>) -> Result<SegmentRecord> {
    Ok(SegmentRecord {
        id: row.get(0)?,
        date: row.get(1)?,
        start_ts: row.get(2)?,
        end_ts: row.get(3)?,
        frame_count: to_u32(row.get::<_, i64>(4)?)?,
        fps: row.get(5)?,
        width: row.get::<_, Option<i64>>(6)?.map(to_u32).transpose()?,
        height: row.get::<_, Option<i64>>(7)?.map(to_u32).transpose()?,
        file_size_bytes: to_u64(row.get::<_, i64>(8)?)?,
        video_path: row.get(9)?,
    })
}
