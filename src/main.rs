use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use playback::capture::{CaptureLoop, MacScreenSource};
use playback::config::{AppConfig, RetentionPolicy};
use playback::db::Database;
use playback::encoder::{FfmpegEncoder, SegmentEncoder};
use playback::error::FatalError;
use playback::paths::DataPaths;
use playback::processing::{ProcessOptions, Processor};
use playback::retention::{CleanupOptions, CleanupReport, RetentionEngine};
use playback::storage::{format_size, StorageSnapshot};

#[derive(Parser)]
#[command(name = "playback", version, about = "Continuous screen recorder")]
struct Cli {
    /// Base directory for config and data (defaults to the platform
    /// application-support directory).
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture the screen continuously until interrupted.
    Record,
    /// Encode pending frames into video segments and index them.
    Process {
        /// Process exactly this date (YYYYMMDD) and skip retention.
        #[arg(long, value_name = "YYYYMMDD")]
        date: Option<String>,
    },
    /// Reclaim disk space from old frames and recordings.
    Cleanup {
        /// Use the retention policies from config.json.
        #[arg(long)]
        auto: bool,
        /// Retention policy for both frames and recordings.
        #[arg(long, value_parser = parse_policy, value_name = "POLICY")]
        policy: Option<RetentionPolicy>,
        /// Retention policy for raw frames (never, 1_day, 1_week, 1_month).
        #[arg(long, value_parser = parse_policy, value_name = "POLICY")]
        temp_policy: Option<RetentionPolicy>,
        /// Retention policy for encoded recordings.
        #[arg(long, value_parser = parse_policy, value_name = "POLICY")]
        recording_policy: Option<RetentionPolicy>,
        /// Also drop index rows whose video file is gone.
        #[arg(long)]
        orphaned: bool,
        /// Compact the database afterwards.
        #[arg(long)]
        vacuum: bool,
        /// Show what would be deleted without deleting it.
        #[arg(long)]
        dry_run: bool,
        /// Print a detailed report when done.
        #[arg(long)]
        report: bool,
    },
    /// Show what is stored and how much space it takes.
    Status,
}

fn parse_policy(value: &str) -> Result<RetentionPolicy, String> {
    RetentionPolicy::parse(value)
        .ok_or_else(|| format!("invalid policy {value:?}, expected never|1_day|1_week|1_month"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    playback::init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err:#}");
            if FatalError::is_fatal(&err) {
                3
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    paths.ensure_data_directories()?;
    let config = AppConfig::load(&paths.config_path());

    match cli.command {
        Command::Record => {
            let capture = CaptureLoop::new(Arc::new(MacScreenSource), paths, config);

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Interrupt received, stopping capture");
                    signal_cancel.cancel();
                }
            });

            capture.run(cancel).await?;
            Ok(0)
        }

        Command::Process { date } => {
            let db = Database::new(paths.database_path())?;
            let processor = Processor::new(
                db,
                paths,
                config,
                Arc::new(FfmpegEncoder::discover()),
            );
            let status = processor.run(&ProcessOptions { date }).await?;
            Ok(status.exit_code())
        }

        Command::Cleanup {
            auto,
            policy,
            temp_policy,
            recording_policy,
            orphaned,
            vacuum,
            dry_run,
            report,
        } => {
            let frame_policy = temp_policy.or(policy).unwrap_or(if auto {
                config.temp_retention_policy
            } else {
                RetentionPolicy::OneWeek
            });
            let recording_policy = recording_policy.or(policy).unwrap_or(if auto {
                config.recording_retention_policy
            } else {
                RetentionPolicy::Never
            });

            let db = Database::new(paths.database_path())?;
            let engine = RetentionEngine::new(db, paths);
            let options = CleanupOptions {
                frame_policy,
                recording_policy,
                orphaned,
                vacuum,
                dry_run,
            };

            let summary = engine.run(&options, Local::now()).await?;
            if report {
                print_cleanup_report(&options, &summary);
            } else {
                log::info!(
                    "Cleanup done: {} frame(s), {} recording(s), {} freed",
                    summary.frames_deleted,
                    summary.segments_deleted,
                    format_size(summary.bytes_freed())
                );
            }
            Ok(if summary.errors > 0 { 2 } else { 0 })
        }

        Command::Status => {
            let db = Database::new(paths.database_path())?;
            let stats = db.stats().await?;
            let snapshot = StorageSnapshot::collect(&paths);
            let encoder_found = FfmpegEncoder::discover().check_available();
            let index_ok = db.check_integrity().await?;

            println!("data directory: {}", paths.base().display());
            match (&stats.first_date, &stats.last_date) {
                (Some(first), Some(last)) => {
                    println!("recorded dates: {first} .. {last}");
                }
                _ => println!("recorded dates: none"),
            }
            println!("segments:       {}", stats.segment_count);
            println!("app intervals:  {}", stats.interval_count);
            println!("frames on disk: {}", format_size(snapshot.frames_bytes));
            println!("recordings:     {}", format_size(snapshot.segments_bytes));
            println!("database:       {}", format_size(snapshot.database_bytes));
            println!("total:          {}", format_size(snapshot.total_bytes()));
            match snapshot.available_bytes {
                Some(free) => println!("free space:     {}", format_size(free)),
                None => println!("free space:     unknown"),
            }
            println!("ffmpeg:         {}", if encoder_found { "found" } else { "missing" });
            println!("index check:    {}", if index_ok { "ok" } else { "FAILED" });

            Ok(if index_ok { 0 } else { 1 })
        }
    }
}

fn print_cleanup_report(options: &CleanupOptions, summary: &CleanupReport) {
    if options.dry_run {
        println!("dry run, nothing was deleted");
    }
    println!(
        "frames deleted:       {} ({})",
        summary.frames_deleted,
        format_size(summary.frame_bytes_freed)
    );
    println!("frames not yet indexed: {}", summary.frames_kept_uncovered);
    println!(
        "recordings deleted:   {} ({})",
        summary.segments_deleted,
        format_size(summary.segment_bytes_freed)
    );
    println!("app intervals deleted: {}", summary.intervals_deleted);
    if options.orphaned {
        println!("orphaned rows deleted: {}", summary.orphan_rows_deleted);
        println!("stale encodes deleted: {}", summary.stale_parts_deleted);
    }
    println!("errors:               {}", summary.errors);
}
