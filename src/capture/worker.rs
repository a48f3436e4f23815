//! The capture loop: one frame every couple of seconds, forever.
//!
//! Every tick is independent. A failed capture, probe, or rename is logged
//! and the loop moves on to the next tick; only running out of disk stops
//! it, and that error is typed so the process can exit loudly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ExclusionMode};
use crate::frames::store::probe_dimensions;
use crate::frames::{naming, FrameStore};
use crate::paths::DataPaths;
use crate::storage;

use super::ScreenSource;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_info, log_warn};

pub const CAPTURE_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on one tick's work; the probes and the capture each carry
/// their own shorter timeouts, so hitting this means something is stuck.
const TICK_TIMEOUT: Duration = Duration::from_secs(30);

/// Disk space is probed on the first tick and then once every this many.
const DISK_CHECK_INTERVAL_TICKS: u64 = 100;

/// Placeholder resolution for redacted frames before any real capture has
/// established the screen's.
const REDACTED_FRAME_DIMENSIONS: (u32, u32) = (1280, 800);

pub struct CaptureLoop {
    source: Arc<dyn ScreenSource>,
    store: FrameStore,
    paths: DataPaths,
    config: AppConfig,
}

impl CaptureLoop {
    pub fn new(
        source: Arc<dyn ScreenSource>,
        paths: DataPaths,
        config: AppConfig,
    ) -> Self {
        CaptureLoop {
            source,
            store: FrameStore::new(paths.frames_root()),
            paths,
            config,
        }
    }

    /// Runs until cancelled or until disk space drops below the floor.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(CAPTURE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tick_count: u64 = 0;
        let mut last_dimensions: Option<(u32, u32)> = None;

        log_info!(
            "Capture loop started, one frame every {}s",
            CAPTURE_INTERVAL.as_secs()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if tick_count % DISK_CHECK_INTERVAL_TICKS == 0 {
                        storage::ensure_free_space(&self.paths.data_root())?;
                    }
                    tick_count += 1;

                    let tick = self.tick(&mut last_dimensions);
                    if tokio::time::timeout(TICK_TIMEOUT, tick).await.is_err() {
                        log_warn!("capture tick timeout (> {}s)", TICK_TIMEOUT.as_secs());
                    }
                }
                _ = cancel.cancelled() => {
                    log_info!("Capture loop shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// One capture attempt. All failures are local to the tick.
    async fn tick(&self, last_dimensions: &mut Option<(u32, u32)>) {
        if self.paths.viewer_open_signal().exists() {
            log::debug!("Timeline viewer is open, capture paused");
            return;
        }

        if !self.source.is_available().await {
            log::debug!("Screen unavailable, skipping tick");
            return;
        }

        let frontmost = self.source.frontmost_app().await;
        let excluded = frontmost
            .as_deref()
            .is_some_and(|app| self.config.is_app_excluded(app));
        if excluded && self.config.exclusion_mode == ExclusionMode::Skip {
            log::debug!("Frontmost app is excluded, skipping tick");
            return;
        }

        let now = Local::now();
        let date = now.format("%Y%m%d").to_string();
        let day_dir = match self.store.prepare_day_dir(&date) {
            Ok(dir) => dir,
            Err(err) => {
                log_warn!("Cannot prepare frame directory: {err:#}");
                return;
            }
        };

        let name = naming::generate_frame_name(now, frontmost.as_deref());
        let staged = day_dir.join(format!("{name}.png"));

        let write_result = if excluded {
            let dimensions = last_dimensions.unwrap_or(REDACTED_FRAME_DIMENSIONS);
            write_redacted_frame(staged.clone(), dimensions).await
        } else {
            self.source.capture(&staged).await
        };

        if let Err(err) = write_result {
            log_warn!("Capture failed: {err:#}");
            discard_staged(&staged);
            return;
        }

        match self.store.finalize_frame(&staged) {
            Ok(final_path) => {
                if !excluded {
                    if let Ok(dimensions) = probe_dimensions(&final_path) {
                        *last_dimensions = Some(dimensions);
                    }
                }
            }
            Err(err) => {
                log_warn!("Failed to finalize frame: {err:#}");
                discard_staged(&staged);
            }
        }
    }
}

/// Writes an opaque black frame in place of screen content, keeping the
/// timeline continuous while an excluded app is frontmost. The screen is
/// never captured on these ticks, so the content never touches disk.
async fn write_redacted_frame(staged: PathBuf, dimensions: (u32, u32)) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let (width, height) = dimensions;
        let black = image::RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 255]));
        black
            .save_with_format(&staged, image::ImageFormat::Png)
            .with_context(|| format!("failed to write redacted frame {}", staged.display()))
    })
    .await
    .context("redacted frame task panicked")?
}

fn discard_staged(staged: &Path) {
    if let Err(err) = std::fs::remove_file(staged) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log_warn!("Failed to remove staged capture {}: {err}", staged.display());
        }
    }
}
