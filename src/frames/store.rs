//! On-disk store for raw captured frames.
//!
//! Frames live under `temp/YYYYMM/DD/` as extensionless PNG files named by
//! [`super::naming`]. The store is append-only from the capture side; the
//! processing and retention sides only ever read and delete.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::ImageReader;

use crate::log_warn;
use crate::paths::{self, DataPaths};

const ENABLE_LOGS: bool = true;

/// A frame that parsed and probed cleanly, ready for segmentation.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub path: PathBuf,
    /// Capture time in epoch seconds, whole-second precision.
    pub ts: f64,
    /// Frontmost app at capture time, when the filename recorded one.
    pub app_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub file_size_bytes: u64,
}

/// A frame file as seen by retention: named like a frame but never decoded,
/// so broken files stay reclaimable.
#[derive(Debug, Clone)]
pub struct RawFrameFile {
    pub path: PathBuf,
    pub ts: f64,
    pub file_size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FrameStore {
    root: PathBuf,
}

impl FrameStore {
    pub fn new(root: PathBuf) -> Self {
        FrameStore { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn day_dir(&self, date: &str) -> PathBuf {
        DataPaths::day_dir(&self.root, date)
    }

    /// Creates the day directory for a capture, user-only on Unix.
    pub fn prepare_day_dir(&self, date: &str) -> Result<PathBuf> {
        let dir = self.day_dir(date);
        paths::create_private_dir(&dir)
            .with_context(|| format!("failed to create frame directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Promotes a staged `<name>.png` capture to its final extensionless
    /// name in the same directory. The rename is atomic, so scans never see
    /// a half-written frame under a final name.
    pub fn finalize_frame(&self, staged: &Path) -> Result<PathBuf> {
        let stem = staged
            .file_stem()
            .with_context(|| format!("staged frame has no file name: {}", staged.display()))?;
        let dest = match staged.parent() {
            Some(parent) => parent.join(stem),
            None => PathBuf::from(stem),
        };

        paths::restrict_file_permissions(staged).with_context(|| {
            format!("failed to restrict permissions on {}", staged.display())
        })?;
        std::fs::rename(staged, &dest).with_context(|| {
            format!(
                "failed to finalize frame {} -> {}",
                staged.display(),
                dest.display()
            )
        })?;
        Ok(dest)
    }

    /// Lists every date (YYYYMMDD) that has a day directory, ascending.
    pub fn list_dates(&self) -> Result<Vec<String>> {
        let mut dates = Vec::new();
        if !self.root.is_dir() {
            return Ok(dates);
        }

        for month_entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to read frame root {}", self.root.display()))?
        {
            let month_entry = month_entry?;
            let month_name = month_entry.file_name();
            let Some(month) = valid_dir_component(&month_name, 6) else {
                continue;
            };
            if !month_entry.file_type()?.is_dir() {
                continue;
            }

            for day_entry in std::fs::read_dir(month_entry.path())? {
                let day_entry = day_entry?;
                let day_name = day_entry.file_name();
                let Some(day) = valid_dir_component(&day_name, 2) else {
                    continue;
                };
                if day_entry.file_type()?.is_dir() {
                    dates.push(format!("{month}{day}"));
                }
            }
        }

        dates.sort();
        Ok(dates)
    }

    /// Scans one day of frames, probing each file's resolution. Files that
    /// fail to parse or decode are skipped with a warning; a single bad
    /// capture must not block the day. Returns frames ordered by timestamp,
    /// ties broken by filename.
    pub fn scan_day(&self, date: &str) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        for (name, path, size) in self.day_files(date)? {
            let Some(ts) = super::naming::parse_timestamp(&name) else {
                log_warn!("Skipping file with unparseable name: {}", path.display());
                continue;
            };

            let (width, height) = match probe_dimensions(&path) {
                Ok(dims) => dims,
                Err(err) => {
                    log_warn!("Skipping unreadable frame {}: {err:#}", path.display());
                    continue;
                }
            };

            frames.push(Frame {
                app_id: super::naming::parse_app_id(&name),
                path,
                ts,
                width,
                height,
                file_size_bytes: size,
            });
        }

        // day_files is name-ordered, so equal timestamps stay name-ordered
        frames.sort_by(|a, b| a.ts.total_cmp(&b.ts));
        Ok(frames)
    }

    /// Scans one day without decoding anything. Retention works from this
    /// view so that corrupt frames can still be reclaimed.
    pub fn scan_day_raw(&self, date: &str) -> Result<Vec<RawFrameFile>> {
        let mut files = Vec::new();
        for (name, path, size) in self.day_files(date)? {
            let Some(ts) = super::naming::parse_timestamp(&name) else {
                continue;
            };
            files.push(RawFrameFile {
                path,
                ts,
                file_size_bytes: size,
            });
        }
        Ok(files)
    }

    /// Name-sorted regular files of one day directory, hidden files skipped.
    fn day_files(&self, date: &str) -> Result<Vec<(String, PathBuf, u64)>> {
        if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
            bail!("invalid date {date:?}, expected YYYYMMDD");
        }

        let dir = self.day_dir(date);
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read day directory {}", dir.display()))?
        {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }

            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            files.push((name, entry.path(), metadata.len()));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

/// Reads image dimensions from the file header. Frames are extensionless,
/// so the format is sniffed from content rather than the name.
pub fn probe_dimensions(path: &Path) -> Result<(u32, u32)> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("failed to open frame {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to sniff format of {}", path.display()))?;
    reader
        .into_dimensions()
        .with_context(|| format!("failed to read dimensions of {}", path.display()))
}

fn valid_dir_component(name: &std::ffi::OsStr, len: usize) -> Option<&str> {
    let name = name.to_str()?;
    if name.len() == len && name.bytes().all(|b| b.is_ascii_digit()) {
        Some(name)
    } else {
        None
    }
}
