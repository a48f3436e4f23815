//! Disk space checks and on-disk usage reporting.

use std::path::{Path, PathBuf};

use anyhow::Result;
use sysinfo::Disks;

use crate::error::FatalError;
use crate::paths::DataPaths;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Capture stops outright below this much free space rather than filling
/// the volume with frames nobody can encode.
pub const MIN_FREE_DISK_BYTES: u64 = 1024 * 1024 * 1024;

/// Free bytes on the volume holding `path`, or `None` when no mounted
/// volume matches. Matching is by longest mount-point prefix so `/` does
/// not shadow a dedicated data volume.
pub fn free_disk_bytes(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let mounts = disks
        .list()
        .iter()
        .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()));
    best_mount_match(path, mounts)
}

fn best_mount_match(path: &Path, mounts: impl Iterator<Item = (PathBuf, u64)>) -> Option<u64> {
    mounts
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.as_os_str().len())
        .map(|(_, available)| available)
}

/// Fails with a fatal error when the volume holding `path` is under the
/// free-space floor. An unreadable disk table skips the check; stopping
/// capture on a probe glitch would be worse than one extra frame.
pub fn ensure_free_space(path: &Path) -> Result<()> {
    match free_disk_bytes(path) {
        Some(free_bytes) if free_bytes < MIN_FREE_DISK_BYTES => {
            Err(FatalError::DiskSpaceLow {
                free_bytes,
                min_bytes: MIN_FREE_DISK_BYTES,
            }
            .into())
        }
        Some(_) => Ok(()),
        None => {
            log_warn!(
                "Could not determine free space for {}; skipping disk check",
                path.display()
            );
            Ok(())
        }
    }
}

/// Sizes of the major on-disk stores, for the status report.
#[derive(Debug, Clone, Copy)]
pub struct StorageSnapshot {
    pub frames_bytes: u64,
    pub segments_bytes: u64,
    pub database_bytes: u64,
    pub available_bytes: Option<u64>,
}

impl StorageSnapshot {
    pub fn collect(paths: &DataPaths) -> StorageSnapshot {
        StorageSnapshot {
            frames_bytes: dir_size(&paths.frames_root()),
            segments_bytes: dir_size(&paths.segments_root()),
            database_bytes: file_size(&paths.database_path()),
            available_bytes: free_disk_bytes(&paths.data_root()),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.frames_bytes + self.segments_bytes + self.database_bytes
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Recursive directory size. Unreadable entries count as zero; sizing is
/// informational and must not fail a status call.
pub fn dir_size(path: &Path) -> u64 {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            total += dir_size(&entry.path());
        } else if file_type.is_file() {
            total += file_size(&entry.path());
        }
    }
    total
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
