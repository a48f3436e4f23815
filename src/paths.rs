use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable that overrides the base directory. Useful for
/// development runs and for pointing tests at a scratch directory.
pub const DATA_DIR_ENV: &str = "PLAYBACK_DATA_DIR";

const APP_DIR_NAME: &str = "Playback";
const FRAMES_DIR_NAME: &str = "temp";
const SEGMENTS_DIR_NAME: &str = "chunks";
const DATABASE_FILE_NAME: &str = "meta.sqlite3";
const CONFIG_FILE_NAME: &str = "config.json";
const VIEWER_OPEN_SIGNAL_NAME: &str = ".timeline_open";

/// Resolved filesystem layout for one data root.
///
/// ```text
/// <base>/
///   config.json
///   data/
///     temp/YYYYMM/DD/        raw frames
///     chunks/YYYYMM/DD/      encoded segments
///     meta.sqlite3
///     .timeline_open         viewer pause signal
/// ```
#[derive(Debug, Clone)]
pub struct DataPaths {
    base: PathBuf,
}

impl DataPaths {
    /// Resolves the base directory: explicit override, then the
    /// `PLAYBACK_DATA_DIR` environment variable, then the platform data
    /// directory (`~/Library/Application Support/Playback` on macOS).
    pub fn resolve(override_dir: Option<&Path>) -> Result<Self> {
        if let Some(dir) = override_dir {
            return Ok(DataPaths {
                base: dir.to_path_buf(),
            });
        }

        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            return Ok(DataPaths {
                base: PathBuf::from(dir),
            });
        }

        let platform_dir = dirs_next::data_dir()
            .context("could not determine the platform data directory for the current user")?;
        Ok(DataPaths {
            base: platform_dir.join(APP_DIR_NAME),
        })
    }

    pub fn from_base(base: PathBuf) -> Self {
        DataPaths { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn data_root(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn frames_root(&self) -> PathBuf {
        self.data_root().join(FRAMES_DIR_NAME)
    }

    pub fn segments_root(&self) -> PathBuf {
        self.data_root().join(SEGMENTS_DIR_NAME)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_root().join(DATABASE_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join(CONFIG_FILE_NAME)
    }

    pub fn viewer_open_signal(&self) -> PathBuf {
        self.data_root().join(VIEWER_OPEN_SIGNAL_NAME)
    }

    /// Per-day directory under the given root, laid out as `YYYYMM/DD`.
    pub fn day_dir(root: &Path, date: &str) -> PathBuf {
        debug_assert_eq!(date.len(), 8, "date must be YYYYMMDD");
        root.join(&date[..6]).join(&date[6..])
    }

    /// Creates the data directories if missing. Frame and segment data is
    /// screen content, so these directories are made user-only on Unix.
    pub fn ensure_data_directories(&self) -> Result<()> {
        for dir in [self.data_root(), self.frames_root(), self.segments_root()] {
            create_private_dir(&dir)
                .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Creates a directory (and parents) readable only by the current user on
/// Unix. Everything under the data root holds screen content, so every
/// directory we create goes through this.
#[cfg(unix)]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Restricts a file to user-only read/write. Applied to every frame,
/// segment, and database file we write.
#[cfg(unix)]
pub fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
