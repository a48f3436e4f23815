use thiserror::Error;

/// Conditions that must stop the whole process rather than a single item.
///
/// These are carried inside `anyhow::Error` and recovered with
/// `downcast_ref` at the top level, where they map to a dedicated exit
/// code. Everything else in the pipeline is per-item and survivable.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("free disk space {free_bytes}B is below the {min_bytes}B minimum")]
    DiskSpaceLow { free_bytes: u64, min_bytes: u64 },

    #[error("database schema version {found} is newer than this build supports ({supported})")]
    SchemaNewerThanSupported { found: i64, supported: i64 },
}

impl FatalError {
    pub fn is_fatal(err: &anyhow::Error) -> bool {
        err.downcast_ref::<FatalError>().is_some()
    }
}
