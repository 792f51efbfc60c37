use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from mount orchestration.
#[derive(Debug, Error)]
pub enum MountError {
    /// Invalid mount specification; no command was run.
    #[error("invalid mount configuration: {0}")]
    Config(String),

    /// The mount point could not be prepared.
    #[error("failed to prepare mount point {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The mount command failed.
    #[error("mount failed ({command}): {output}")]
    Mount { command: String, output: String },

    /// The unmount command failed, including the forced retry.
    #[error("unmount failed ({command}): {output}")]
    Unmount { command: String, output: String },
}

pub type Result<T> = std::result::Result<T, MountError>;
