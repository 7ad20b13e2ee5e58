//! Error types for convofork-core

use thiserror::Error;

/// Main error type for the convofork-core library
///
/// Parse-level problems (malformed lines, orphans, extra roots) are not
/// errors; they are reported as [`crate::ingest::LogWarning`] values.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The conversation log could not be read
    #[error("failed to read log {log}: {message}")]
    LogRead { log: String, message: String },

    /// The backup could not be persisted; the log was not touched
    #[error("backup of branch {branch_id} failed, log left unmodified: {message}")]
    BackupWrite { branch_id: String, message: String },

    /// The mutated log could not be written after the backup succeeded
    #[error("log write failed after backup {backup_id} was saved (recover from it): {message}")]
    MutationIo { backup_id: String, message: String },

    /// Backup not found
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// Action cannot be executed as given
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

impl Error {
    /// Whether a backup was saved before this error occurred.
    ///
    /// Callers use this to decide if the branch is recoverable.
    pub fn backup_saved(&self) -> Option<&str> {
        match self {
            Error::MutationIo { backup_id, .. } => Some(backup_id),
            _ => None,
        }
    }
}

/// Result type alias for convofork-core
pub type Result<T> = std::result::Result<T, Error>;
