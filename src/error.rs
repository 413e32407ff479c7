//! Centralized error types for mboxsync.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mboxsync library.
#[derive(Error, Debug)]
pub enum MboxError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified file does not exist.
    #[error("MBOX file not found: {0}")]
    FileNotFound(PathBuf),

    /// The file does not appear to be a valid MBOX.
    #[error("File does not appear to be a valid MBOX: {0}")]
    InvalidMbox(PathBuf),

    /// The index file is corrupt or was built with an incompatible version.
    #[error("Corrupt or incompatible index for '{path}': {reason}")]
    InvalidIndex { path: PathBuf, reason: String },

    /// A record boundary (`From ` line) was not where it was expected.
    #[error("Record boundary error at offset {offset}: {reason}")]
    Boundary { offset: u64, reason: String },

    /// The space ledger reached a state that should be impossible.
    #[error("Space accounting error: {0}")]
    SpaceAccounting(String),

    /// UID validity changed or UIDs were reused; the index was marked corrupted.
    #[error("Mailbox identity corrupted in '{path}': {reason}")]
    IdentityCorruption { path: PathBuf, reason: String },

    /// No UIDs left to assign.
    #[error("Out of UIDs in '{0}', the mailbox needs renumbering")]
    IdentifierExhaustion(PathBuf),

    /// The advisory lock could not be acquired or released.
    #[error("Lock error on '{path}': {reason}")]
    Lock { path: PathBuf, reason: String },

    /// The disk filled up while growing the file.
    #[error("Out of disk space while growing '{0}'")]
    OutOfSpace(PathBuf),

    /// The X-IMAPbase last-UID field no longer holds what was last written there.
    #[error("X-IMAPbase last-UID field at offset {offset} changed unexpectedly")]
    UidLastMismatch { offset: u64 },

    /// A queued sync record or UID set could not be understood.
    #[error("Invalid sync request: {0}")]
    InvalidSyncRecord(String),

    /// The sync kept failing after the bounded number of attempts.
    #[error("Sync of '{path}' gave up after {attempts} attempts")]
    RetryLimit { path: PathBuf, attempts: u32 },
}

/// Convenience alias for `Result<T, MboxError>`.
pub type Result<T> = std::result::Result<T, MboxError>;

impl MboxError {
    /// Create an `Io` variant from a path and an `io::Error`.
    ///
    /// A full disk is reported as [`MboxError::OutOfSpace`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::StorageFull {
            return Self::OutOfSpace(path);
        }
        Self::Io { path, source }
    }

    /// Whether another pass (a full rescan or a renumbering) may succeed
    /// where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Boundary { .. } | Self::UidLastMismatch { .. } | Self::IdentifierExhaustion(_)
        )
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `MboxError::io`).
impl From<std::io::Error> for MboxError {
    fn from(source: std::io::Error) -> Self {
        Self::io(PathBuf::from("<unknown>"), source)
    }
}
