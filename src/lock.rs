//! Advisory whole-file locking with a timeout.
//!
//! Locks are `flock(2)`-style (via `fs2`) and therefore not reentrant:
//! the caller tracks what it holds, see [`crate::store::file::MboxFile`].

use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{MboxError, Result};

/// Interval between lock attempts while waiting.
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Kind of advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LockKind {
    /// Readers only: probing and read-only syncs.
    Shared,
    /// Required before any byte of the file is modified.
    Exclusive,
}

/// Try to take `kind` on `file` until `timeout` expires.
pub fn acquire(file: &File, path: &Path, kind: LockKind, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        let attempt = match kind {
            LockKind::Shared => fs2::FileExt::try_lock_shared(file),
            LockKind::Exclusive => fs2::FileExt::try_lock_exclusive(file),
        };
        match attempt {
            Ok(()) => {
                debug!(path = %path.display(), ?kind, "Lock acquired");
                return Ok(());
            }
            Err(e) if is_contended(&e) => {
                if started.elapsed() >= timeout {
                    return Err(MboxError::Lock {
                        path: path.to_path_buf(),
                        reason: format!(
                            "timed out after {} ms waiting for {kind:?} lock",
                            timeout.as_millis()
                        ),
                    });
                }
                trace!(path = %path.display(), "Lock busy, waiting");
                std::thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(MboxError::Lock {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Release whatever lock `file` holds.
pub fn release(file: &File, path: &Path) -> Result<()> {
    fs2::FileExt::unlock(file).map_err(|e| MboxError::Lock {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    debug!(path = %path.display(), "Lock released");
    Ok(())
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
