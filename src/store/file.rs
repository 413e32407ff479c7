//! The mailbox file: positioned reads and writes, byte moves, size changes,
//! fingerprinting, and lock state.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, trace, warn};

use crate::error::{MboxError, Result};
use crate::lock::{self, LockKind};

/// Chunk size for [`MboxFile::move_bytes`].
const MOVE_CHUNK_SIZE: usize = 256 * 1024;

/// Cheap change detector: file size and modification time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
}

/// An open mailbox file.
///
/// All I/O is positioned (`pread`/`pwrite` style) so readers and writers can
/// share `&self` during a sync pass.
pub struct MboxFile {
    path: PathBuf,
    file: File,
    readonly: bool,
    lock: Option<LockKind>,
}

impl MboxFile {
    /// Open read-write, falling back to read-only when permissions forbid writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Ok(Self {
                path,
                file,
                readonly: false,
                lock: None,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MboxError::FileNotFound(path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "No write access, opening read-only");
                Self::open_readonly(path)
            }
            Err(e) => Err(MboxError::io(&path, e)),
        }
    }

    /// Open without write access.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MboxError::FileNotFound(path.clone())
            } else {
                MboxError::io(&path, e)
            }
        })?;
        Ok(Self {
            path,
            file,
            readonly: true,
            lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Current file size.
    pub fn len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| MboxError::io(&self.path, e))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Size and modification time as they are now.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| MboxError::io(&self.path, e))?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok(Fingerprint {
            size: meta.len(),
            mtime_ns,
        })
    }

    // ── Positioned I/O ──────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        read_at(&self.file, buf, offset).map_err(|e| MboxError::io(&self.path, e))
    }

    /// Fill `buf` completely from `offset`.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(MboxError::io(
                    &self.path,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("short read at offset {}", offset + done as u64),
                    ),
                ));
            }
            done += n;
        }
        Ok(())
    }

    /// Write all of `data` at `offset`.
    pub fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        self.check_writable()?;
        let mut done = 0;
        while done < data.len() {
            let n = write_at(&self.file, &data[done..], offset + done as u64)
                .map_err(|e| MboxError::io(&self.path, e))?;
            if n == 0 {
                return Err(MboxError::io(
                    &self.path,
                    std::io::Error::from(std::io::ErrorKind::WriteZero),
                ));
            }
            done += n;
        }
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dest`; the ranges may overlap.
    ///
    /// Copies front to back when moving towards the start of the file and
    /// back to front otherwise, so no byte is overwritten before it is read.
    pub fn move_bytes(&self, dest: u64, src: u64, len: u64, scratch: &mut Vec<u8>) -> Result<()> {
        if dest == src || len == 0 {
            return Ok(());
        }
        trace!(dest, src, len, "Moving bytes");
        scratch.resize(MOVE_CHUNK_SIZE, 0);
        if dest < src {
            let mut done = 0u64;
            while done < len {
                let n = (len - done).min(MOVE_CHUNK_SIZE as u64) as usize;
                self.read_exact_at(&mut scratch[..n], src + done)?;
                self.write_all_at(&scratch[..n], dest + done)?;
                done += n as u64;
            }
        } else {
            let mut left = len;
            while left > 0 {
                let n = left.min(MOVE_CHUNK_SIZE as u64) as usize;
                left -= n as u64;
                self.read_exact_at(&mut scratch[..n], src + left)?;
                self.write_all_at(&scratch[..n], dest + left)?;
            }
        }
        Ok(())
    }

    /// Truncate or extend the file.
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.check_writable()?;
        debug!(path = %self.path.display(), len, "Resizing mailbox");
        self.file
            .set_len(len)
            .map_err(|e| MboxError::io(&self.path, e))
    }

    /// Flush written data to disk.
    pub fn sync_data(&self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        self.file
            .sync_data()
            .map_err(|e| MboxError::io(&self.path, e))
    }

    /// Make sure the modification time differs from `orig_mtime_ns`.
    ///
    /// Sleeps `interval` between touches; gives up after a few rounds on
    /// filesystems that refuse to move the clock forward.
    pub fn touch_until_changed(&self, orig_mtime_ns: i64, interval: Duration) -> Result<Fingerprint> {
        self.check_writable()?;
        let mut fp = self.fingerprint()?;
        let mut rounds = 0;
        while fp.mtime_ns == orig_mtime_ns {
            if rounds == 10 {
                warn!(path = %self.path.display(), "Modification time does not advance");
                break;
            }
            std::thread::sleep(interval);
            self.file
                .set_modified(SystemTime::now())
                .map_err(|e| MboxError::io(&self.path, e))?;
            fp = self.fingerprint()?;
            rounds += 1;
        }
        Ok(fp)
    }

    // ── Locking ─────────────────────────────────────────────────────

    /// Lock held right now, if any.
    pub fn lock_kind(&self) -> Option<LockKind> {
        self.lock
    }

    /// Take an advisory lock. Fails if this handle already holds one.
    pub fn lock(&mut self, kind: LockKind, timeout: Duration) -> Result<()> {
        if let Some(held) = self.lock {
            return Err(MboxError::Lock {
                path: self.path.clone(),
                reason: format!("{held:?} lock already held"),
            });
        }
        lock::acquire(&self.file, &self.path, kind, timeout)?;
        self.lock = Some(kind);
        Ok(())
    }

    /// Drop the lock if one is held.
    pub fn unlock(&mut self) -> Result<()> {
        if self.lock.take().is_some() {
            lock::release(&self.file, &self.path)?;
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MboxError::io(
                &self.path,
                std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "mailbox opened read-only",
                ),
            ));
        }
        if self.lock != Some(LockKind::Exclusive) {
            return Err(MboxError::Lock {
                path: self.path.clone(),
                reason: "write attempted without an exclusive lock".into(),
            });
        }
        Ok(())
    }
}

impl Drop for MboxFile {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(error = %e, "Failed to release mailbox lock");
        }
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}
