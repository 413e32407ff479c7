//! Top-level synchronization: locking, deciding how much work a sync needs,
//! bounded retries, and committing the result to the index.
//!
//! ```text
//! Probing ─┬─> Done
//!          ├─> IndexOnly ───────────────────────────> Done
//!          └─> Scan(FastPath | FullScan) ─┬─> Committing ─> Done
//!                      ^                  └─> Retry ─┬─> Fatal
//!                      └─────────────────────────────┘
//! ```

use std::path::Path;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SyncConfig};
use crate::error::{MboxError, Result};
use crate::index::format::IndexFlags;
use crate::index::store::{FileIndex, MailIndex};
use crate::lock::LockKind;
use crate::model::flags::MailFlags;
use crate::model::sync_record::SyncRecord;
use crate::store::file::{Fingerprint, MboxFile};
use crate::sync::pass::{PassOptions, PassOutcome, ScanMode, SyncPass};
use crate::sync::reconcile::{fresh_validity, ReconcileOptions};

/// Total scan attempts per sync.
pub const MAX_ATTEMPTS: u32 = 3;

bitflags::bitflags! {
    /// Caller requests for one sync.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u8 {
        /// Scan everything; also the only way past a corrupted index.
        const FORCE_FULL = 0b001;
        /// Write deferred header changes even in lazy mode.
        const FULL_WRITE = 0b010;
        /// Do not trust cached offsets after an external change.
        const UNDIRTY    = 0b100;
    }
}

impl Default for SyncFlags {
    fn default() -> Self {
        SyncFlags::empty()
    }
}

/// Summary of a finished sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Scan mode of the attempt that committed; `None` when no scan ran.
    pub mode: Option<ScanMode>,
    pub attempts: u32,
    pub records_scanned: u64,
    pub headers_rewritten: u64,
    pub records_moved: u64,
    pub rewrite_runs: u64,
    pub expunged: u64,
    pub appended: u64,
    pub vanished: u64,
    pub size_before: u64,
    pub size_after: u64,
    pub renumbered: bool,
    /// Started from a file changed since the last full sync.
    pub dirty: bool,
    /// Records were jumped over.
    pub skipped: bool,
    /// Only the index was updated.
    pub index_only: bool,
    pub uid_validity: u32,
    pub next_uid: u32,
}

/// Where a sync stands.
#[derive(Debug)]
enum SyncState {
    Probing,
    IndexOnly,
    Scan { mode: ScanMode, dirty: bool },
    Committing(Box<Committed>),
    Retry { error: MboxError, mode: ScanMode, dirty: bool },
    Done,
    Fatal(MboxError),
}

#[derive(Debug)]
struct Committed {
    outcome: PassOutcome,
    mode: ScanMode,
    dirty: bool,
}

/// A pass that failed, with what is needed to recover from it.
struct Aborted {
    error: MboxError,
    hole: Option<(u64, u64)>,
    next_uid: u32,
}

/// An mbox file together with its index.
pub struct Mailbox<I: MailIndex = FileIndex> {
    file: MboxFile,
    index: I,
    settings: SyncConfig,
    hostname: String,
}

impl Mailbox<FileIndex> {
    /// Open `path` and load (or create) its index.
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        let file = MboxFile::open(path)?;
        let index = FileIndex::open(path, config.index.index_dir.as_deref())?;
        Ok(Self::with_index(file, index, config))
    }
}

/// Per-sync values carried through the state machine.
struct SyncContext<'p> {
    flags: SyncFlags,
    delay_writes: bool,
    attempts: u32,
    renumber: Option<u32>,
    uid_floor: u32,
    fp_before: Fingerprint,
    progress: Option<&'p dyn Fn(u64, u64)>,
}

impl<I: MailIndex> Mailbox<I> {
    pub fn with_index(file: MboxFile, index: I, config: &Config) -> Self {
        Self {
            file,
            index,
            settings: config.sync.clone(),
            hostname: config.general.hostname(),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn file(&self) -> &MboxFile {
        &self.file
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut I {
        &mut self.index
    }

    /// Queue a change for the next sync.
    pub fn queue(&mut self, record: SyncRecord) -> Result<()> {
        debug!(uid1 = record.uid1, uid2 = record.uid2, kind = ?record.kind, "Queued change");
        self.index.queue_sync(record)
    }

    pub fn sync(&mut self, flags: SyncFlags) -> Result<SyncReport> {
        self.sync_with_progress(flags, None)
    }

    /// Bring the file and the index in line with each other.
    ///
    /// `progress` receives `(bytes_scanned, file_size)`.
    pub fn sync_with_progress(
        &mut self,
        flags: SyncFlags,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<SyncReport> {
        let readonly = self.file.is_readonly();
        let delay_writes =
            (self.settings.lazy_writes && !flags.contains(SyncFlags::FULL_WRITE)) || readonly;
        let timeout = self.settings.lock_timeout();

        // A shared lock is enough to see whether there is anything to do.
        self.file.lock(LockKind::Shared, timeout)?;
        let probed = self.probe(flags, delay_writes);
        self.file.unlock()?;
        if matches!(probed?, SyncState::Done) {
            debug!(path = %self.path().display(), "Mailbox already in sync");
            let size = self.file.len()?;
            return Ok(self.report_base(size));
        }

        let kind = if readonly {
            LockKind::Shared
        } else {
            LockKind::Exclusive
        };
        self.file.lock(kind, timeout)?;
        let result = self.sync_locked(flags, delay_writes, progress);
        let unlocked = self.file.unlock();
        let report = result?;
        unlocked?;
        Ok(report)
    }

    fn sync_locked(
        &mut self,
        flags: SyncFlags,
        delay_writes: bool,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<SyncReport> {
        self.index.refresh()?;
        if self.index.header().is_corrupted() && flags.contains(SyncFlags::FORCE_FULL) {
            warn!(path = %self.path().display(), "Discarding corrupted index");
            self.index.reset()?;
        }

        let fp_before = self.file.fingerprint()?;
        let mut report = self.report_base(fp_before.size);
        let mut ctx = SyncContext {
            flags,
            delay_writes,
            attempts: 0,
            renumber: None,
            uid_floor: 0,
            fp_before,
            progress,
        };

        let mut state = SyncState::Probing;
        loop {
            state = match state {
                SyncState::Probing => self.probe(flags, delay_writes)?,
                SyncState::IndexOnly => {
                    self.sync_index_only()?;
                    report.index_only = true;
                    SyncState::Done
                }
                SyncState::Scan { mode, dirty } => {
                    ctx.attempts += 1;
                    if ctx.attempts > MAX_ATTEMPTS {
                        SyncState::Fatal(MboxError::RetryLimit {
                            path: self.path().to_path_buf(),
                            attempts: MAX_ATTEMPTS,
                        })
                    } else {
                        self.scan(&mut ctx, mode, dirty)?
                    }
                }
                SyncState::Retry { error, mode, dirty } => self.retry(&mut ctx, error, mode, dirty)?,
                SyncState::Committing(committed) => {
                    let Committed {
                        outcome,
                        mode,
                        dirty,
                    } = *committed;
                    report.mode = Some(mode);
                    report.dirty = dirty;
                    report.skipped = outcome.skipped;
                    report.records_scanned = outcome.stats.records_scanned;
                    report.headers_rewritten = outcome.stats.headers_rewritten;
                    report.records_moved = outcome.stats.records_moved;
                    report.rewrite_runs = outcome.stats.rewrite_runs;
                    report.expunged = outcome.stats.expunged;
                    report.appended = outcome.reconcile.appended;
                    report.vanished = outcome.reconcile.vanished;
                    self.commit(&ctx, outcome, mode, dirty)?;
                    SyncState::Done
                }
                SyncState::Done => break,
                SyncState::Fatal(e) => {
                    error!(path = %self.path().display(), error = %e, "Sync failed");
                    return Err(e);
                }
            };
        }

        let header = self.index.header();
        report.attempts = ctx.attempts;
        report.renumbered = ctx.renumber.is_some();
        report.uid_validity = header.uid_validity;
        report.next_uid = header.next_uid;
        report.size_after = self.file.len()?;
        info!(
            path = %self.path().display(),
            mode = ?report.mode,
            attempts = report.attempts,
            scanned = report.records_scanned,
            rewritten = report.headers_rewritten,
            expunged = report.expunged,
            size_before = report.size_before,
            size_after = report.size_after,
            "Sync complete"
        );
        Ok(report)
    }

    // ── Probing ─────────────────────────────────────────────────

    fn probe(&self, flags: SyncFlags, delay_writes: bool) -> Result<SyncState> {
        let header = self.index.header();
        if header.is_corrupted() && !flags.contains(SyncFlags::FORCE_FULL) {
            return Err(MboxError::IdentityCorruption {
                path: self.path().to_path_buf(),
                reason: "index is marked corrupted, a forced full sync is required".into(),
            });
        }
        let full = SyncState::Scan {
            mode: ScanMode::FullScan,
            dirty: false,
        };
        if flags.contains(SyncFlags::FORCE_FULL) || header.uid_validity == 0 {
            return Ok(full);
        }
        let write_capable = !delay_writes;
        if write_capable
            && self
                .index
                .records()
                .iter()
                .any(|r| r.flags.contains(MailFlags::DIRTY))
        {
            debug!("Writing deferred header changes");
            return Ok(full);
        }
        let needs_full = header.flags.contains(IndexFlags::NEEDS_FULL_SYNC) && write_capable;

        let fp = self.file.fingerprint()?;
        let pending = self.index.pending_syncs();
        if fp == header.sync_fingerprint {
            if needs_full {
                return Ok(full);
            }
            if pending.is_empty() {
                return Ok(SyncState::Done);
            }
            if delay_writes && pending.iter().all(SyncRecord::is_index_only) {
                return Ok(SyncState::IndexOnly);
            }
            return Ok(SyncState::Scan {
                mode: ScanMode::FastPath,
                dirty: false,
            });
        }

        debug!(
            size = fp.size,
            synced_size = header.sync_fingerprint.size,
            "Mailbox changed since last full sync"
        );
        if !self.settings.dirty_syncs
            || flags.contains(SyncFlags::UNDIRTY)
            || fp.size <= header.sync_fingerprint.size
            || needs_full
        {
            return Ok(full);
        }
        if fp == header.dirty_fingerprint && pending.is_empty() {
            return Ok(SyncState::Done);
        }
        Ok(SyncState::Scan {
            mode: ScanMode::FastPath,
            dirty: true,
        })
    }

    // ── Scanning ────────────────────────────────────────────────

    fn scan(&mut self, ctx: &mut SyncContext<'_>, mode: ScanMode, dirty: bool) -> Result<SyncState> {
        let delay_writes = ctx.delay_writes && ctx.renumber.is_none();
        let opts = PassOptions {
            mode,
            dirty,
            reconcile: ReconcileOptions {
                delay_writes,
                readonly: self.file.is_readonly(),
                renumber_validity: ctx.renumber,
                uid_floor: ctx.uid_floor,
            },
            hostname: self.hostname.clone(),
        };
        debug!(attempt = ctx.attempts, ?mode, dirty, "Starting pass");

        match self.run_pass(opts, ctx.progress) {
            Ok(outcome) => Ok(SyncState::Committing(Box::new(Committed {
                outcome,
                mode,
                dirty,
            }))),
            Err(aborted) => {
                ctx.uid_floor = ctx.uid_floor.max(aborted.next_uid);
                if let Some((dest, src)) = aborted.hole {
                    self.close_hole(dest, src)?;
                }
                Ok(SyncState::Retry {
                    error: aborted.error,
                    mode,
                    dirty,
                })
            }
        }
    }

    fn run_pass(
        &self,
        opts: PassOptions,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> std::result::Result<PassOutcome, Aborted> {
        let header = self.index.header();
        let mut pass = SyncPass::new(
            &self.file,
            self.index.records(),
            self.index.pending_syncs(),
            header.uid_validity,
            header.next_uid,
            opts,
        );
        match pass.run(progress) {
            Ok(()) => Ok(pass.finish()),
            Err(error) => {
                let aborted = Aborted {
                    hole: pass.hole(),
                    next_uid: pass.next_uid(),
                    error,
                };
                pass.abandon();
                Err(aborted)
            }
        }
    }

    /// Decide what follows a failed pass.
    fn retry(
        &mut self,
        ctx: &mut SyncContext<'_>,
        error: MboxError,
        mode: ScanMode,
        dirty: bool,
    ) -> Result<SyncState> {
        if !error.is_retryable() {
            match error {
                MboxError::IdentityCorruption { ref reason, .. } => {
                    self.index.mark_corrupted(reason)?;
                }
                _ => debug!(?mode, dirty, "Not retrying"),
            }
            return Ok(SyncState::Fatal(error));
        }
        let full = SyncState::Scan {
            mode: ScanMode::FullScan,
            dirty: false,
        };
        let next = match error {
            MboxError::Boundary { .. } if mode == ScanMode::FastPath => {
                warn!(error = %error, "Fast sync failed, rescanning everything");
                full
            }
            MboxError::UidLastMismatch { .. } => {
                warn!(error = %error, "Last-UID field changed, rescanning everything");
                full
            }
            MboxError::IdentifierExhaustion(_)
                if ctx.renumber.is_none()
                    && self.settings.renumber_on_exhaustion
                    && !self.file.is_readonly() =>
            {
                let validity = fresh_validity(self.index.header().uid_validity);
                warn!(
                    path = %self.path().display(),
                    validity,
                    "Out of UIDs, renumbering the mailbox"
                );
                ctx.renumber = Some(validity);
                ctx.uid_floor = 0;
                full
            }
            other => {
                debug!(?mode, dirty, error = %other, "Another pass would fail the same way");
                SyncState::Fatal(other)
            }
        };
        Ok(next)
    }

    /// Close reclaimed space an aborted pass left behind, so the file is
    /// again an unbroken sequence of records.
    fn close_hole(&self, dest: u64, src: u64) -> Result<()> {
        let size = self.file.len()?;
        if src <= dest || src > size {
            return Err(MboxError::SpaceAccounting(format!(
                "bad hole {dest}..{src} in a {size} byte file"
            )));
        }
        let mut scratch = Vec::new();
        self.file.move_bytes(dest, src, size - src, &mut scratch)?;
        self.file.set_len(size - (src - dest))?;
        warn!(
            path = %self.path().display(),
            offset = dest,
            bytes = src - dest,
            "Closed space left by an aborted sync"
        );
        Ok(())
    }

    // ── Index-only sync ─────────────────────────────────────────

    /// Apply queued flag and keyword changes to the index alone; the headers
    /// catch up on the next full-write sync.
    fn sync_index_only(&mut self) -> Result<()> {
        let mut tx = self.index.begin();
        let mut changed = 0u64;
        for sync in self.index.pending_syncs() {
            let Some((first, last)) = self.index.lookup_uid_range(sync.uid1, sync.uid2) else {
                continue;
            };
            for seq in first..=last {
                let Some(record) = self.index.lookup_seq(seq) else {
                    continue;
                };
                let mut flags = record.flags;
                let mut keywords = record.keywords.clone();
                sync.apply(&mut flags, &mut keywords);
                tx.set_flags(record.uid, flags | MailFlags::DIRTY, keywords);
                changed += 1;
            }
        }
        tx.set_pending(Vec::new());
        self.index.commit(tx)?;
        debug!(changed, "Index-only sync");
        Ok(())
    }

    // ── Committing ──────────────────────────────────────────────

    fn commit(
        &mut self,
        ctx: &SyncContext<'_>,
        outcome: PassOutcome,
        mode: ScanMode,
        dirty: bool,
    ) -> Result<()> {
        let PassOutcome {
            mut tx,
            stats,
            next_uid,
            validity,
            uids_broken,
            skipped,
            mut remaining_syncs,
            ..
        } = outcome;

        let mut fp = self.file.fingerprint()?;
        if stats.wrote {
            self.file.sync_data()?;
            fp = self.file.fingerprint()?;
            if fp == ctx.fp_before {
                // Same size and timestamp although content moved.
                fp = self
                    .file
                    .touch_until_changed(ctx.fp_before.mtime_ns, self.settings.touch_interval())?;
            }
        }

        if ctx.renumber.is_some() {
            tx.expunge_all();
            if !self.index.pending_syncs().is_empty() {
                warn!(
                    dropped = self.index.pending_syncs().len(),
                    "Dropping queued changes for renumbered UIDs"
                );
            }
            remaining_syncs.clear();
        }
        if !(dirty && skipped) {
            tx.set_sync_fingerprint(fp);
        }
        tx.set_dirty_fingerprint(fp);
        tx.set_uid_validity(validity);
        tx.set_next_uid(next_uid);
        if uids_broken && ctx.delay_writes {
            tx.add_header_flags(IndexFlags::NEEDS_FULL_SYNC);
        } else if mode == ScanMode::FullScan && !ctx.delay_writes {
            tx.remove_header_flags(IndexFlags::NEEDS_FULL_SYNC);
        }
        tx.set_pending(remaining_syncs);
        self.index.commit(tx)?;
        debug!(
            flags = ?ctx.flags,
            size = fp.size,
            next_uid,
            validity,
            "Index committed"
        );
        Ok(())
    }

    fn report_base(&self, size: u64) -> SyncReport {
        let header = self.index.header();
        SyncReport {
            size_before: size,
            size_after: size,
            uid_validity: header.uid_validity,
            next_uid: header.next_uid,
            ..SyncReport::default()
        }
    }
}
