//! One attempt at synchronizing: a single forward pass over the file.
//!
//! All per-attempt state lives in [`SyncPass`]. The scanner, reconciler
//! and ledger are separate objects driven from [`SyncPass::run`]; the
//! rewrite executor is called when the ledger says a write can happen.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MboxError, Result};
use crate::index::store::{IndexRecord, IndexTransaction};
use crate::model::record::{MailState, RecordKind, ScannedRecord};
use crate::model::sync_record::SyncRecord;
use crate::parser::header::{parse_header, pseudo_record, ParsedHeader};
use crate::parser::mbox::RecordScanner;
use crate::store::file::MboxFile;
use crate::sync::ledger::{Decision, Finish, LedgerEntry, Settlement, SpaceLedger};
use crate::sync::reconcile::{ReconcileOptions, ReconcileStats, Reconciler, SyncQueue};
use crate::sync::rewrite::{
    execute_run, grow_file, patch_uid_last, rewrite_in_place, shift_record, HeaderPlan, Placed,
    RunRecord,
};

/// How much of the file a pass looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Jump between records that have pending changes, using cached offsets.
    FastPath,
    /// Read every record from the start.
    FullScan,
}

/// Settings for one pass.
#[derive(Debug, Clone)]
pub struct PassOptions {
    pub mode: ScanMode,
    /// The file changed since the last full sync; look at records past
    /// the last known one.
    pub dirty: bool,
    pub reconcile: ReconcileOptions,
    /// Host name for a placeholder record.
    pub hostname: String,
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub records_scanned: u64,
    pub headers_rewritten: u64,
    pub records_moved: u64,
    pub rewrite_runs: u64,
    pub expunged: u64,
    /// The file was written at all.
    pub wrote: bool,
}

/// What a completed pass hands to the committer.
#[derive(Debug)]
pub struct PassOutcome {
    pub tx: IndexTransaction,
    pub stats: PassStats,
    pub reconcile: ReconcileStats,
    pub next_uid: u32,
    pub validity: u32,
    pub uids_broken: bool,
    /// Records were jumped over.
    pub skipped: bool,
    pub remaining_syncs: Vec<SyncRecord>,
}

/// Location of the last-UID digits currently in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BaseSlot {
    offset: u64,
    value: u32,
}

enum Navigation {
    Continue,
    /// Moved to the record of this UID.
    Jumped(u32),
    Stop,
}

pub struct SyncPass<'a> {
    file: &'a MboxFile,
    records: &'a [IndexRecord],
    opts: PassOptions,
    ledger: SpaceLedger,
    reconciler: Reconciler<'a>,
    queue: SyncQueue,
    tx: IndexTransaction,
    scratch: Vec<u8>,
    stats: PassStats,
    run: Vec<RunRecord>,
    run_start: u64,
    run_end: u64,
    /// Start of the reclaimed gap while the ledger carries one.
    gap_start: u64,
    base_slot: Option<BaseSlot>,
    /// 1 when the file starts with a placeholder record.
    pseudo_offset: u32,
    skipped: bool,
    /// The scan reached EOF without jumping over unread records at the end.
    saw_everything: bool,
}

impl<'a> SyncPass<'a> {
    pub fn new(
        file: &'a MboxFile,
        records: &'a [IndexRecord],
        pending: &[SyncRecord],
        validity: u32,
        next_uid: u32,
        opts: PassOptions,
    ) -> Self {
        // Queued changes name UIDs that renumbering gives away.
        let renumbering = opts.reconcile.renumber_validity.is_some();
        let pending = if renumbering { &[][..] } else { pending };
        let queue = SyncQueue::new(pending, opts.reconcile.readonly);
        let reconciler = Reconciler::new(
            file.path(),
            records,
            validity,
            next_uid,
            queue.appended_next_uid(),
            opts.reconcile.clone(),
        );
        Self {
            file,
            records: if renumbering { &[] } else { records },
            opts,
            ledger: SpaceLedger::new(),
            reconciler,
            queue,
            tx: IndexTransaction::new(),
            scratch: Vec::new(),
            stats: PassStats::default(),
            run: Vec::new(),
            run_start: 0,
            run_end: 0,
            gap_start: 0,
            base_slot: None,
            pseudo_offset: 0,
            skipped: false,
            saw_everything: false,
        }
    }

    /// Highest UID handed out so far plus one.
    pub fn next_uid(&self) -> u32 {
        self.reconciler.next_uid()
    }

    /// Reclaimed bytes that were not yet closed up, as `(dest, src)`:
    /// everything from `src` to EOF belongs at `dest`.
    pub fn hole(&self) -> Option<(u64, u64)> {
        if self.ledger.run_active() {
            let first = self.run.first()?;
            return (self.run_start < first.from_offset).then_some((self.run_start, first.from_offset));
        }
        let gap = self.ledger.expunged_space();
        (gap > 0).then_some((self.gap_start, self.gap_start + gap))
    }

    /// Scan, reconcile and rewrite until the end of the file, or until a
    /// fast pass has nothing left to visit.
    pub fn run(&mut self, progress: Option<&dyn Fn(u64, u64)>) -> Result<()> {
        if self.reconciler.next_uid() == u32::MAX {
            return Err(MboxError::IdentifierExhaustion(self.file.path().to_path_buf()));
        }
        let mut scanner = RecordScanner::new(self.file)?.with_progress(progress);
        let mut expect_uid = None;
        loop {
            if self.opts.mode == ScanMode::FastPath && self.ledger.is_idle() && scanner.seq() >= 1 {
                match self.navigate(&mut scanner)? {
                    Navigation::Continue => {}
                    Navigation::Jumped(uid) => expect_uid = Some(uid),
                    Navigation::Stop => {
                        debug!(seq = scanner.seq(), "Nothing left to visit");
                        break;
                    }
                }
            }
            let Some(rec) = scanner.next()? else {
                self.saw_everything = true;
                break;
            };
            self.stats.records_scanned += 1;
            let parsed = parse_header(&rec.header);

            if let Some(expected) = expect_uid.take() {
                if parsed.uid != Some(expected) {
                    return Err(MboxError::Boundary {
                        offset: rec.from_offset,
                        reason: format!("expected the message with UID {expected}"),
                    });
                }
            }

            let kind = self
                .reconciler
                .reconcile(&rec, &parsed, &mut self.queue, &mut self.tx)?;
            if self.opts.mode == ScanMode::FastPath && self.reconciler.uids_broken() {
                return Err(MboxError::Boundary {
                    offset: rec.from_offset,
                    reason: "UID order broken while skipping".into(),
                });
            }

            // Writes only touch bytes before the scanner position.
            self.place(&rec, &parsed, kind)?;
        }

        if self.saw_everything {
            self.settle_eof()?;
        }
        self.patch_base()
    }

    /// Hand the results over for committing.
    pub fn finish(mut self) -> PassOutcome {
        self.reconciler.finish(self.saw_everything, &mut self.tx);
        let mut remaining_syncs = self.queue.into_remaining(self.saw_everything);
        if !self.saw_everything {
            // Changes for UIDs past the last known message have nothing to apply to.
            let last_uid = self.records.last().map_or(0, |r| r.uid);
            remaining_syncs.retain(|r| r.uid1 <= last_uid || (r.is_expunge() && self.opts.reconcile.readonly));
        }
        PassOutcome {
            stats: self.stats,
            reconcile: self.reconciler.stats(),
            next_uid: self.reconciler.next_uid(),
            validity: self.reconciler.validity(),
            uids_broken: self.reconciler.uids_broken(),
            skipped: self.skipped,
            remaining_syncs,
            tx: self.tx,
        }
    }

    /// Abandon the pass, discarding its index changes.
    pub fn abandon(self) {
        self.tx.rollback();
    }

    // ── Fast-path navigation ────────────────────────────────────

    fn navigate(&mut self, scanner: &mut RecordScanner<'_>) -> Result<Navigation> {
        if self.queue.has_active_beyond(self.reconciler.prev_uid()) {
            return Ok(Navigation::Continue);
        }
        let cursor = self.reconciler.cursor();
        if let Some(uid1) = self.queue.next_pending_uid() {
            let pos = self.records.partition_point(|r| r.uid < uid1);
            if pos < self.records.len() {
                if pos > cursor {
                    return self.jump(scanner, pos);
                }
                return Ok(Navigation::Continue);
            }
        }
        if self.opts.dirty {
            // Check the last known message, then read whatever follows it.
            let last = self.records.len().saturating_sub(1);
            if !self.records.is_empty() && last > cursor {
                return self.jump(scanner, last);
            }
            return Ok(Navigation::Continue);
        }
        Ok(Navigation::Stop)
    }

    fn jump(&mut self, scanner: &mut RecordScanner<'_>, pos: usize) -> Result<Navigation> {
        let target = &self.records[pos];
        let seq = pos as u32 + 1 + self.pseudo_offset;
        let exact = scanner.seek_to_sequence(seq, Some(target.from_offset))?;
        debug!(uid = target.uid, seq, exact, "Skipping ahead");
        self.reconciler.skip_to(pos);
        self.skipped = true;
        Ok(Navigation::Jumped(target.uid))
    }

    // ── Placement ───────────────────────────────────────────────

    fn place(&mut self, rec: &ScannedRecord, parsed: &ParsedHeader, kind: RecordKind) -> Result<()> {
        match kind {
            RecordKind::Pseudo => {
                self.ledger.accumulate(LedgerEntry::Pseudo)?;
                self.pseudo_offset = 1;
                self.base_slot = parsed.base.and_then(|b| {
                    b.uid_last_pos.map(|pos| BaseSlot {
                        offset: rec.hdr_offset + pos as u64,
                        value: b.uid_last,
                    })
                });
                Ok(())
            }
            RecordKind::Expunged { space } => {
                self.stats.expunged += 1;
                let idle = self.ledger.is_idle();
                let (_, settlement) = self.ledger.accumulate(LedgerEntry::Expunged {
                    seq: rec.seq,
                    space,
                })?;
                if self.ledger.run_active() || settlement.is_some() {
                    self.run_end = rec.end_offset();
                } else if idle {
                    self.gap_start = rec.from_offset;
                }
                match settlement {
                    Some(settlement) => self.execute_settlement(settlement),
                    None => Ok(()),
                }
            }
            RecordKind::Live(state) => self.place_live(rec, parsed, state),
        }
    }

    fn place_live(&mut self, rec: &ScannedRecord, parsed: &ParsedHeader, state: MailState) -> Result<()> {
        let base = state
            .holds_base
            .then(|| (self.reconciler.validity(), self.reconciler.next_uid() - 1));
        let plan = HeaderPlan {
            unmanaged: parsed.unmanaged.clone(),
            base,
            flags: state.flags,
            keywords: state.keywords,
            uid: state.uid,
            content_length: rec.body_size,
        };
        let old = rec.header_len();
        let rewrite = state.need_rewrite;
        let min = if rewrite || !self.ledger.is_idle() {
            plan.min_len()
        } else {
            old
        };
        let run_was_active = self.ledger.run_active();
        let gap_before = self.ledger.expunged_space();

        let (decision, settlement) = self.ledger.accumulate(LedgerEntry::Live {
            seq: rec.seq,
            old,
            min,
            rewrite,
        })?;

        match decision {
            Decision::Untouched => {
                self.note_offset(state.uid, rec.from_offset);
                if state.holds_base {
                    self.base_slot = untouched_slot(parsed, rec.hdr_offset);
                }
            }
            Decision::InPlace => {
                let slot = rewrite_in_place(self.file, rec.hdr_offset, old, &plan)?;
                self.stats.headers_rewritten += 1;
                self.stats.wrote = true;
                self.note_offset(state.uid, rec.from_offset);
                if let (Some(offset), Some((_, value))) = (slot, plan.base) {
                    self.base_slot = Some(BaseSlot { offset, value });
                }
            }
            Decision::Shift { by, grow } => {
                let (header, slot_pos, slot_value) = if rewrite || grow > 0 {
                    let rendered = plan.render(old + grow - min);
                    (rendered.bytes, rendered.uid_last_pos, plan.base.map(|(_, v)| v))
                } else {
                    let base = parsed.base;
                    (
                        rec.header.clone(),
                        base.and_then(|b| b.uid_last_pos),
                        base.map(|b| b.uid_last),
                    )
                };
                let new_from = shift_record(self.file, rec, by, &header, &mut self.scratch)?;
                self.stats.records_moved += 1;
                if rewrite || grow > 0 {
                    self.stats.headers_rewritten += 1;
                }
                self.stats.wrote = true;
                self.note_offset(state.uid, new_from);
                if state.holds_base {
                    let new_hdr = new_from + rec.from_line.len() as u64;
                    self.base_slot = slot_pos.zip(slot_value).map(|(pos, value)| BaseSlot {
                        offset: new_hdr + pos as u64,
                        value,
                    });
                }
                if self.ledger.expunged_space() > 0 {
                    self.gap_start = new_from + rec.from_line.len() as u64 + header.len() as u64 + rec.tail_len();
                }
            }
            Decision::Defer => {
                if !run_was_active {
                    self.run.clear();
                    self.run_start = rec.from_offset - gap_before;
                }
                self.run.push(RunRecord {
                    seq: rec.seq,
                    from_offset: rec.from_offset,
                    from_line: rec.from_line.clone(),
                    body_offset: rec.body_offset,
                    tail_len: rec.tail_len(),
                    plan,
                });
                self.run_end = rec.end_offset();
                if let Some(settlement) = settlement {
                    self.execute_settlement(settlement)?;
                }
            }
            Decision::Reclaim => {
                return Err(MboxError::SpaceAccounting(format!(
                    "live record {} reclaimed",
                    rec.seq
                )));
            }
        }
        Ok(())
    }

    fn execute_settlement(&mut self, settlement: Settlement) -> Result<()> {
        let placed = execute_run(
            self.file,
            &self.run,
            self.run_start,
            self.run_end,
            settlement.padding,
            settlement.leftover,
            &mut self.scratch,
        )?;
        self.record_run(&placed);
        if settlement.leftover > 0 {
            self.gap_start = self.run_end - settlement.leftover;
        }
        self.run.clear();
        Ok(())
    }

    fn record_run(&mut self, placed: &[Placed]) {
        let moved: Vec<(u64, Option<u32>)> = self
            .run
            .iter()
            .map(|r| (r.from_offset, r.plan.base.map(|(_, v)| v)))
            .collect();
        for (p, (old_from, base_value)) in placed.iter().zip(moved) {
            if p.from_offset != old_from {
                self.stats.records_moved += 1;
            }
            self.note_offset(p.uid, p.from_offset);
            if let (Some(offset), Some(value)) = (p.uid_last_offset, base_value) {
                self.base_slot = Some(BaseSlot { offset, value });
            }
        }
        self.stats.headers_rewritten += placed.len() as u64;
        self.stats.rewrite_runs += 1;
        self.stats.wrote = true;
    }

    fn note_offset(&mut self, uid: u32, from_offset: u64) {
        let known = self
            .records
            .binary_search_by_key(&uid, |r| r.uid)
            .ok()
            .map(|i| self.records[i].from_offset);
        if known != Some(from_offset) {
            self.tx.set_offset(uid, from_offset);
        }
    }

    // ── Settling ────────────────────────────────────────────────

    fn settle_eof(&mut self) -> Result<()> {
        match self.ledger.finish() {
            Finish::Nothing => {}
            Finish::Truncate { gap } => {
                let size = self.file.len()?;
                let new_size = size.checked_sub(gap).ok_or_else(|| {
                    MboxError::SpaceAccounting(format!("gap of {gap} bytes in a {size} byte file"))
                })?;
                if new_size != self.gap_start {
                    return Err(MboxError::SpaceAccounting(format!(
                        "gap starts at {} but file would end at {new_size}",
                        self.gap_start
                    )));
                }
                self.file.set_len(new_size)?;
                self.stats.wrote = true;
                debug!(from = size, to = new_size, "Truncated reclaimed space");
                if new_size == 0 && self.stats.records_scanned > 0 {
                    self.write_pseudo()?;
                }
            }
            Finish::Grow {
                deficit, padding, ..
            } => {
                let grow = deficit + padding;
                let old_size = grow_file(self.file, grow)?;
                self.stats.wrote = true;
                if old_size != self.run_end {
                    return Err(MboxError::SpaceAccounting(format!(
                        "pending run ends at {} but file ended at {old_size}",
                        self.run_end
                    )));
                }
                let run_end = old_size + grow;
                let placed = execute_run(
                    self.file,
                    &self.run,
                    self.run_start,
                    run_end,
                    padding,
                    0,
                    &mut self.scratch,
                )?;
                self.record_run(&placed);
                self.run.clear();
                info!(path = %self.file.path().display(), grow, "Mailbox grown for header rewrites");
            }
        }
        Ok(())
    }

    fn write_pseudo(&mut self) -> Result<()> {
        let validity = self.reconciler.validity();
        let uid_last = self.reconciler.next_uid() - 1;
        let hostname = self.opts.hostname.clone();
        let rendered = pseudo_record(validity, uid_last, &hostname, Utc::now());
        if let Err(e) = self.file.write_all_at(&rendered.bytes, 0) {
            warn!(error = %e, "Writing the placeholder record failed");
            self.file.set_len(0)?;
            return Err(e);
        }
        self.base_slot = rendered.uid_last_pos.map(|pos| BaseSlot {
            offset: pos as u64,
            value: uid_last,
        });
        debug!(validity, uid_last, "Placeholder record written");
        Ok(())
    }

    /// Bring the last-UID digits up to date.
    fn patch_base(&mut self) -> Result<()> {
        if self.opts.reconcile.delay_writes || self.opts.reconcile.readonly {
            return Ok(());
        }
        let want = self.reconciler.next_uid() - 1;
        if let Some(slot) = self.base_slot {
            if slot.value != want {
                patch_uid_last(self.file, slot.offset, slot.value, want)?;
                self.base_slot = Some(BaseSlot {
                    value: want,
                    ..slot
                });
                self.stats.wrote = true;
            }
        }
        Ok(())
    }
}

fn untouched_slot(parsed: &ParsedHeader, hdr_offset: u64) -> Option<BaseSlot> {
    let base = parsed.base?;
    Some(BaseSlot {
        offset: hdr_offset + base.uid_last_pos? as u64,
        value: base.uid_last,
    })
}
