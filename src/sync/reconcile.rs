//! Matching scanned records to index entries and applying queued changes.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{MboxError, Result};
use crate::index::store::{IndexRecord, IndexTransaction};
use crate::model::flags::{same_keywords, MailFlags};
use crate::model::record::{MailState, RecordKind, ScannedRecord};
use crate::model::sync_record::{SyncKind, SyncRecord};
use crate::parser::header::{BaseInfo, HeaderDigest, ParsedHeader};

// ── Sync queue ──────────────────────────────────────────────────

/// Pending [`SyncRecord`]s consumed in UID order as the scan advances.
#[derive(Debug)]
pub struct SyncQueue {
    pending: Vec<SyncRecord>,
    next: usize,
    active: Vec<SyncRecord>,
    /// Expunges that cannot be done without write access.
    kept: Vec<SyncRecord>,
    readonly: bool,
    appended_next_uid: Option<u32>,
}

impl SyncQueue {
    pub fn new(records: &[SyncRecord], readonly: bool) -> Self {
        let mut pending = Vec::with_capacity(records.len());
        let mut appended_next_uid = None;
        for record in records {
            if matches!(record.kind, SyncKind::Append) {
                let next = record.uid2.saturating_add(1);
                appended_next_uid = Some(appended_next_uid.map_or(next, |n: u32| n.max(next)));
            } else {
                pending.push(record.clone());
            }
        }
        pending.sort_by_key(|r| r.uid1);
        Self {
            pending,
            next: 0,
            active: Vec::new(),
            kept: Vec::new(),
            readonly,
            appended_next_uid,
        }
    }

    /// Next UID past every queued append.
    pub fn appended_next_uid(&self) -> Option<u32> {
        self.appended_next_uid
    }

    /// Move the queue to `uid` and return the records covering it.
    pub fn advance(&mut self, uid: u32) -> &[SyncRecord] {
        while let Some(record) = self.pending.get(self.next) {
            if record.uid1 > uid {
                break;
            }
            if self.readonly && record.is_expunge() {
                self.kept.push(record.clone());
            } else {
                self.active.push(record.clone());
            }
            self.next += 1;
        }
        self.active.retain(|r| r.uid2 >= uid);
        &self.active
    }

    /// An active record still covers UIDs after `uid`.
    pub fn has_active_beyond(&self, uid: u32) -> bool {
        self.active.iter().any(|r| r.uid2 > uid)
    }

    /// First UID of the next record not yet reached.
    pub fn next_pending_uid(&self) -> Option<u32> {
        self.pending.get(self.next).map(|r| r.uid1)
    }

    /// Records to keep queued after the pass. Everything the scan did not
    /// reach stays queued unless the whole file was seen.
    pub fn into_remaining(self, saw_everything: bool) -> Vec<SyncRecord> {
        let mut remaining = self.kept;
        if !saw_everything {
            remaining.extend(self.active);
            remaining.extend(self.pending.into_iter().skip(self.next));
        }
        remaining.sort_by_key(|r| r.uid1);
        remaining
    }
}

// ── Reconciler ──────────────────────────────────────────────────

/// Per-pass reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Leave headers alone and record differences in the index only.
    pub delay_writes: bool,
    pub readonly: bool,
    /// Ignore existing UIDs and number every message from 1 under this
    /// new UID validity.
    pub renumber_validity: Option<u32>,
    /// UIDs below this were handed out by an aborted attempt of this sync.
    pub uid_floor: u32,
}

/// Counters reported by the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// New index entries.
    pub appended: u64,
    /// Index entries whose message disappeared from the file.
    pub vanished: u64,
    pub adopted_by_digest: u64,
    pub broken_uids: u64,
}

enum Identity<'a> {
    /// Same UID and content as the record before it.
    Dead,
    Known {
        uid: u32,
        entry: Option<&'a IndexRecord>,
        /// A fresh UID was handed out.
        assigned: bool,
    },
}

/// Walks the index alongside the file.
pub struct Reconciler<'a> {
    path: PathBuf,
    records: &'a [IndexRecord],
    /// Next index entry not yet matched.
    cursor: usize,
    prev_uid: u32,
    prev_digest: Option<HeaderDigest>,
    index_next_uid: u32,
    /// X-UIDs above this are corruption while identity is known.
    uid_limit: u32,
    next_uid: u32,
    validity: u32,
    identity_known: bool,
    opts: ReconcileOptions,
    pseudo_seen: bool,
    holder_seen: bool,
    uids_broken: bool,
    stats: ReconcileStats,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        path: &Path,
        records: &'a [IndexRecord],
        validity: u32,
        next_uid: u32,
        appended_next_uid: Option<u32>,
        opts: ReconcileOptions,
    ) -> Self {
        let (records, validity, next_uid) = match opts.renumber_validity {
            Some(fresh) => (&[][..], fresh, 1),
            None => (records, validity, next_uid),
        };
        let next_uid = next_uid.max(appended_next_uid.unwrap_or(0)).max(1);
        Self {
            path: path.to_path_buf(),
            records,
            cursor: 0,
            prev_uid: 0,
            prev_digest: None,
            index_next_uid: next_uid,
            uid_limit: next_uid.max(opts.uid_floor),
            next_uid,
            validity,
            identity_known: !records.is_empty() || next_uid > 1,
            opts,
            pseudo_seen: false,
            holder_seen: false,
            uids_broken: false,
            stats: ReconcileStats::default(),
        }
    }

    pub fn next_uid(&self) -> u32 {
        self.next_uid
    }

    pub fn prev_uid(&self) -> u32 {
        self.prev_uid
    }

    /// Index position of the next unmatched entry.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// UID validity, generating one if neither file nor index had it.
    pub fn validity(&mut self) -> u32 {
        if self.validity == 0 {
            self.validity = fresh_validity(0);
            debug!(validity = self.validity, "New UID validity");
        }
        self.validity
    }

    pub fn uids_broken(&self) -> bool {
        self.uids_broken
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Jump to index entry `pos`; the scanner was moved to its record.
    pub fn skip_to(&mut self, pos: usize) {
        self.cursor = pos;
        self.prev_uid = pos
            .checked_sub(1)
            .and_then(|i| self.records.get(i))
            .map_or(self.prev_uid, |r| r.uid.max(self.prev_uid));
        self.prev_digest = None;
    }

    /// End of pass. When the scan reached the end of the file in order,
    /// entries never matched are gone.
    pub fn finish(&mut self, saw_everything: bool, tx: &mut IndexTransaction) {
        if saw_everything {
            self.expunge_range(self.cursor, self.records.len(), tx);
            self.cursor = self.records.len();
        }
        self.validity();
    }

    /// Decide what `rec` is and record index changes in `tx`.
    pub fn reconcile(
        &mut self,
        rec: &ScannedRecord,
        parsed: &ParsedHeader,
        queue: &mut SyncQueue,
        tx: &mut IndexTransaction,
    ) -> Result<RecordKind> {
        if rec.seq == 1 {
            if let Some(base) = parsed.base {
                self.check_base(base)?;
            }
            self.validity();
            if parsed.pseudo {
                self.pseudo_seen = true;
                return Ok(RecordKind::Pseudo);
            }
        }

        let (uid, entry, assigned) = match self.identify(parsed, tx)? {
            Identity::Dead => return Ok(RecordKind::Expunged { space: rec.footprint() }),
            Identity::Known {
                uid,
                entry,
                assigned,
            } => (uid, entry, assigned),
        };
        self.prev_uid = uid;
        self.prev_digest = Some(parsed.digest);

        let header_flags = parsed.flags & MailFlags::HEADER_MASK;
        let recent = parsed.flags.contains(MailFlags::RECENT);
        let index_dirty = entry.is_some_and(|e| e.flags.contains(MailFlags::DIRTY));
        let (mut flags, mut keywords) = match entry {
            Some(e) if index_dirty => (e.flags & MailFlags::HEADER_MASK, e.keywords.clone()),
            _ => (header_flags, parsed.keywords.clone()),
        };

        let mut expunge = false;
        for sync in queue.advance(uid) {
            if sync.is_expunge() {
                expunge = true;
            } else {
                sync.apply(&mut flags, &mut keywords);
            }
        }
        if expunge {
            debug!(uid, offset = rec.from_offset, "Expunging");
            if entry.is_some() {
                tx.expunge(uid);
            }
            return Ok(RecordKind::Expunged { space: rec.footprint() });
        }

        let holds_base = !self.pseudo_seen && !self.holder_seen;
        self.holder_seen = true;
        let validity = self.validity();
        let base_stale = holds_base
            && parsed
                .base
                .map_or(true, |b| b.validity != validity || b.uid_last_pos.is_none());

        let content_differs = assigned
            || parsed.uid != Some(uid)
            || flags != header_flags
            || !same_keywords(&keywords, &parsed.keywords);
        let length_wrong = parsed.content_length != Some(rec.body_size);
        if length_wrong {
            if let Some(declared) = parsed.content_length {
                debug!(uid, declared, actual = rec.body_size, "Wrong Content-Length");
            }
        }
        let dirty = self.opts.delay_writes && content_differs;
        let need_rewrite = !self.opts.delay_writes
            && (content_differs || recent || base_stale || index_dirty || length_wrong);

        let mut index_flags = flags;
        if recent && entry.map_or(true, |e| e.flags.contains(MailFlags::RECENT)) {
            index_flags |= MailFlags::RECENT;
        }
        if dirty {
            index_flags |= MailFlags::DIRTY;
        }
        match entry {
            None => {
                tx.append(IndexRecord {
                    uid,
                    flags: index_flags,
                    keywords: keywords.clone(),
                    from_offset: rec.from_offset,
                    digest: Some(parsed.digest),
                });
                self.stats.appended += 1;
            }
            Some(e) => {
                if e.flags != index_flags || !same_keywords(&e.keywords, &keywords) {
                    tx.set_flags(uid, index_flags, keywords.clone());
                }
                if e.digest != Some(parsed.digest) {
                    tx.set_digest(uid, parsed.digest);
                }
            }
        }

        Ok(RecordKind::Live(MailState {
            uid,
            flags,
            keywords,
            recent,
            dirty,
            need_rewrite,
            holds_base,
        }))
    }

    fn check_base(&mut self, base: BaseInfo) -> Result<()> {
        if self.opts.renumber_validity.is_some() {
            return Ok(());
        }
        if self.validity == 0 {
            debug!(validity = base.validity, "Adopting UID validity from mailbox");
            self.validity = base.validity;
        } else if base.validity != self.validity {
            return Err(MboxError::IdentityCorruption {
                path: self.path.clone(),
                reason: format!(
                    "UID validity {} in mailbox, {} in index",
                    base.validity, self.validity
                ),
            });
        }
        let after_last = base.uid_last.saturating_add(1);
        if after_last > self.next_uid {
            self.next_uid = after_last;
            self.uid_limit = self.uid_limit.max(after_last);
        }
        Ok(())
    }

    fn identify(&mut self, parsed: &ParsedHeader, tx: &mut IndexTransaction) -> Result<Identity<'a>> {
        let records = self.records;
        let header_uid = parsed.uid.filter(|_| self.opts.renumber_validity.is_none());
        if let Some(uid) = header_uid {
            if uid <= self.prev_uid {
                if uid == self.prev_uid
                    && self.prev_digest == Some(parsed.digest)
                    && !self.opts.readonly
                {
                    debug!(uid, "Duplicate of the previous message");
                    return Ok(Identity::Dead);
                }
            } else if uid > self.uid_limit && self.identity_known {
                return Err(MboxError::IdentityCorruption {
                    path: self.path.clone(),
                    reason: format!("UID {uid} is beyond the next UID {}", self.uid_limit),
                });
            } else {
                let pos = self.cursor + records[self.cursor..].partition_point(|r| r.uid < uid);
                if records.get(pos).is_some_and(|r| r.uid == uid) {
                    self.expunge_range(self.cursor, pos, tx);
                    self.cursor = pos + 1;
                    return Ok(Identity::Known {
                        uid,
                        entry: Some(&records[pos]),
                        assigned: false,
                    });
                }
                if uid >= self.index_next_uid {
                    self.expunge_range(self.cursor, pos, tx);
                    self.cursor = pos;
                    // Delivered with the next UID already set.
                    self.next_uid = self.next_uid.max(uid.saturating_add(1));
                    self.uid_limit = self.uid_limit.max(self.next_uid);
                    return Ok(Identity::Known {
                        uid,
                        entry: None,
                        assigned: false,
                    });
                }
            }
            warn!(
                path = %self.path.display(),
                uid,
                prev = self.prev_uid,
                "Broken UID"
            );
            self.uids_broken = true;
            self.stats.broken_uids += 1;
        }

        // Missing or unusable X-UID: look for the message by header digest.
        if let Some(off) = records[self.cursor..]
            .iter()
            .position(|r| r.digest == Some(parsed.digest))
        {
            let pos = self.cursor + off;
            self.expunge_range(self.cursor, pos, tx);
            self.cursor = pos + 1;
            let entry = &records[pos];
            debug!(uid = entry.uid, "Matched message by header digest");
            self.stats.adopted_by_digest += 1;
            return Ok(Identity::Known {
                uid: entry.uid,
                entry: Some(entry),
                assigned: false,
            });
        }

        // A new message: anything still unmatched would now be out of order.
        self.expunge_range(self.cursor, records.len(), tx);
        self.cursor = records.len();
        if self.next_uid == u32::MAX {
            return Err(MboxError::IdentifierExhaustion(self.path.clone()));
        }
        let uid = self.next_uid;
        self.next_uid += 1;
        debug!(uid, "Assigned new UID");
        Ok(Identity::Known {
            uid,
            entry: None,
            assigned: true,
        })
    }

    fn expunge_range(&mut self, from: usize, to: usize, tx: &mut IndexTransaction) {
        for record in &self.records[from..to] {
            debug!(uid = record.uid, "Message vanished from mailbox");
            tx.expunge(record.uid);
            self.stats.vanished += 1;
        }
    }
}

/// A UID validity newer than `previous`, based on the current time.
pub fn fresh_validity(previous: u32) -> u32 {
    let now = u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX);
    now.max(previous.saturating_add(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::header::parse_header;

    const FROM: &[u8] = b"From a@x Thu Jan  4 10:00:00 2024\n";

    fn scanned(seq: u32, offset: u64, header: &[u8]) -> ScannedRecord {
        ScannedRecord {
            seq,
            from_offset: offset,
            hdr_offset: offset + FROM.len() as u64,
            body_offset: offset + FROM.len() as u64 + header.len() as u64,
            body_size: 5,
            separator_len: 1,
            from_line: FROM.to_vec(),
            header: header.to_vec(),
        }
    }

    fn entry(uid: u32, digest: Option<HeaderDigest>) -> IndexRecord {
        IndexRecord {
            flags: MailFlags::SEEN,
            digest,
            ..IndexRecord::new(uid)
        }
    }

    fn opts() -> ReconcileOptions {
        ReconcileOptions {
            delay_writes: false,
            readonly: false,
            renumber_validity: None,
            uid_floor: 0,
        }
    }

    fn live(kind: RecordKind) -> MailState {
        match kind {
            RecordKind::Live(state) => state,
            other => panic!("expected a live record, got {other:?}"),
        }
    }

    #[test]
    fn test_queue_activation() {
        let records = vec![
            SyncRecord::new(5, 5, SyncKind::Expunge).unwrap(),
            SyncRecord::new(2, 3, SyncKind::KeywordReset).unwrap(),
            SyncRecord::new(9, 12, SyncKind::Append).unwrap(),
        ];
        let mut queue = SyncQueue::new(&records, false);
        assert_eq!(queue.appended_next_uid(), Some(13));
        assert_eq!(queue.next_pending_uid(), Some(2));
        assert!(queue.advance(1).is_empty());
        assert_eq!(queue.advance(2).len(), 1);
        assert!(queue.has_active_beyond(2));
        assert_eq!(queue.advance(4).len(), 0);
        assert_eq!(queue.advance(5).len(), 1);
        assert!(queue.into_remaining(true).is_empty());
    }

    #[test]
    fn test_queue_keeps_expunges_when_readonly() {
        let records = vec![SyncRecord::new(1, 1, SyncKind::Expunge).unwrap()];
        let mut queue = SyncQueue::new(&records, true);
        assert!(queue.advance(1).is_empty());
        assert_eq!(queue.into_remaining(true).len(), 1);
    }

    #[test]
    fn test_known_uid_matches_and_vanished_entries_expunged() {
        let records = vec![entry(1, None), entry(2, None), entry(3, None)];
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 4, None, opts());
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();

        let header =
            b"X-IMAPbase: 5 0000000003\nStatus: RO\nX-Keywords:\nX-UID: 1\nContent-Length: 5\n\n";
        let state = live(
            rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx)
                .unwrap(),
        );
        assert_eq!(state.uid, 1);
        assert!(state.holds_base);
        assert!(!state.need_rewrite);

        let header = b"Status: RO\nX-Keywords:\nX-UID: 3\n\n";
        let state = live(
            rec.reconcile(&scanned(2, 200, header), &parse_header(header), &mut queue, &mut tx)
                .unwrap(),
        );
        assert_eq!(state.uid, 3);
        assert_eq!(rec.stats().vanished, 1);
        assert_eq!(rec.next_uid(), 4);
    }

    #[test]
    fn test_wrong_content_length_needs_rewrite() {
        let records = vec![entry(1, None)];
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 2, None, opts());
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        let header =
            b"X-IMAPbase: 5 0000000001\nStatus: RO\nX-Keywords:\nX-UID: 1\nContent-Length: 2\n\n";
        let state = live(
            rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx)
                .unwrap(),
        );
        assert!(state.need_rewrite);
        assert!(!state.dirty);
    }

    #[test]
    fn test_missing_uid_gets_next_uid() {
        let mut rec = Reconciler::new(Path::new("mbox"), &[], 0, 1, None, opts());
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        let header = b"Subject: hi\n\n";
        let state = live(
            rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx)
                .unwrap(),
        );
        assert_eq!(state.uid, 1);
        assert!(state.need_rewrite);
        assert!(state.recent);
        assert_eq!(rec.next_uid(), 2);
        assert_eq!(rec.stats().appended, 1);
        assert!(rec.validity() > 0);
    }

    #[test]
    fn test_digest_adoption() {
        let header = b"Subject: hi\nStatus: RO\n\n";
        let parsed = parse_header(header);
        let records = vec![entry(7, Some(parsed.digest))];
        let lazy = ReconcileOptions {
            delay_writes: true,
            ..opts()
        };
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 8, None, lazy);
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        let state = live(
            rec.reconcile(&scanned(1, 0, header), &parsed, &mut queue, &mut tx)
                .unwrap(),
        );
        assert_eq!(state.uid, 7);
        assert!(state.dirty);
        assert!(!state.need_rewrite);
        assert_eq!(rec.next_uid(), 8);
        assert_eq!(rec.stats().adopted_by_digest, 1);
    }

    #[test]
    fn test_uid_beyond_next_is_corruption() {
        let records = vec![entry(1, None)];
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 2, None, opts());
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        let header = b"X-UID: 40\n\n";
        assert!(matches!(
            rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx),
            Err(MboxError::IdentityCorruption { .. })
        ));
    }

    #[test]
    fn test_uid_equal_to_next_is_accepted() {
        let records = vec![entry(1, None), entry(2, None)];
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 3, None, opts());
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        for (seq, uid) in [(1u32, 1u32), (2, 2), (3, 3), (4, 4)] {
            let header = format!("Status: RO\nX-Keywords:\nX-UID: {uid}\n\n");
            let state = live(
                rec.reconcile(
                    &scanned(seq, u64::from(seq) * 200, header.as_bytes()),
                    &parse_header(header.as_bytes()),
                    &mut queue,
                    &mut tx,
                )
                .unwrap(),
            );
            assert_eq!(state.uid, uid);
        }
        assert_eq!(rec.next_uid(), 5);
        assert!(!rec.uids_broken());
        assert_eq!(rec.stats().appended, 2);

        // A gap past the next UID is still corruption.
        let header = b"Status: RO\nX-Keywords:\nX-UID: 9\n\n";
        assert!(matches!(
            rec.reconcile(&scanned(5, 1000, header), &parse_header(header), &mut queue, &mut tx),
            Err(MboxError::IdentityCorruption { .. })
        ));
    }

    #[test]
    fn test_uid_floor_accepts_uids_from_aborted_attempt() {
        let records = vec![entry(1, None)];
        let floor = ReconcileOptions {
            uid_floor: 5,
            ..opts()
        };
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 2, None, floor);
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        let header = b"X-UID: 3\n\n";
        let state = live(
            rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx)
                .unwrap(),
        );
        assert_eq!(state.uid, 3);
        assert_eq!(rec.next_uid(), 4);
    }

    #[test]
    fn test_duplicate_is_dead_and_collision_is_broken() {
        let records = vec![entry(1, None)];
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 2, None, opts());
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        let header = b"Subject: same\nX-UID: 1\n\n";
        rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx)
            .unwrap();
        let dup = rec
            .reconcile(&scanned(2, 100, header), &parse_header(header), &mut queue, &mut tx)
            .unwrap();
        assert!(matches!(dup, RecordKind::Expunged { .. }));

        let other = b"Subject: different\nX-UID: 1\n\n";
        let state = live(
            rec.reconcile(&scanned(3, 200, other), &parse_header(other), &mut queue, &mut tx)
                .unwrap(),
        );
        assert_eq!(state.uid, 2);
        assert!(rec.uids_broken());
    }

    #[test]
    fn test_validity_mismatch() {
        let mut rec = Reconciler::new(Path::new("mbox"), &[], 5, 1, None, opts());
        let mut queue = SyncQueue::new(&[], false);
        let mut tx = IndexTransaction::new();
        let header = b"X-IMAPbase: 6 0000000000\n\n";
        assert!(matches!(
            rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx),
            Err(MboxError::IdentityCorruption { .. })
        ));
    }

    #[test]
    fn test_sync_records_apply() {
        let records = vec![entry(1, None)];
        let mut rec = Reconciler::new(Path::new("mbox"), &records, 5, 2, None, opts());
        let syncs = vec![
            SyncRecord::new(
                1,
                1,
                SyncKind::Flags {
                    add: MailFlags::FLAGGED,
                    remove: MailFlags::empty(),
                },
            )
            .unwrap(),
            SyncRecord::new(1, 1, SyncKind::KeywordAdd("work".into())).unwrap(),
        ];
        let mut queue = SyncQueue::new(&syncs, false);
        let mut tx = IndexTransaction::new();
        let header = b"X-IMAPbase: 5 0000000001\nStatus: RO\nX-Keywords:\nX-UID: 1\n\n";
        let state = live(
            rec.reconcile(&scanned(1, 0, header), &parse_header(header), &mut queue, &mut tx)
                .unwrap(),
        );
        assert!(state.flags.contains(MailFlags::FLAGGED | MailFlags::SEEN));
        assert_eq!(state.keywords, vec!["work".to_string()]);
        assert!(state.need_rewrite);
    }

    #[test]
    fn test_fresh_validity_increases() {
        assert!(fresh_validity(u32::MAX - 1) == u32::MAX);
        assert!(fresh_validity(0) > 0);
    }
}
