//! The message index: per-UID state, pending sync records, and the
//! mailbox-wide header, with transactional updates and persistence.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::{MboxError, Result};
use crate::index::format::{IndexFlags, IndexHeader, HEADER_SIZE};
use crate::model::flags::MailFlags;
use crate::model::sync_record::SyncRecord;
use crate::parser::header::HeaderDigest;
use crate::store::file::Fingerprint;

/// Index state of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub uid: u32,
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    /// Offset of the `From ` line when last seen.
    pub from_offset: u64,
    /// Digest of the unmanaged headers, used to re-identify the message
    /// when its `X-UID` is lost.
    pub digest: Option<HeaderDigest>,
}

impl IndexRecord {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            flags: MailFlags::empty(),
            keywords: Vec::new(),
            from_offset: 0,
            digest: None,
        }
    }
}

/// Serialized index body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct IndexBody {
    records: Vec<IndexRecord>,
    pending: Vec<SyncRecord>,
}

// ── Transactions ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum IndexOp {
    Expunge(u32),
    SetFlags {
        uid: u32,
        flags: MailFlags,
        keywords: Vec<String>,
    },
    SetOffset { uid: u32, from_offset: u64 },
    SetDigest { uid: u32, digest: HeaderDigest },
    Append(IndexRecord),
}

/// A batch of index changes applied together by [`MailIndex::commit`].
///
/// Nothing is visible until commit; dropping an uncommitted transaction
/// discards it.
#[derive(Debug, Default)]
pub struct IndexTransaction {
    ops: Vec<IndexOp>,
    expunge_all: bool,
    uid_validity: Option<u32>,
    next_uid: Option<u32>,
    sync_fingerprint: Option<Fingerprint>,
    dirty_fingerprint: Option<Fingerprint>,
    set_flags: IndexFlags,
    clear_flags: IndexFlags,
    pending: Option<Vec<SyncRecord>>,
}

impl IndexTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
            && !self.expunge_all
            && self.uid_validity.is_none()
            && self.next_uid.is_none()
            && self.sync_fingerprint.is_none()
            && self.dirty_fingerprint.is_none()
            && self.set_flags.is_empty()
            && self.clear_flags.is_empty()
            && self.pending.is_none()
    }

    pub fn append(&mut self, record: IndexRecord) {
        self.ops.push(IndexOp::Append(record));
    }

    pub fn expunge(&mut self, uid: u32) {
        self.ops.push(IndexOp::Expunge(uid));
    }

    /// Drop every existing record (renumbering).
    pub fn expunge_all(&mut self) {
        self.expunge_all = true;
    }

    pub fn set_flags(&mut self, uid: u32, flags: MailFlags, keywords: Vec<String>) {
        self.ops.push(IndexOp::SetFlags {
            uid,
            flags,
            keywords,
        });
    }

    pub fn set_offset(&mut self, uid: u32, from_offset: u64) {
        self.ops.push(IndexOp::SetOffset { uid, from_offset });
    }

    pub fn set_digest(&mut self, uid: u32, digest: HeaderDigest) {
        self.ops.push(IndexOp::SetDigest { uid, digest });
    }

    pub fn set_uid_validity(&mut self, validity: u32) {
        self.uid_validity = Some(validity);
    }

    pub fn set_next_uid(&mut self, next_uid: u32) {
        self.next_uid = Some(next_uid);
    }

    pub fn set_sync_fingerprint(&mut self, fp: Fingerprint) {
        self.sync_fingerprint = Some(fp);
    }

    pub fn set_dirty_fingerprint(&mut self, fp: Fingerprint) {
        self.dirty_fingerprint = Some(fp);
    }

    pub fn add_header_flags(&mut self, flags: IndexFlags) {
        self.set_flags |= flags;
        self.clear_flags &= !flags;
    }

    pub fn remove_header_flags(&mut self, flags: IndexFlags) {
        self.clear_flags |= flags;
        self.set_flags &= !flags;
    }

    /// Replace the pending sync queue.
    pub fn set_pending(&mut self, pending: Vec<SyncRecord>) {
        self.pending = Some(pending);
    }

    /// Discard the transaction.
    pub fn rollback(self) {
        debug!(ops = self.ops.len(), "Index transaction rolled back");
    }

    /// Apply to `header` and `body` in place: expunges, then updates, then appends.
    fn apply(self, header: &mut IndexHeader, body: &mut IndexBody) -> Result<()> {
        let mut records = if self.expunge_all {
            Vec::new()
        } else {
            std::mem::take(&mut body.records)
        };

        let expunged: std::collections::HashSet<u32> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                IndexOp::Expunge(uid) => Some(*uid),
                _ => None,
            })
            .collect();
        if !expunged.is_empty() {
            records.retain(|r| !expunged.contains(&r.uid));
        }

        let mut appends: Vec<IndexRecord> = Vec::new();
        for op in self.ops {
            match op {
                IndexOp::Expunge(_) => {}
                IndexOp::Append(rec) => appends.push(rec),
                IndexOp::SetFlags {
                    uid,
                    flags,
                    keywords,
                } => {
                    if let Some(rec) = record_mut(&mut records, &mut appends, uid) {
                        rec.flags = flags;
                        rec.keywords = keywords;
                    }
                }
                IndexOp::SetOffset { uid, from_offset } => {
                    if let Some(rec) = record_mut(&mut records, &mut appends, uid) {
                        rec.from_offset = from_offset;
                    }
                }
                IndexOp::SetDigest { uid, digest } => {
                    if let Some(rec) = record_mut(&mut records, &mut appends, uid) {
                        rec.digest = Some(digest);
                    }
                }
            }
        }

        for rec in appends {
            if let Some(last) = records.last() {
                if rec.uid <= last.uid {
                    return Err(MboxError::SpaceAccounting(format!(
                        "index append of UID {} after UID {}",
                        rec.uid, last.uid
                    )));
                }
            }
            records.push(rec);
        }

        if let Some(validity) = self.uid_validity {
            header.uid_validity = validity;
        }
        if let Some(next_uid) = self.next_uid {
            header.next_uid = next_uid;
        }
        if let Some(last) = records.last() {
            header.next_uid = header.next_uid.max(last.uid.saturating_add(1));
        }
        if let Some(fp) = self.sync_fingerprint {
            header.sync_fingerprint = fp;
        }
        if let Some(fp) = self.dirty_fingerprint {
            header.dirty_fingerprint = fp;
        }
        header.flags |= self.set_flags;
        header.flags &= !self.clear_flags;
        if let Some(pending) = self.pending {
            body.pending = pending;
        }
        body.records = records;
        header.message_count = body.records.len() as u64;
        Ok(())
    }
}

/// Existing record or one appended earlier in the same transaction.
fn record_mut<'a>(
    records: &'a mut [IndexRecord],
    appends: &'a mut [IndexRecord],
    uid: u32,
) -> Option<&'a mut IndexRecord> {
    match records.binary_search_by_key(&uid, |r| r.uid) {
        Ok(i) => Some(&mut records[i]),
        Err(_) => appends.iter_mut().find(|r| r.uid == uid),
    }
}

// ── Index interface ─────────────────────────────────────────────

/// What the sync engine needs from an index.
pub trait MailIndex {
    fn header(&self) -> &IndexHeader;

    /// All records in UID order.
    fn records(&self) -> &[IndexRecord];

    /// Pending sync records, ordered by `uid1`.
    fn pending_syncs(&self) -> &[SyncRecord];

    /// Queue a change to be written to the mailbox by the next sync.
    fn queue_sync(&mut self, record: SyncRecord) -> Result<()>;

    /// Apply a transaction atomically.
    fn commit(&mut self, tx: IndexTransaction) -> Result<()>;

    /// Flag the index as irreconcilable with its mailbox.
    fn mark_corrupted(&mut self, reason: &str) -> Result<()>;

    /// Re-read persisted state written by another process.
    fn refresh(&mut self) -> Result<()>;

    /// Forget everything: records, pending syncs, UID validity.
    fn reset(&mut self) -> Result<()>;

    /// Record at 1-based sequence `seq`.
    fn lookup_seq(&self, seq: u32) -> Option<&IndexRecord> {
        let i = (seq as usize).checked_sub(1)?;
        self.records().get(i)
    }

    /// 1-based sequence and record for `uid`.
    fn lookup_uid(&self, uid: u32) -> Option<(u32, &IndexRecord)> {
        let records = self.records();
        let i = records.binary_search_by_key(&uid, |r| r.uid).ok()?;
        Some((i as u32 + 1, &records[i]))
    }

    /// Sequence range of the records with UIDs in `uid1..=uid2`.
    fn lookup_uid_range(&self, uid1: u32, uid2: u32) -> Option<(u32, u32)> {
        let records = self.records();
        let start = records.partition_point(|r| r.uid < uid1);
        let end = records.partition_point(|r| r.uid <= uid2);
        (start < end).then(|| (start as u32 + 1, end as u32))
    }

    fn begin(&self) -> IndexTransaction {
        IndexTransaction::new()
    }
}

// ── File-backed index ───────────────────────────────────────────

/// Index persisted as a single file, or kept in memory only.
#[derive(Debug)]
pub struct FileIndex {
    /// `None` for an in-memory index.
    path: Option<PathBuf>,
    /// Cache-directory location used when `path` is not writable.
    fallback: Option<PathBuf>,
    header: IndexHeader,
    body: IndexBody,
}

impl FileIndex {
    /// An index that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            fallback: None,
            header: IndexHeader::default(),
            body: IndexBody::default(),
        }
    }

    /// Load the index for `mbox_path`, or start a fresh one.
    ///
    /// Looks beside the mailbox (or in `index_dir`) first, then in the
    /// cache directory. An unreadable or mismatched index is replaced.
    pub fn open(mbox_path: &Path, index_dir: Option<&Path>) -> Result<Self> {
        let primary = index_path_for(mbox_path, index_dir);
        let cache = cache_index_path_for(mbox_path);
        let path = if !primary.exists() && cache.exists() {
            cache.clone()
        } else {
            primary
        };
        let mut index = Self {
            path: Some(path.clone()),
            fallback: (path != cache).then_some(cache),
            header: IndexHeader::default(),
            body: IndexBody::default(),
        };
        if let Some((header, body)) = load_index_file(&path)? {
            debug!(
                path = %path.display(),
                count = body.records.len(),
                "Loaded existing index"
            );
            index.header = header;
            index.body = body;
        }
        Ok(index)
    }

    /// Where the index is stored, if anywhere.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let body_bytes = bincode::serialize(&self.body).map_err(|e| MboxError::InvalidIndex {
            path: path.clone(),
            reason: format!("Body serialization failed: {e}"),
        })?;
        self.header.message_count = self.body.records.len() as u64;
        self.header.body_sha256 = Sha256::digest(&body_bytes).into();
        let header_bytes = self
            .header
            .to_padded_bytes()
            .map_err(|e| MboxError::InvalidIndex {
                path: path.clone(),
                reason: format!("Header serialization failed: {e}"),
            })?;

        match write_index_file(&path, &header_bytes, &body_bytes) {
            Ok(()) => {
                debug!(path = %path.display(), "Index written");
                return Ok(());
            }
            Err(e) => {
                let Some(cache) = self.fallback.take() else {
                    return Err(e);
                };
                debug!(error = %e, "Cannot write index next to mailbox, trying cache dir");
                if let Some(parent) = cache.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| MboxError::io(parent, e))?;
                }
                write_index_file(&cache, &header_bytes, &body_bytes)?;
                info!(path = %cache.display(), "Index written to cache");
                self.path = Some(cache);
            }
        }
        Ok(())
    }
}

impl MailIndex for FileIndex {
    fn header(&self) -> &IndexHeader {
        &self.header
    }

    fn records(&self) -> &[IndexRecord] {
        &self.body.records
    }

    fn pending_syncs(&self) -> &[SyncRecord] {
        &self.body.pending
    }

    fn queue_sync(&mut self, record: SyncRecord) -> Result<()> {
        let at = self
            .body
            .pending
            .partition_point(|r| r.uid1 <= record.uid1);
        self.body.pending.insert(at, record);
        self.save()
    }

    fn commit(&mut self, tx: IndexTransaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut header = self.header.clone();
        let mut body = self.body.clone();
        tx.apply(&mut header, &mut body)?;
        let (old_header, old_body) = (
            std::mem::replace(&mut self.header, header),
            std::mem::replace(&mut self.body, body),
        );
        if let Err(e) = self.save() {
            self.header = old_header;
            self.body = old_body;
            return Err(e);
        }
        Ok(())
    }

    fn mark_corrupted(&mut self, reason: &str) -> Result<()> {
        error!(reason, "Marking index corrupted");
        self.header.flags |= IndexFlags::CORRUPTED;
        self.save()
    }

    fn refresh(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some((header, body)) = load_index_file(path)? {
            self.header = header;
            self.body = body;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        info!("Resetting index");
        self.header = IndexHeader::default();
        self.body = IndexBody::default();
        self.save()
    }
}

/// Read and validate an index file. `None` when it is missing or unusable.
fn load_index_file(path: &Path) -> Result<Option<(IndexHeader, IndexBody)>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MboxError::io(path, e)),
    };

    if data.len() < HEADER_SIZE {
        warn!(path = %path.display(), "Index file too small, starting fresh");
        return Ok(None);
    }

    let header: IndexHeader = match bincode::deserialize(&data[..HEADER_SIZE]) {
        Ok(h) => h,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Index header unreadable, starting fresh");
            return Ok(None);
        }
    };
    if let Err(reason) = header.validate() {
        warn!(path = %path.display(), reason = %reason, "Index header invalid, starting fresh");
        return Ok(None);
    }

    let body_bytes = &data[HEADER_SIZE..];
    let checksum: [u8; 32] = Sha256::digest(body_bytes).into();
    if checksum != header.body_sha256 {
        warn!(path = %path.display(), "Index checksum mismatch, starting fresh");
        return Ok(None);
    }

    let body: IndexBody = match bincode::deserialize(body_bytes) {
        Ok(b) => b,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Index body unreadable, starting fresh");
            return Ok(None);
        }
    };
    if body.records.len() as u64 != header.message_count {
        warn!(path = %path.display(), "Index message count mismatch, starting fresh");
        return Ok(None);
    }
    Ok(Some((header, body)))
}

/// Write header + body to a temporary file and rename it over `path`.
fn write_index_file(path: &Path, header: &[u8], body: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp).map_err(|e| MboxError::io(&tmp, e))?;
    file.write_all(header).map_err(|e| MboxError::io(&tmp, e))?;
    file.write_all(body).map_err(|e| MboxError::io(&tmp, e))?;
    file.sync_data().map_err(|e| MboxError::io(&tmp, e))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(|e| MboxError::io(path, e))?;
    Ok(())
}

/// Primary index path: hidden file next to the mailbox, or a hashed name
/// inside `index_dir` when one is configured.
///
/// Example: `/data/inbox` → `/data/.inbox.mboxsync.idx`
pub fn index_path_for(mbox_path: &Path, index_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = index_dir {
        return dir.join(format!("{}.idx", path_hash(mbox_path)));
    }
    let filename = mbox_path.file_name().unwrap_or_default().to_string_lossy();
    mbox_path.with_file_name(format!(".{filename}.mboxsync.idx"))
}

/// Fallback index path inside the user cache directory.
///
/// Example: `~/.cache/mboxsync/<sha256_of_path>.idx`
pub fn cache_index_path_for(mbox_path: &Path) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("mboxsync")
        .join(format!("{}.idx", path_hash(mbox_path)))
}

fn path_hash(mbox_path: &Path) -> String {
    let absolute = std::fs::canonicalize(mbox_path).unwrap_or_else(|_| mbox_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(absolute.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Return the size in bytes of the index file for the given mailbox (0 if missing).
pub fn index_file_size(mbox_path: &Path, index_dir: Option<&Path>) -> u64 {
    std::fs::metadata(index_path_for(mbox_path, index_dir))
        .or_else(|_| std::fs::metadata(cache_index_path_for(mbox_path)))
        .map(|m| m.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sync_record::SyncKind;

    fn record(uid: u32) -> IndexRecord {
        IndexRecord::new(uid)
    }

    #[test]
    fn test_commit_applies_in_order() {
        let mut index = FileIndex::in_memory();
        let mut tx = index.begin();
        tx.append(record(1));
        tx.append(record(2));
        tx.append(record(5));
        tx.set_uid_validity(42);
        index.commit(tx).unwrap();
        assert_eq!(index.header().next_uid, 6);
        assert_eq!(index.header().uid_validity, 42);

        let mut tx = index.begin();
        tx.expunge(2);
        tx.set_flags(5, MailFlags::SEEN, vec!["work".into()]);
        tx.set_offset(5, 900);
        tx.append(record(6));
        index.commit(tx).unwrap();

        let uids: Vec<u32> = index.records().iter().map(|r| r.uid).collect();
        assert_eq!(uids, vec![1, 5, 6]);
        let (seq, rec) = index.lookup_uid(5).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(rec.flags, MailFlags::SEEN);
        assert_eq!(rec.from_offset, 900);
        assert_eq!(index.lookup_uid_range(2, 5), Some((2, 2)));
        assert_eq!(index.lookup_uid_range(2, 4), None);
        assert_eq!(index.lookup_seq(3).unwrap().uid, 6);
    }

    #[test]
    fn test_append_out_of_order_rejected() {
        let mut index = FileIndex::in_memory();
        let mut tx = index.begin();
        tx.append(record(3));
        index.commit(tx).unwrap();

        let mut tx = index.begin();
        tx.append(record(2));
        assert!(index.commit(tx).is_err());
        assert_eq!(index.records().len(), 1);
    }

    #[test]
    fn test_dropped_transaction_changes_nothing() {
        let mut index = FileIndex::in_memory();
        {
            let mut tx = index.begin();
            tx.append(record(1));
        }
        assert!(index.records().is_empty());
        assert_eq!(index.header().next_uid, 1);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mbox = dir.path().join("inbox");
        std::fs::write(&mbox, b"").unwrap();

        let mut index = FileIndex::open(&mbox, None).unwrap();
        assert_eq!(
            index.path().unwrap(),
            dir.path().join(".inbox.mboxsync.idx").as_path()
        );
        let mut tx = index.begin();
        tx.append(record(1));
        tx.set_uid_validity(7);
        index.commit(tx).unwrap();
        index
            .queue_sync(SyncRecord::new(1, 1, SyncKind::Expunge).unwrap())
            .unwrap();

        let again = FileIndex::open(&mbox, None).unwrap();
        assert_eq!(again.header().uid_validity, 7);
        assert_eq!(again.records().len(), 1);
        assert_eq!(again.pending_syncs().len(), 1);
    }

    #[test]
    fn test_damaged_index_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mbox = dir.path().join("inbox");
        std::fs::write(&mbox, b"").unwrap();
        let mut index = FileIndex::open(&mbox, None).unwrap();
        let mut tx = index.begin();
        tx.append(record(1));
        index.commit(tx).unwrap();

        let path = index.path().unwrap().to_path_buf();
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let fresh = FileIndex::open(&mbox, None).unwrap();
        assert!(fresh.records().is_empty());
    }

    #[test]
    fn test_queue_sync_keeps_order() {
        let mut index = FileIndex::in_memory();
        index
            .queue_sync(SyncRecord::new(5, 6, SyncKind::Expunge).unwrap())
            .unwrap();
        index
            .queue_sync(SyncRecord::new(2, 9, SyncKind::KeywordReset).unwrap())
            .unwrap();
        let firsts: Vec<u32> = index.pending_syncs().iter().map(|r| r.uid1).collect();
        assert_eq!(firsts, vec![2, 5]);
    }

    #[test]
    fn test_index_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = index_path_for(Path::new("/var/mail/inbox"), Some(dir.path()));
        assert!(path.starts_with(dir.path()));
        assert!(path.to_string_lossy().ends_with(".idx"));
    }
}
