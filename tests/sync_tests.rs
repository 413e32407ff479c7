//! Integration tests for the sync engine: UID assignment, header rewrites,
//! expunges, space reclamation, fast paths and recovery.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use assert_fs::prelude::*;
use predicates::prelude::*;

use mboxsync::config::Config;
use mboxsync::error::MboxError;
use mboxsync::index::store::{FileIndex, IndexTransaction, MailIndex};
use mboxsync::lock::LockKind;
use mboxsync::model::flags::MailFlags;
use mboxsync::model::record::ScannedRecord;
use mboxsync::model::sync_record::{SyncKind, SyncRecord};
use mboxsync::parser::header::{parse_header, render_header, HeaderFields};
use mboxsync::parser::mbox::RecordScanner;
use mboxsync::store::file::MboxFile;
use mboxsync::sync::{Mailbox, ScanMode, SyncFlags};

fn config() -> Config {
    let mut config = Config::default();
    config.sync.lock_timeout_ms = 200;
    config.sync.touch_interval_ms = 5;
    config.general.hostname = "test.invalid".into();
    config
}

fn message(sender: &str, subject: &str, body: &str) -> String {
    format!(
        "From {sender} Thu Jan  4 10:00:00 2024\n\
         From: {sender}\n\
         Subject: {subject}\n\
         \n\
         {body}\n"
    )
}

/// Messages joined by the blank line that separates mbox records.
fn mbox_text(messages: &[String]) -> String {
    messages.join("\n")
}

fn three() -> String {
    mbox_text(&[
        message("a@example.com", "one", "first body"),
        message("b@example.com", "two", "second body, a little longer than the others"),
        message("c@example.com", "three", "third body"),
    ])
}

fn write_mbox(dir: &assert_fs::TempDir, content: &[u8]) -> PathBuf {
    let file = dir.child("test.mbox");
    file.write_binary(content).unwrap();
    file.path().to_path_buf()
}

fn scan(path: &Path) -> Vec<ScannedRecord> {
    let file = MboxFile::open_readonly(path).unwrap();
    let mut scanner = RecordScanner::new(&file).unwrap();
    let mut records = Vec::new();
    while let Some(rec) = scanner.next().unwrap() {
        records.push(rec);
    }
    records
}

/// UIDs from the `X-UID` headers, placeholder record excluded.
fn file_uids(path: &Path) -> Vec<Option<u32>> {
    scan(path)
        .iter()
        .map(|r| parse_header(&r.header))
        .filter(|h| !h.pseudo)
        .map(|h| h.uid)
        .collect()
}

fn index_uids(mbox: &Mailbox) -> Vec<u32> {
    mbox.index().records().iter().map(|r| r.uid).collect()
}

fn queue(mbox: &mut Mailbox, uid1: u32, uid2: u32, kind: SyncKind) {
    mbox.queue(SyncRecord::new(uid1, uid2, kind).unwrap()).unwrap();
}

fn append(path: &Path, text: &str) {
    let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    f.write_all(b"\n").unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

/// Move the modification time so an in-place edit is noticed.
fn bump_mtime(path: &Path) {
    let f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();
}

/// Every byte of the file belongs to a record and every declared
/// `Content-Length` is exact.
fn assert_well_formed(path: &Path) {
    let len = std::fs::metadata(path).unwrap().len();
    let records = scan(path);
    let total: u64 = records.iter().map(|r| r.footprint()).sum();
    assert_eq!(total, len, "record footprints must cover the file");
    let bytes = std::fs::read(path).unwrap();
    assert!(!bytes.contains(&0), "no zero fill may remain");
    for rec in &records {
        if let Some(declared) = parse_header(&rec.header).content_length {
            assert_eq!(declared, rec.body_size, "Content-Length of record {}", rec.seq);
        }
    }
}

// ─── Test 1: First sync assigns UIDs and writes headers ─────────────

#[test]
fn test_first_sync_writes_headers() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();

    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.mode, Some(ScanMode::FullScan));
    assert_eq!(report.appended, 3);
    assert_eq!(report.headers_rewritten, 3);
    assert!(report.size_after > report.size_before);
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
    assert_eq!(file_uids(&path), vec![Some(1), Some(2), Some(3)]);
    assert_well_formed(&path);

    let validity = mbox.index().header().uid_validity;
    dir.child("test.mbox").assert(
        predicate::str::contains(format!("X-IMAPbase: {validity} 0000000003\n"))
            .and(predicate::str::contains("Subject: two\n"))
            .and(predicate::str::contains("second body, a little longer")),
    );
    let first = parse_header(&scan(&path)[0].header);
    assert!(!first.flags.contains(MailFlags::RECENT));

    // New messages are recent in the index.
    assert!(mbox.index().records().iter().all(|r| r.flags.contains(MailFlags::RECENT)));
}

// ─── Test 2: Index persists and a second sync does nothing ──────────

#[test]
fn test_resync_after_reopen_is_a_no_op() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    {
        let mut mbox = Mailbox::open(&path, &config()).unwrap();
        mbox.sync(SyncFlags::empty()).unwrap();
    }
    dir.child(".test.mbox.mboxsync.idx").assert(predicate::path::exists());
    let before = std::fs::read(&path).unwrap();

    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.mode, None);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

// ─── Test 3: Expunging the middle record shrinks by its footprint ───

#[test]
fn test_expunge_middle_record() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    let size = std::fs::metadata(&path).unwrap().len();
    let footprint = scan(&path)[1].footprint();

    queue(&mut mbox, 2, 2, SyncKind::Expunge);
    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.expunged, 1);
    assert_eq!(report.headers_rewritten, 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), size - footprint);
    assert_eq!(file_uids(&path), vec![Some(1), Some(3)]);
    assert_eq!(index_uids(&mbox), vec![1, 3]);
    assert!(mbox.index().pending_syncs().is_empty());
    assert_well_formed(&path);
    dir.child("test.mbox")
        .assert(predicate::str::contains("Subject: two").not());
}

// ─── Test 4: A grown header waits for an expunge to pay for it ──────

fn canonical(
    sender: &str,
    subject: &str,
    body: &str,
    uid: u32,
    base: Option<(u32, u32)>,
    padding: usize,
) -> String {
    let unmanaged = format!("From: {sender}\nSubject: {subject}\n");
    let body = format!("{body}\n");
    let rendered = render_header(
        &HeaderFields {
            unmanaged: unmanaged.as_bytes(),
            base,
            flags: MailFlags::SEEN,
            keywords: &[],
            uid,
            content_length: body.len() as u64,
        },
        padding,
    );
    format!(
        "From {sender} Thu Jan  4 10:00:00 2024\n{}{body}",
        String::from_utf8(rendered.bytes).unwrap()
    )
}

#[test]
fn test_deficit_settled_by_later_expunge() {
    let long_body = "x".repeat(200);
    let text = mbox_text(&[
        canonical("a@example.com", "one", "first", 1, Some((1234, 3)), 8),
        canonical("b@example.com", "two", &long_body, 2, None, 8),
        canonical("c@example.com", "three", "third", 3, None, 8),
    ]);
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, text.as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();

    // Already in canonical form: nothing to write.
    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.headers_rewritten, 0);
    assert_eq!(mbox.index().header().uid_validity, 1234);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), text);

    let size = text.len() as u64;
    let footprint = scan(&path)[1].footprint();
    assert!(footprint >= 32 + 50);

    // 39 characters plus a space: 40 bytes more than the 8 bytes of padding.
    let keyword = "k".repeat(39);
    queue(&mut mbox, 1, 1, SyncKind::KeywordAdd(keyword.clone()));
    queue(&mut mbox, 2, 2, SyncKind::Expunge);
    let report = mbox.sync(SyncFlags::empty()).unwrap();

    assert_eq!(report.rewrite_runs, 1);
    assert_eq!(report.expunged, 1);
    // Deficit of 32 plus one record's padding allowance, paid for by the expunge.
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        size - footprint + 32 + 50
    );
    assert_eq!(file_uids(&path), vec![Some(1), Some(3)]);
    let first = parse_header(&scan(&path)[0].header);
    assert_eq!(first.keywords, vec![keyword]);
    assert_eq!(first.base.map(|b| (b.validity, b.uid_last)), Some((1234, 3)));
    assert_well_formed(&path);
}

// ─── Test 5: Appended messages found without a full rescan ──────────

#[test]
fn test_external_append_uses_fast_path() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    append(
        &path,
        &mbox_text(&[
            message("d@example.com", "four", "fourth body"),
            message("e@example.com", "five", "fifth body"),
        ]),
    );
    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.mode, Some(ScanMode::FastPath));
    assert!(report.dirty);
    assert!(report.skipped);
    assert_eq!(report.appended, 2);
    assert!(report.records_scanned < 5);
    assert_eq!(report.attempts, 1);
    assert_eq!(index_uids(&mbox), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        file_uids(&path),
        vec![Some(1), Some(2), Some(3), Some(4), Some(5)]
    );
    let base = parse_header(&scan(&path)[0].header).base.unwrap();
    assert_eq!(base.uid_last, 5);
    assert_well_formed(&path);

    // The partial sync is remembered: nothing left to do.
    assert_eq!(mbox.sync(SyncFlags::empty()).unwrap().mode, None);
}

// ─── Test 6: Lost X-UID recovered from the header digest ────────────

#[test]
fn test_missing_uid_adopted_by_digest() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();
    let next_uid = mbox.index().header().next_uid;

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replacen("X-UID: 2\n", "", 1)).unwrap();

    let mut lazy = config();
    lazy.sync.lazy_writes = true;
    let file = MboxFile::open(&path).unwrap();
    let index = FileIndex::open(&path, None).unwrap();
    let mut mbox = Mailbox::with_index(file, index, &lazy);
    let report = mbox.sync(SyncFlags::empty()).unwrap();

    assert_eq!(report.appended, 0);
    assert_eq!(mbox.index().header().next_uid, next_uid);
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
    let (_, record) = mbox.index().lookup_uid(2).unwrap();
    assert!(record.flags.contains(MailFlags::DIRTY));
    // Lazy: the header is not fixed yet.
    assert_eq!(file_uids(&path), vec![Some(1), None, Some(3)]);

    let report = mbox.sync(SyncFlags::FULL_WRITE).unwrap();
    assert_eq!(report.mode, Some(ScanMode::FullScan));
    assert_eq!(file_uids(&path), vec![Some(1), Some(2), Some(3)]);
    let (_, record) = mbox.index().lookup_uid(2).unwrap();
    assert!(!record.flags.contains(MailFlags::DIRTY));
    assert_well_formed(&path);
}

// ─── Test 7: Out of UIDs ────────────────────────────────────────────

fn exhausted_mailbox(path: &Path, renumber: bool) -> Mailbox {
    let mut cfg = config();
    cfg.sync.renumber_on_exhaustion = renumber;
    let mut mbox = Mailbox::with_index(MboxFile::open(path).unwrap(), FileIndex::in_memory(), &cfg);
    let mut tx = IndexTransaction::new();
    tx.set_uid_validity(77);
    tx.set_next_uid(u32::MAX);
    mbox.index_mut().commit(tx).unwrap();
    mbox
}

#[test]
fn test_exhaustion_without_renumbering_writes_nothing() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let before = std::fs::read(&path).unwrap();
    let mut mbox = exhausted_mailbox(&path, false);

    let err = mbox.sync(SyncFlags::empty()).unwrap_err();
    assert!(matches!(err, MboxError::IdentifierExhaustion(_)));
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(mbox.index().records().is_empty());
}

#[test]
fn test_exhaustion_renumbers() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = exhausted_mailbox(&path, true);

    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert!(report.renumbered);
    assert_eq!(report.attempts, 2);
    assert_ne!(report.uid_validity, 77);
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
    assert_eq!(file_uids(&path), vec![Some(1), Some(2), Some(3)]);
    assert_well_formed(&path);
}

// ─── Test 8: Ordering after mixed changes ───────────────────────────

#[test]
fn test_uids_and_offsets_increase() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    queue(&mut mbox, 1, 1, SyncKind::Expunge);
    queue(&mut mbox, 3, 3, SyncKind::KeywordAdd("later".into()));
    append(&path, &message("d@example.com", "four", "fourth body"));
    mbox.sync(SyncFlags::empty()).unwrap();

    let records = scan(&path);
    let uids: Vec<u32> = records
        .iter()
        .filter_map(|r| parse_header(&r.header).uid)
        .collect();
    assert_eq!(uids, vec![2, 3, 4]);
    assert!(records.windows(2).all(|w| w[0].from_offset < w[1].from_offset));
    let offsets: Vec<u64> = mbox.index().records().iter().map(|r| r.from_offset).collect();
    let file_offsets: Vec<u64> = records.iter().map(|r| r.from_offset).collect();
    assert_eq!(offsets, file_offsets);
    // The first surviving message now carries the mailbox base.
    assert!(parse_header(&records[0].header).base.is_some());
    assert_well_formed(&path);
}

// ─── Test 9: A forced full pass is idempotent ───────────────────────

#[test]
fn test_forced_full_pass_twice_changes_nothing() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::FORCE_FULL).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    let fp = mbox.file().fingerprint().unwrap();

    let report = mbox.sync(SyncFlags::FORCE_FULL).unwrap();
    assert_eq!(report.headers_rewritten, 0);
    assert_eq!(report.records_moved, 0);
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    assert_eq!(mbox.file().fingerprint().unwrap(), fp);
    assert_eq!(mbox.index().header().sync_fingerprint, fp);
}

// ─── Test 10: Flags and keywords survive a fresh index ──────────────

#[test]
fn test_flags_and_keywords_round_trip() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    queue(
        &mut mbox,
        1,
        2,
        SyncKind::Flags {
            add: MailFlags::SEEN | MailFlags::FLAGGED,
            remove: MailFlags::empty(),
        },
    );
    queue(&mut mbox, 2, 3, SyncKind::KeywordAdd("work".into()));
    queue(&mut mbox, 3, 3, SyncKind::KeywordAdd("todo".into()));
    mbox.sync(SyncFlags::empty()).unwrap();
    assert_well_formed(&path);

    let expected: Vec<(u32, MailFlags, Vec<String>)> = mbox
        .index()
        .records()
        .iter()
        .map(|r| (r.uid, r.flags & MailFlags::HEADER_MASK, r.keywords.clone()))
        .collect();
    assert_eq!(expected[0].1, MailFlags::SEEN | MailFlags::FLAGGED);
    assert_eq!(expected[2].2, vec!["work".to_string(), "todo".to_string()]);

    let mut fresh =
        Mailbox::with_index(MboxFile::open(&path).unwrap(), FileIndex::in_memory(), &config());
    fresh.sync(SyncFlags::empty()).unwrap();
    let reread: Vec<(u32, MailFlags, Vec<String>)> = fresh
        .index()
        .records()
        .iter()
        .map(|r| (r.uid, r.flags & MailFlags::HEADER_MASK, r.keywords.clone()))
        .collect();
    assert_eq!(reread, expected);
}

// ─── Test 11: A held lock makes the sync fail ───────────────────────

#[test]
fn test_lock_held_elsewhere() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut other = MboxFile::open(&path).unwrap();
    other.lock(LockKind::Exclusive, Duration::from_secs(1)).unwrap();

    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    let err = mbox.sync(SyncFlags::empty()).unwrap_err();
    assert!(matches!(err, MboxError::Lock { .. }));

    other.unlock().unwrap();
    assert!(mbox.sync(SyncFlags::empty()).is_ok());
}

// ─── Test 12: Expunging everything leaves a placeholder ─────────────

#[test]
fn test_expunge_all_writes_placeholder() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();
    let validity = mbox.index().header().uid_validity;

    queue(&mut mbox, 1, 3, SyncKind::Expunge);
    mbox.sync(SyncFlags::empty()).unwrap();
    assert!(mbox.index().records().is_empty());
    dir.child("test.mbox").assert(
        predicate::str::starts_with("From MAILER_DAEMON ")
            .and(predicate::str::contains(format!("X-IMAP: {validity} 0000000003\n")))
            .and(predicate::str::contains("FOLDER INTERNAL DATA")),
    );
    assert_eq!(scan(&path).len(), 1);

    // A message delivered later continues the UID sequence.
    append(&path, &message("d@example.com", "four", "fourth body"));
    mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(index_uids(&mbox), vec![4]);
    assert_eq!(file_uids(&path), vec![Some(4)]);
    // The placeholder stays and keeps the mailbox base.
    let records = scan(&path);
    assert_eq!(records.len(), 2);
    let base = parse_header(&records[0].header).base.unwrap();
    assert_eq!((base.validity, base.uid_last), (validity, 4));
    assert_well_formed(&path);
}

// ─── Test 13: UID validity changed behind our back ──────────────────

#[test]
fn test_validity_change_marks_index_corrupted() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();
    let validity = mbox.index().header().uid_validity;

    let text = std::fs::read_to_string(&path).unwrap();
    let changed = text.replacen(
        &format!("X-IMAPbase: {validity} "),
        &format!("X-IMAPbase: {} ", validity - 1),
        1,
    );
    std::fs::write(&path, changed).unwrap();
    bump_mtime(&path);

    let err = mbox.sync(SyncFlags::empty()).unwrap_err();
    assert!(matches!(err, MboxError::IdentityCorruption { .. }));
    assert!(mbox.index().header().is_corrupted());
    assert!(matches!(
        mbox.sync(SyncFlags::empty()),
        Err(MboxError::IdentityCorruption { .. })
    ));

    let report = mbox.sync(SyncFlags::FORCE_FULL).unwrap();
    assert_eq!(report.uid_validity, validity - 1);
    assert!(!mbox.index().header().is_corrupted());
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
}

// ─── Test 14: A broken fast path falls back to a full scan ──────────

#[test]
fn test_fast_path_mismatch_retries_full_scan() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    // Another writer removes message 2 and delivers two larger ones.
    let records = scan(&path);
    let bytes = std::fs::read(&path).unwrap();
    let mut edited = bytes[..records[1].from_offset as usize].to_vec();
    edited.extend_from_slice(&bytes[records[2].from_offset as usize..]);
    std::fs::write(&path, &edited).unwrap();
    let long = "y".repeat(300);
    append(
        &path,
        &mbox_text(&[
            message("d@example.com", "four", &long),
            message("e@example.com", "five", &long),
        ]),
    );

    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(report.mode, Some(ScanMode::FullScan));
    assert_eq!(report.vanished, 1);
    assert_eq!(index_uids(&mbox), vec![1, 3, 4, 5]);
    assert_eq!(file_uids(&path), vec![Some(1), Some(3), Some(4), Some(5)]);
    assert_well_formed(&path);
}

// ─── Test 15: A stale cached offset is recovered by counting ────────

#[test]
fn test_stale_offset_recovered_in_place() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replacen("Subject: one\n", "Subject: one, edited\n", 1)).unwrap();
    append(&path, &message("d@example.com", "four", "fourth body"));

    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.mode, Some(ScanMode::FastPath));
    assert_eq!(report.attempts, 1);
    assert_eq!(index_uids(&mbox), vec![1, 2, 3, 4]);
    assert_well_formed(&path);
}

// ─── Test 16: Read-only mailboxes keep expunges queued ──────────────

#[test]
fn test_readonly_mailbox_defers_everything() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let before = std::fs::read(&path).unwrap();
    let file = MboxFile::open_readonly(&path).unwrap();
    let mut mbox = Mailbox::with_index(file, FileIndex::in_memory(), &config());

    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.appended, 3);
    assert!(mbox
        .index()
        .records()
        .iter()
        .all(|r| r.flags.contains(MailFlags::DIRTY)));

    queue(&mut mbox, 1, 1, SyncKind::Expunge);
    mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
    assert_eq!(mbox.index().pending_syncs().len(), 1);
}

// ─── Test 17: Delivered with the next UID already set ───────────────

fn message_with_uid(sender: &str, subject: &str, uid: u32) -> String {
    format!(
        "From {sender} Thu Jan  4 10:00:00 2024\n\
         From: {sender}\n\
         Subject: {subject}\n\
         X-UID: {uid}\n\
         \n\
         {subject} body\n"
    )
}

#[test]
fn test_uid_at_next_uid_is_adopted() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(mbox.index().header().next_uid, 4);

    append(
        &path,
        &mbox_text(&[
            message_with_uid("d@example.com", "four", 4),
            message_with_uid("e@example.com", "five", 5),
            message("f@example.com", "six", "sixth body"),
        ]),
    );
    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.attempts, 1);
    assert!(!mbox.index().header().is_corrupted());
    assert_eq!(index_uids(&mbox), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(mbox.index().header().next_uid, 7);
    assert_eq!(
        file_uids(&path),
        vec![Some(1), Some(2), Some(3), Some(4), Some(5), Some(6)]
    );
    assert_well_formed(&path);
}

// ─── Test 18: Aborted sync closes the space it reclaimed ────────────

#[test]
fn test_aborted_sync_leaves_contiguous_records() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    queue(&mut mbox, 1, 1, SyncKind::Expunge);
    // A UID far past the next one stops the pass after message 1 was reclaimed.
    append(&path, &message_with_uid("x@example.com", "rogue", 40));
    let size = std::fs::metadata(&path).unwrap().len();

    let err = mbox.sync(SyncFlags::empty()).unwrap_err();
    assert!(matches!(err, MboxError::IdentityCorruption { .. }));
    // Message 2 took part of the space for its new base header.
    assert!(std::fs::metadata(&path).unwrap().len() < size);
    assert!(parse_header(&scan(&path)[0].header).base.is_some());
    assert_eq!(file_uids(&path), vec![Some(2), Some(3), Some(40)]);
    assert_well_formed(&path);

    // Nothing of the aborted pass reached the index.
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
    assert_eq!(mbox.index().pending_syncs().len(), 1);
}

// ─── Test 19: Wrong Content-Length is replaced ──────────────────────

#[test]
fn test_wrong_content_length_corrected() {
    let text = mbox_text(&[
        "From a@example.com Thu Jan  4 10:00:00 2024\n\
         From: a@example.com\n\
         Subject: short\n\
         Content-Length: 3\n\
         \n\
         first body line\n"
            .to_string(),
        "From b@example.com Thu Jan  4 10:00:00 2024\n\
         From: b@example.com\n\
         Subject: long\n\
         Content-Length: 999\n\
         \n\
         second body line\n"
            .to_string(),
    ]);
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, text.as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    assert_eq!(file_uids(&path), vec![Some(1), Some(2)]);
    dir.child("test.mbox").assert(
        predicate::str::contains("Content-Length: 16\n")
            .and(predicate::str::contains("Content-Length: 17\n"))
            .and(predicate::str::contains("Content-Length: 999").not()),
    );
    assert_well_formed(&path);
}

#[test]
fn test_wrong_content_length_alone_triggers_rewrite() {
    let text = mbox_text(&[
        canonical("a@example.com", "one", "first", 1, Some((1234, 2)), 8),
        canonical("b@example.com", "two", "second", 2, None, 8),
    ]);
    // "second\n" is 7 bytes; declare 4.
    let wrong = text.replacen("Content-Length: 7\n", "Content-Length: 4\n", 1);
    assert_ne!(wrong, text);
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, wrong.as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();

    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(report.headers_rewritten, 1);
    assert_eq!(file_uids(&path), vec![Some(1), Some(2)]);
    assert_well_formed(&path);

    let report = mbox.sync(SyncFlags::FORCE_FULL).unwrap();
    assert_eq!(report.headers_rewritten, 0);
}

// ─── Test 20: Queued appends reserve UIDs ───────────────────────────

#[test]
fn test_append_record_raises_next_uid() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = Mailbox::open(&path, &config()).unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    queue(&mut mbox, 4, 9, SyncKind::Append);
    mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(mbox.index().header().next_uid, 10);
    assert!(mbox.index().pending_syncs().is_empty());

    append(&path, &message("d@example.com", "four", "fourth body"));
    mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(index_uids(&mbox), vec![1, 2, 3, 10]);
    assert_eq!(file_uids(&path), vec![Some(1), Some(2), Some(3), Some(10)]);
    assert_well_formed(&path);
}

// ─── Test 21: Renumbering drops changes queued for old UIDs ─────────

#[test]
fn test_renumbering_discards_queued_changes() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_mbox(&dir, three().as_bytes());
    let mut mbox = exhausted_mailbox(&path, true);
    queue(
        &mut mbox,
        2,
        2,
        SyncKind::Flags {
            add: MailFlags::FLAGGED,
            remove: MailFlags::empty(),
        },
    );
    queue(&mut mbox, 3, 3, SyncKind::Expunge);
    queue(&mut mbox, 1, 50, SyncKind::Append);

    let report = mbox.sync(SyncFlags::empty()).unwrap();
    assert!(report.renumbered);
    assert_eq!(index_uids(&mbox), vec![1, 2, 3]);
    assert_eq!(mbox.index().header().next_uid, 4);
    assert!(mbox.index().pending_syncs().is_empty());
    assert!(mbox
        .index()
        .records()
        .iter()
        .all(|r| !r.flags.contains(MailFlags::FLAGGED)));
    dir.child("test.mbox")
        .assert(predicate::str::contains("X-Status").not());
}
