//! Byte-level relocation of records and regeneration of their headers.
//!
//! Every write is a positioned write; nothing here is atomic. Callers keep
//! the unit of exposure to one run, one shifted record or one header.

use tracing::{debug, trace, warn};

use crate::error::{MboxError, Result};
use crate::model::flags::MailFlags;
use crate::model::record::ScannedRecord;
use crate::parser::header::{render_header, HeaderFields, Rendered, UID_LAST_WIDTH};
use crate::store::file::MboxFile;

/// Zero-fill chunk used when growing the file.
const GROW_CHUNK: usize = 64 * 1024;

/// Everything needed to regenerate one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPlan {
    pub unmanaged: Vec<u8>,
    pub base: Option<(u32, u32)>,
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    pub uid: u32,
    pub content_length: u64,
}

impl HeaderPlan {
    fn fields(&self) -> HeaderFields<'_> {
        HeaderFields {
            unmanaged: &self.unmanaged,
            base: self.base,
            flags: self.flags,
            keywords: &self.keywords,
            uid: self.uid,
            content_length: self.content_length,
        }
    }

    pub fn render(&self, padding: u64) -> Rendered {
        render_header(&self.fields(), padding as usize)
    }

    /// Length without padding.
    pub fn min_len(&self) -> u64 {
        self.render(0).bytes.len() as u64
    }
}

/// A live record waiting in a rewrite run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub seq: u32,
    pub from_offset: u64,
    pub from_line: Vec<u8>,
    pub body_offset: u64,
    /// Body plus separator.
    pub tail_len: u64,
    pub plan: HeaderPlan,
}

/// Where a record ended up after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placed {
    pub seq: u32,
    pub uid: u32,
    pub from_offset: u64,
    /// Absolute offset of the last-UID digits, when the header carries them.
    pub uid_last_offset: Option<u64>,
}

/// Regenerate a header within its current length.
pub fn rewrite_in_place(
    file: &MboxFile,
    hdr_offset: u64,
    old_len: u64,
    plan: &HeaderPlan,
) -> Result<Option<u64>> {
    let min = plan.min_len();
    let padding = old_len.checked_sub(min).ok_or_else(|| {
        MboxError::SpaceAccounting(format!(
            "in-place header of {min} bytes does not fit in {old_len}"
        ))
    })?;
    let rendered = plan.render(padding);
    debug_assert_eq!(rendered.bytes.len() as u64, old_len);
    file.write_all_at(&rendered.bytes, hdr_offset)?;
    trace!(offset = hdr_offset, uid = plan.uid, "Header rewritten in place");
    Ok(rendered.uid_last_pos.map(|p| hdr_offset + p as u64))
}

/// Move one record back by `by` bytes, writing `header` in front of its
/// tail. `header` may be up to `by` bytes longer than the old one.
pub fn shift_record(
    file: &MboxFile,
    rec: &ScannedRecord,
    by: u64,
    header: &[u8],
    scratch: &mut Vec<u8>,
) -> Result<u64> {
    let new_from = rec
        .from_offset
        .checked_sub(by)
        .ok_or_else(|| MboxError::SpaceAccounting(format!("shift by {by} before start of file")))?;
    let new_hdr = new_from + rec.from_line.len() as u64;
    let new_body = new_hdr + header.len() as u64;
    if new_body > rec.body_offset {
        return Err(MboxError::SpaceAccounting(format!(
            "shifted header overruns its body ({new_body} > {})",
            rec.body_offset
        )));
    }
    file.move_bytes(new_body, rec.body_offset, rec.tail_len(), scratch)?;
    file.write_all_at(&rec.from_line, new_from)?;
    file.write_all_at(header, new_hdr)?;
    trace!(from = rec.from_offset, to = new_from, "Record shifted");
    Ok(new_from)
}

/// Write a settled run over `[region_start, region_end)`.
///
/// `padding` is spread evenly over the run's records, the remainder going
/// to the first ones. The records must exactly fill the region minus
/// `leftover`, which is left as a gap at its end.
pub fn execute_run(
    file: &MboxFile,
    records: &[RunRecord],
    region_start: u64,
    region_end: u64,
    padding: u64,
    leftover: u64,
    scratch: &mut Vec<u8>,
) -> Result<Vec<Placed>> {
    if records.is_empty() {
        if region_end - region_start != leftover {
            return Err(MboxError::SpaceAccounting(format!(
                "empty run over {} bytes with {leftover} left over",
                region_end - region_start
            )));
        }
        return Ok(Vec::new());
    }

    let count = records.len() as u64;
    let share = padding / count;
    let extra = padding % count;

    struct Layout {
        from: u64,
        hdr: u64,
        body: u64,
        rendered: Rendered,
    }

    let mut layout = Vec::with_capacity(records.len());
    let mut cursor = region_start;
    for (i, rec) in records.iter().enumerate() {
        let pad = share + u64::from((i as u64) < extra);
        let rendered = rec.plan.render(pad);
        let from = cursor;
        let hdr = from + rec.from_line.len() as u64;
        let body = hdr + rendered.bytes.len() as u64;
        cursor = body + rec.tail_len;
        layout.push(Layout {
            from,
            hdr,
            body,
            rendered,
        });
    }

    if cursor + leftover != region_end {
        return Err(MboxError::SpaceAccounting(format!(
            "run layout ends at {cursor}, expected {}",
            region_end.saturating_sub(leftover)
        )));
    }

    // Tails moving back go first, front to back; tails moving forward
    // follow, back to front. No move then overwrites an unmoved tail.
    for (rec, at) in records.iter().zip(&layout) {
        if at.body <= rec.body_offset {
            file.move_bytes(at.body, rec.body_offset, rec.tail_len, scratch)?;
        }
    }
    for (rec, at) in records.iter().zip(&layout).rev() {
        if at.body > rec.body_offset {
            file.move_bytes(at.body, rec.body_offset, rec.tail_len, scratch)?;
        }
    }

    let mut placed = Vec::with_capacity(records.len());
    for (rec, at) in records.iter().zip(layout) {
        file.write_all_at(&rec.from_line, at.from)?;
        file.write_all_at(&at.rendered.bytes, at.hdr)?;
        placed.push(Placed {
            seq: rec.seq,
            uid: rec.plan.uid,
            from_offset: at.from,
            uid_last_offset: at.rendered.uid_last_pos.map(|p| at.hdr + p as u64),
        });
    }

    debug!(
        records = records.len(),
        start = region_start,
        end = region_end,
        padding,
        leftover,
        "Rewrite run written"
    );
    Ok(placed)
}

/// Extend the file by `grow` zero bytes. On failure the file is cut back
/// to its original size.
pub fn grow_file(file: &MboxFile, grow: u64) -> Result<u64> {
    let old_size = file.len()?;
    if let Err(e) = zero_extend(file, old_size, old_size + grow) {
        warn!(error = %e, size = old_size, grow, "Growing the mailbox failed, restoring size");
        file.set_len(old_size)?;
        return Err(e);
    }
    Ok(old_size)
}

fn zero_extend(file: &MboxFile, mut offset: u64, end: u64) -> Result<()> {
    file.set_len(end)?;
    let zeros = vec![0u8; GROW_CHUNK];
    while offset < end {
        let n = (end - offset).min(GROW_CHUNK as u64) as usize;
        file.write_all_at(&zeros[..n], offset)?;
        offset += n as u64;
    }
    Ok(())
}

/// Verify the last-UID digits at `offset` read `expected`, then overwrite
/// them with `value`.
pub fn patch_uid_last(file: &MboxFile, offset: u64, expected: u32, value: u32) -> Result<()> {
    let mut current = [0u8; UID_LAST_WIDTH];
    file.read_exact_at(&mut current, offset)?;
    let want = format!("{expected:010}");
    if current != want.as_bytes() {
        return Err(MboxError::UidLastMismatch { offset });
    }
    file.write_all_at(format!("{value:010}").as_bytes(), offset)?;
    debug!(offset, from = expected, to = value, "Last UID updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockKind;
    use crate::parser::header::parse_header;
    use std::io::Write;
    use std::time::Duration;

    fn open(content: &[u8]) -> (tempfile::NamedTempFile, MboxFile) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(content).unwrap();
        tmp.flush().unwrap();
        let mut file = MboxFile::open(tmp.path()).unwrap();
        file.lock(LockKind::Exclusive, Duration::from_secs(1)).unwrap();
        (tmp, file)
    }

    fn plan(uid: u32, unmanaged: &[u8], body_len: u64) -> HeaderPlan {
        HeaderPlan {
            unmanaged: unmanaged.to_vec(),
            base: None,
            flags: MailFlags::SEEN,
            keywords: Vec::new(),
            uid,
            content_length: body_len,
        }
    }

    #[test]
    fn test_rewrite_in_place_keeps_length() {
        let mut header = b"Subject: x\nX-Keywords:".to_vec();
        header.extend(std::iter::repeat(b' ').take(60));
        header.extend_from_slice(b"\n\n");
        let mut content = b"From a Thu Jan  4 10:00:00 2024\n".to_vec();
        let hdr_offset = content.len() as u64;
        content.extend_from_slice(&header);
        content.extend_from_slice(b"body\n");
        let (_tmp, file) = open(&content);

        let mut p = plan(1, b"Subject: x\n", 5);
        p.keywords = vec!["work".into()];
        let old = header.len() as u64;
        rewrite_in_place(&file, hdr_offset, old, &p).unwrap();

        let mut buf = vec![0u8; content.len()];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(file.len().unwrap(), content.len() as u64);
        assert!(buf.ends_with(b"\n\nbody\n"));
        let parsed = parse_header(&buf[hdr_offset as usize..hdr_offset as usize + old as usize]);
        assert_eq!(parsed.uid, Some(1));
        assert_eq!(parsed.keywords, vec!["work".to_string()]);
        assert!(parsed.flags.contains(MailFlags::SEEN));
    }

    #[test]
    fn test_run_fills_region() {
        // Two records followed by 200 bytes of reclaimed space.
        let mut content = Vec::new();
        let mut records = Vec::new();
        for (i, subject) in [&b"Subject: one\n"[..], b"Subject: two\n"].iter().enumerate() {
            let from_offset = content.len() as u64;
            let from_line = b"From a Thu Jan  4 10:00:00 2024\n".to_vec();
            content.extend_from_slice(&from_line);
            content.extend_from_slice(subject);
            content.extend_from_slice(b"\n");
            let body_offset = content.len() as u64;
            content.extend_from_slice(b"body\n\n");
            records.push(RunRecord {
                seq: i as u32 + 1,
                from_offset,
                from_line,
                body_offset,
                tail_len: 6,
                plan: plan(i as u32 + 1, subject, 5),
            });
        }
        let end = content.len() as u64;
        content.extend(std::iter::repeat(b'x').take(200));
        let (_tmp, file) = open(&content);

        let min_total: u64 = records
            .iter()
            .map(|r| r.from_line.len() as u64 + r.plan.min_len() + r.tail_len)
            .sum();
        let region_end = end + 200;
        let budget = region_end - min_total;
        let padding = budget.min(2 * 50);
        let leftover = budget - padding;

        let mut scratch = Vec::new();
        let placed =
            execute_run(&file, &records, 0, region_end, padding, leftover, &mut scratch).unwrap();
        assert_eq!(placed[0].from_offset, 0);
        file.set_len(region_end - leftover).unwrap();

        let mut buf = vec![0u8; (region_end - leftover) as usize];
        file.read_exact_at(&mut buf, 0).unwrap();
        let second = placed[1].from_offset as usize;
        let first_header = &buf[32..second];
        let parsed = parse_header(first_header);
        assert_eq!(parsed.uid, Some(1));
        assert!(buf[second..].starts_with(b"From a "));
        assert!(buf.ends_with(b"body\n\n"));
    }

    #[test]
    fn test_run_rejects_bad_accounting() {
        let (_tmp, file) = open(b"From a Thu Jan  4 10:00:00 2024\n\nbody\n");
        let records = vec![RunRecord {
            seq: 1,
            from_offset: 0,
            from_line: b"From a Thu Jan  4 10:00:00 2024\n".to_vec(),
            body_offset: 33,
            tail_len: 5,
            plan: plan(1, b"", 5),
        }];
        let mut scratch = Vec::new();
        assert!(matches!(
            execute_run(&file, &records, 0, 38, 0, 0, &mut scratch),
            Err(MboxError::SpaceAccounting(_))
        ));
    }

    #[test]
    fn test_shift_record_back() {
        let mut content = vec![b'-'; 10];
        let from_line = b"From a Thu Jan  4 10:00:00 2024\n".to_vec();
        content.extend_from_slice(&from_line);
        let header = b"Subject: s\n\n".to_vec();
        content.extend_from_slice(&header);
        let body_offset = content.len() as u64;
        content.extend_from_slice(b"body\n");
        let (_tmp, file) = open(&content);

        let rec = ScannedRecord {
            seq: 1,
            from_offset: 10,
            hdr_offset: 10 + from_line.len() as u64,
            body_offset,
            body_size: 5,
            separator_len: 0,
            from_line,
            header: header.clone(),
        };
        let mut scratch = Vec::new();
        let new_from = shift_record(&file, &rec, 10, &header, &mut scratch).unwrap();
        assert_eq!(new_from, 0);
        let mut buf = vec![0u8; content.len() - 10];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..], &content[10..]);
    }

    #[test]
    fn test_patch_uid_last_verifies() {
        let (_tmp, file) = open(b"X-IMAPbase: 5 0000000007\n");
        patch_uid_last(&file, 14, 7, 12).unwrap();
        let mut buf = [0u8; 10];
        file.read_exact_at(&mut buf, 14).unwrap();
        assert_eq!(&buf, b"0000000012");
        assert!(matches!(
            patch_uid_last(&file, 14, 7, 13),
            Err(MboxError::UidLastMismatch { offset: 14 })
        ));
    }

    #[test]
    fn test_grow_file_zero_fills() {
        let (_tmp, file) = open(b"abc");
        let old = grow_file(&file, 5).unwrap();
        assert_eq!(old, 3);
        let mut buf = [1u8; 8];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abc\0\0\0\0\0");
    }
}
