//! Forward-only MBOX record scanner.
//!
//! Reads through a buffered window over positioned reads, so the same file
//! handle can be written between records. Boundaries are strict: a record
//! starts at offset 0 or at a `From ` line preceded by an empty line.

use tracing::{debug, trace, warn};

use crate::error::{MboxError, Result};
use crate::model::record::ScannedRecord;
use crate::parser::header::{find_content_length, is_empty_line};
use crate::store::file::MboxFile;

/// Size of the read window.
pub const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Report progress every 4 MB.
const PROGRESS_INTERVAL: u64 = 4 * 1024 * 1024;

/// Lazily yields the records of a mailbox file in file order.
pub struct RecordScanner<'a> {
    file: &'a MboxFile,
    file_size: u64,
    window: Vec<u8>,
    window_start: u64,
    line: Vec<u8>,
    /// Where the next record starts.
    pos: u64,
    /// Sequence of the last record returned.
    seq: u32,
    last_progress: u64,
    progress: Option<&'a dyn Fn(u64, u64)>,
}

impl<'a> RecordScanner<'a> {
    /// Start scanning at the beginning of `file`.
    pub fn new(file: &'a MboxFile) -> Result<Self> {
        Ok(Self {
            file,
            file_size: file.len()?,
            window: Vec::with_capacity(READ_BUFFER_SIZE),
            window_start: 0,
            line: Vec::with_capacity(4096),
            pos: 0,
            seq: 0,
            last_progress: 0,
            progress: None,
        })
    }

    /// Receive `(scanned_offset, file_size)` every few megabytes.
    pub fn with_progress(mut self, progress: Option<&'a dyn Fn(u64, u64)>) -> Self {
        self.progress = progress;
        self
    }

    /// Offset where the next record is expected.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Sequence number of the last record returned (0 before the first).
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.file_size
    }

    /// Drop buffered bytes and re-read the file size after the file was written.
    pub fn refresh(&mut self) -> Result<()> {
        self.window.clear();
        self.window_start = 0;
        self.file_size = self.file.len()?;
        Ok(())
    }

    /// Return the next record, or `None` at end of file.
    pub fn next(&mut self) -> Result<Option<ScannedRecord>> {
        let from_offset = self.pos;
        if from_offset >= self.file_size {
            return Ok(None);
        }
        let n = self.read_line(from_offset)?;
        if n == 0 {
            return Ok(None);
        }
        if !is_mbox_separator(&self.line, from_offset == 0) {
            return Err(MboxError::Boundary {
                offset: from_offset,
                reason: "expected a 'From ' line".into(),
            });
        }
        let from_line = self.line.clone();
        let hdr_offset = from_offset + n as u64;

        // Headers, through the empty line.
        let mut header = Vec::with_capacity(2048);
        let mut offset = hdr_offset;
        let mut has_eoh = false;
        loop {
            let n = self.read_line(offset)?;
            if n == 0 {
                break;
            }
            header.extend_from_slice(&self.line);
            offset += n as u64;
            if is_empty_line(&self.line) {
                has_eoh = true;
                break;
            }
        }
        let body_offset = offset;

        let (body_size, separator_len) = if !has_eoh {
            warn!(offset = from_offset, "Headers run to end of file");
            (0, 0)
        } else {
            match find_content_length(&header) {
                Some(len) => match self.check_content_length(body_offset, len)? {
                    Some(sep) => (len, sep),
                    None => {
                        debug!(
                            offset = from_offset,
                            content_length = len,
                            "Content-Length does not end at a boundary, scanning"
                        );
                        self.scan_body(body_offset)?
                    }
                },
                None => self.scan_body(body_offset)?,
            }
        };

        self.seq += 1;
        let record = ScannedRecord {
            seq: self.seq,
            from_offset,
            hdr_offset,
            body_offset,
            body_size,
            separator_len,
            from_line,
            header,
        };
        self.pos = record.end_offset();
        trace!(seq = record.seq, offset = from_offset, len = record.footprint(), "Scanned record");
        self.report_progress();
        Ok(Some(record))
    }

    /// Position the scanner at `offset`, which must be a record boundary or EOF.
    pub fn seek_to_offset(&mut self, offset: u64) -> Result<()> {
        if offset == self.file_size {
            self.pos = offset;
            return Ok(());
        }
        let bad = |reason: &str| MboxError::Boundary {
            offset,
            reason: reason.to_string(),
        };
        if offset > self.file_size {
            return Err(bad("offset beyond end of file"));
        }
        if offset > 0 {
            if offset < 2 {
                return Err(bad("no empty line before record"));
            }
            let start = offset.saturating_sub(3);
            let mut prev = [0u8; 3];
            let len = (offset - start) as usize;
            self.file.read_exact_at(&mut prev[..len], start)?;
            let prev = &prev[..len];
            if !(prev.ends_with(b"\n\n") || prev.ends_with(b"\n\r\n")) {
                return Err(bad("no empty line before record"));
            }
        }
        let n = self.read_line(offset)?;
        if n == 0 || !is_mbox_separator(&self.line, offset == 0) {
            return Err(bad("expected a 'From ' line"));
        }
        self.pos = offset;
        Ok(())
    }

    /// Position the scanner so that the next record returned has sequence `seq`.
    ///
    /// Tries `cached_offset` first; when that is stale, counts records forward
    /// from the current position (or from the start, if already past `seq`).
    /// Returns whether the cached offset was usable.
    pub fn seek_to_sequence(&mut self, seq: u32, cached_offset: Option<u64>) -> Result<bool> {
        if let Some(offset) = cached_offset {
            match self.seek_to_offset(offset) {
                Ok(()) => {
                    self.seq = seq.saturating_sub(1);
                    return Ok(true);
                }
                Err(MboxError::Boundary { reason, .. }) => {
                    warn!(seq, offset, %reason, "Cached offset is stale, rescanning");
                }
                Err(e) => return Err(e),
            }
        }
        if self.seq + 1 > seq {
            self.pos = 0;
            self.seq = 0;
        }
        while self.seq + 1 < seq {
            if self.next()?.is_none() {
                break;
            }
        }
        Ok(false)
    }

    /// Does a `Content-Length` body end at EOF or at an empty line followed by
    /// a boundary? Returns the separator length when it does.
    fn check_content_length(&mut self, body_offset: u64, len: u64) -> Result<Option<u64>> {
        let end = body_offset.saturating_add(len);
        if end == self.file_size {
            return Ok(Some(0));
        }
        if end > self.file_size {
            return Ok(None);
        }
        let n = self.read_line(end)?;
        if !is_empty_line(&self.line) {
            return Ok(None);
        }
        let after = end + n as u64;
        if after == self.file_size {
            return Ok(Some(n as u64));
        }
        self.read_line(after)?;
        if is_mbox_separator(&self.line, false) {
            Ok(Some(n as u64))
        } else {
            Ok(None)
        }
    }

    /// Find the body end by looking for an empty line followed by `From `.
    fn scan_body(&mut self, body_offset: u64) -> Result<(u64, u64)> {
        let mut offset = body_offset;
        let mut prev_empty = false;
        let mut last_len = 0u64;
        loop {
            let n = self.read_line(offset)?;
            if n == 0 {
                break;
            }
            if prev_empty && is_mbox_separator(&self.line, false) {
                break;
            }
            prev_empty = is_empty_line(&self.line);
            last_len = n as u64;
            offset += n as u64;
            if offset - self.last_progress >= PROGRESS_INTERVAL {
                self.report_progress_at(offset);
            }
        }
        let separator_len = if prev_empty { last_len } else { 0 };
        Ok((offset - body_offset - separator_len, separator_len))
    }

    /// Read one line starting at `offset` into `self.line`. Returns its length.
    fn read_line(&mut self, offset: u64) -> Result<usize> {
        self.line.clear();
        let mut at = offset;
        loop {
            let window_end = self.window_start + self.window.len() as u64;
            if at < self.window_start || at >= window_end {
                if self.fill(at)? == 0 {
                    break;
                }
                continue;
            }
            let chunk = &self.window[(at - self.window_start) as usize..];
            match memchr_newline(chunk) {
                Some(i) => {
                    self.line.extend_from_slice(&chunk[..=i]);
                    break;
                }
                None => {
                    self.line.extend_from_slice(chunk);
                    at += chunk.len() as u64;
                }
            }
        }
        Ok(self.line.len())
    }

    fn fill(&mut self, offset: u64) -> Result<usize> {
        self.window.resize(READ_BUFFER_SIZE, 0);
        let n = self.file.read_at(&mut self.window, offset)?;
        self.window.truncate(n);
        self.window_start = offset;
        Ok(n)
    }

    fn report_progress(&mut self) {
        if self.pos - self.last_progress >= PROGRESS_INTERVAL || self.pos >= self.file_size {
            self.report_progress_at(self.pos);
        }
    }

    fn report_progress_at(&mut self, offset: u64) {
        if let Some(cb) = self.progress {
            cb(offset.min(self.file_size), self.file_size);
        }
        self.last_progress = offset;
    }
}

/// Fast newline search (equivalent to memchr for `\n`).
#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Check whether a line is an MBOX separator (`From ` at the start).
///
/// A UTF-8 BOM is tolerated only on the very first line of the file.
pub fn is_mbox_separator(line: &[u8], at_file_start: bool) -> bool {
    let line = if at_file_start && line.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &line[3..]
    } else {
        line
    };
    line.starts_with(b"From ")
}
