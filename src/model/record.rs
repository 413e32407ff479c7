//! Raw records as found in the file, and their per-sync state.

use crate::model::flags::MailFlags;

/// One message record located by the scanner.
///
/// Layout on disk:
///
/// ```text
/// from_offset  ─► From sender@host Thu Jan  4 10:00:00 2024\n
/// hdr_offset   ─► Header: value\n
///                 ...\n
///                 \n                      (end of headers)
/// body_offset  ─► body bytes (body_size)
///                 \n                      (separator, separator_len)
/// end_offset() ─► next record or EOF
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    /// 1-based position in the file, counting a placeholder record.
    pub seq: u32,
    pub from_offset: u64,
    pub hdr_offset: u64,
    pub body_offset: u64,
    pub body_size: u64,
    /// Length of the blank line separating this record from the next.
    pub separator_len: u64,
    /// The `From ` line including its line ending.
    pub from_line: Vec<u8>,
    /// Header bytes `[hdr_offset, body_offset)`, end-of-headers line included.
    pub header: Vec<u8>,
}

impl ScannedRecord {
    pub fn end_offset(&self) -> u64 {
        self.body_offset + self.body_size + self.separator_len
    }

    /// Bytes the record occupies; all of it is reclaimed on expunge.
    pub fn footprint(&self) -> u64 {
        self.end_offset() - self.from_offset
    }

    pub fn header_len(&self) -> u64 {
        self.body_offset - self.hdr_offset
    }

    /// Body plus separator: the part moved verbatim by a rewrite.
    pub fn tail_len(&self) -> u64 {
        self.body_size + self.separator_len
    }
}

/// Reconciled state of a live message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailState {
    pub uid: u32,
    /// Header flags the message should carry.
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    /// `Status` had no `O`.
    pub recent: bool,
    /// The headers disagree with the index and a write was delayed.
    pub dirty: bool,
    /// Headers must be regenerated.
    pub need_rewrite: bool,
    /// This record carries the mailbox-wide `X-IMAPbase` header.
    pub holds_base: bool,
}

/// What a scanned record turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Live(MailState),
    /// To be removed; `space` is the whole footprint.
    Expunged { space: u64 },
    /// Placeholder carrying only mailbox metadata.
    Pseudo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_geometry() {
        let rec = ScannedRecord {
            seq: 1,
            from_offset: 100,
            hdr_offset: 140,
            body_offset: 200,
            body_size: 50,
            separator_len: 1,
            from_line: vec![b'x'; 40],
            header: vec![b'h'; 60],
        };
        assert_eq!(rec.end_offset(), 251);
        assert_eq!(rec.footprint(), 151);
        assert_eq!(rec.header_len(), 60);
        assert_eq!(rec.tail_len(), 51);
    }
}
