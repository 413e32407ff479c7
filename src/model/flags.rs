//! Message flags and their mapping to the `Status` / `X-Status` headers.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Per-message flags as stored in the index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MailFlags: u8 {
        const SEEN     = 0b0000_0001;
        const ANSWERED = 0b0000_0010;
        const FLAGGED  = 0b0000_0100;
        const DELETED  = 0b0000_1000;
        const DRAFT    = 0b0001_0000;
        /// Seen as new (no `O` in `Status`) during the last sync.
        const RECENT   = 0b0010_0000;
        /// Index flags are newer than the file headers (delayed write).
        const DIRTY    = 0b0100_0000;
    }
}

impl Default for MailFlags {
    fn default() -> Self {
        MailFlags::empty()
    }
}

impl MailFlags {
    /// Flags that are persisted in the message headers.
    pub const HEADER_MASK: MailFlags = MailFlags::SEEN
        .union(MailFlags::ANSWERED)
        .union(MailFlags::FLAGGED)
        .union(MailFlags::DELETED)
        .union(MailFlags::DRAFT);

    /// Parse a `Status` header value. `recent` is set when `O` is absent.
    pub fn from_status(value: &[u8]) -> MailFlags {
        let mut flags = MailFlags::RECENT;
        for &b in value {
            match b {
                b'R' => flags |= MailFlags::SEEN,
                b'O' => flags.remove(MailFlags::RECENT),
                _ => {}
            }
        }
        flags
    }

    /// Parse an `X-Status` header value.
    pub fn from_x_status(value: &[u8]) -> MailFlags {
        let mut flags = MailFlags::empty();
        for &b in value {
            match b {
                b'A' => flags |= MailFlags::ANSWERED,
                b'F' => flags |= MailFlags::FLAGGED,
                b'T' => flags |= MailFlags::DRAFT,
                b'D' => flags |= MailFlags::DELETED,
                _ => {}
            }
        }
        flags
    }

    /// `Status` value for these flags. Always carries `O`: after a sync
    /// the message is no longer new.
    pub fn status_value(self) -> &'static str {
        if self.contains(MailFlags::SEEN) {
            "RO"
        } else {
            "O"
        }
    }

    /// `X-Status` value, or `None` when no extended flag is set.
    pub fn x_status_value(self) -> Option<String> {
        let mut out = String::new();
        if self.contains(MailFlags::ANSWERED) {
            out.push('A');
        }
        if self.contains(MailFlags::FLAGGED) {
            out.push('F');
        }
        if self.contains(MailFlags::DRAFT) {
            out.push('T');
        }
        if self.contains(MailFlags::DELETED) {
            out.push('D');
        }
        (!out.is_empty()).then_some(out)
    }

    /// Parse a user-facing flag name (`seen`, `\Seen`, `answered`, ...).
    pub fn from_name(name: &str) -> Option<MailFlags> {
        let name = name.trim_start_matches('\\').to_ascii_lowercase();
        match name.as_str() {
            "seen" => Some(MailFlags::SEEN),
            "answered" => Some(MailFlags::ANSWERED),
            "flagged" => Some(MailFlags::FLAGGED),
            "deleted" => Some(MailFlags::DELETED),
            "draft" => Some(MailFlags::DRAFT),
            _ => None,
        }
    }

    /// IMAP-style names of the header flags, for display.
    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for (flag, name) in [
            (MailFlags::SEEN, "\\Seen"),
            (MailFlags::ANSWERED, "\\Answered"),
            (MailFlags::FLAGGED, "\\Flagged"),
            (MailFlags::DELETED, "\\Deleted"),
            (MailFlags::DRAFT, "\\Draft"),
            (MailFlags::RECENT, "\\Recent"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        names
    }
}

/// Whether `keyword` can be stored in an `X-Keywords` header.
pub fn is_valid_keyword(keyword: &str) -> bool {
    !keyword.is_empty()
        && keyword.bytes().all(|b| {
            b.is_ascii_graphic()
                && !matches!(b, b'(' | b')' | b'{' | b'"' | b'\\' | b'%' | b'*' | b']')
        })
}

/// Order-insensitive keyword set comparison.
pub fn same_keywords(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|k| b.contains(k))
}
