//! Pending index-side changes waiting to be written to the mailbox file.

use serde::{Deserialize, Serialize};

use crate::error::{MboxError, Result};
use crate::model::flags::MailFlags;

/// What a [`SyncRecord`] changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    /// Add and remove header flags.
    Flags { add: MailFlags, remove: MailFlags },
    KeywordAdd(String),
    KeywordRemove(String),
    /// Drop every keyword.
    KeywordReset,
    /// Remove the messages from the file.
    Expunge,
    /// Messages were appended by another writer; reserve their UIDs.
    Append,
}

/// A queued change over the UID range `uid1..=uid2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub uid1: u32,
    pub uid2: u32,
    pub kind: SyncKind,
}

impl SyncRecord {
    pub fn new(uid1: u32, uid2: u32, kind: SyncKind) -> Result<Self> {
        if uid1 == 0 || uid1 > uid2 {
            return Err(MboxError::InvalidSyncRecord(format!(
                "bad UID range {uid1}:{uid2}"
            )));
        }
        Ok(Self { uid1, uid2, kind })
    }

    pub fn covers(&self, uid: u32) -> bool {
        self.uid1 <= uid && uid <= self.uid2
    }

    pub fn is_expunge(&self) -> bool {
        matches!(self.kind, SyncKind::Expunge)
    }

    /// Flag and keyword changes can be applied to the index alone.
    pub fn is_index_only(&self) -> bool {
        matches!(
            self.kind,
            SyncKind::Flags { .. }
                | SyncKind::KeywordAdd(_)
                | SyncKind::KeywordRemove(_)
                | SyncKind::KeywordReset
        )
    }

    /// Apply a flag or keyword change. Returns `true` when the keyword set changed.
    pub fn apply(&self, flags: &mut MailFlags, keywords: &mut Vec<String>) -> bool {
        match &self.kind {
            SyncKind::Flags { add, remove } => {
                flags.insert(*add & MailFlags::HEADER_MASK);
                flags.remove(*remove & MailFlags::HEADER_MASK);
                false
            }
            SyncKind::KeywordAdd(kw) => {
                if keywords.iter().any(|k| k == kw) {
                    false
                } else {
                    keywords.push(kw.clone());
                    true
                }
            }
            SyncKind::KeywordRemove(kw) => {
                let before = keywords.len();
                keywords.retain(|k| k != kw);
                keywords.len() != before
            }
            SyncKind::KeywordReset => {
                let changed = !keywords.is_empty();
                keywords.clear();
                changed
            }
            SyncKind::Expunge | SyncKind::Append => false,
        }
    }
}

/// Parse an IMAP-style UID set such as `1:5,7,10:*`.
///
/// `*` stands for `last_uid`. Ranges are normalized so that `uid1 <= uid2`.
pub fn parse_uid_set(input: &str, last_uid: u32) -> Result<Vec<(u32, u32)>> {
    let parse_one = |s: &str| -> Result<u32> {
        if s == "*" {
            return Ok(last_uid.max(1));
        }
        match s.parse::<u32>() {
            Ok(0) | Err(_) => Err(MboxError::InvalidSyncRecord(format!(
                "invalid UID '{s}' in set '{input}'"
            ))),
            Ok(n) => Ok(n),
        }
    };

    let mut ranges = Vec::new();
    for part in input.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(MboxError::InvalidSyncRecord(format!(
                "empty element in UID set '{input}'"
            )));
        }
        let (lo, hi) = match part.split_once(':') {
            Some((a, b)) => (parse_one(a)?, parse_one(b)?),
            None => {
                let n = parse_one(part)?;
                (n, n)
            }
        };
        ranges.push((lo.min(hi), lo.max(hi)));
    }
    Ok(ranges)
}
