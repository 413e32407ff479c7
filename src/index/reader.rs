//! Index querying utilities.

use std::collections::HashMap;

use serde::Serialize;

use crate::index::store::{IndexRecord, MailIndex};
use crate::model::flags::MailFlags;

/// Summary of an index, for `stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub messages: usize,
    pub unseen: usize,
    pub flagged: usize,
    pub deleted: usize,
    pub recent: usize,
    /// Messages whose headers are behind the index.
    pub dirty: usize,
    pub uid_validity: u32,
    pub next_uid: u32,
    pub uid_range: Option<(u32, u32)>,
    pub pending_syncs: usize,
    pub corrupted: bool,
    pub top_keywords: Vec<(String, usize)>,
}

/// Collect statistics over every record.
pub fn index_stats(index: &dyn MailIndex, keyword_limit: usize) -> IndexStats {
    let records = index.records();
    let header = index.header();
    IndexStats {
        messages: records.len(),
        unseen: count_without(records, MailFlags::SEEN),
        flagged: count_with(records, MailFlags::FLAGGED),
        deleted: count_with(records, MailFlags::DELETED),
        recent: count_with(records, MailFlags::RECENT),
        dirty: count_with(records, MailFlags::DIRTY),
        uid_validity: header.uid_validity,
        next_uid: header.next_uid,
        uid_range: uid_range(records),
        pending_syncs: index.pending_syncs().len(),
        corrupted: header.is_corrupted(),
        top_keywords: top_keywords(records, keyword_limit),
    }
}

/// Count records carrying every flag in `flags`.
pub fn count_with(records: &[IndexRecord], flags: MailFlags) -> usize {
    records.iter().filter(|r| r.flags.contains(flags)).count()
}

pub fn count_without(records: &[IndexRecord], flags: MailFlags) -> usize {
    records.len() - count_with(records, flags)
}

/// Lowest and highest UID.
pub fn uid_range(records: &[IndexRecord]) -> Option<(u32, u32)> {
    Some((records.first()?.uid, records.last()?.uid))
}

/// Return the top N keywords by message count.
pub fn top_keywords(records: &[IndexRecord], n: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for record in records {
        for kw in &record.keywords {
            *counts.entry(kw.as_str()).or_default() += 1;
        }
    }
    let mut sorted: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(n);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(uid: u32, flags: MailFlags, keywords: &[&str]) -> IndexRecord {
        IndexRecord {
            flags,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ..IndexRecord::new(uid)
        }
    }

    #[test]
    fn test_counts_and_keywords() {
        let records = vec![
            rec(1, MailFlags::SEEN, &["work"]),
            rec(2, MailFlags::SEEN | MailFlags::FLAGGED, &["work", "urgent"]),
            rec(7, MailFlags::RECENT, &["home"]),
        ];
        assert_eq!(count_with(&records, MailFlags::SEEN), 2);
        assert_eq!(count_without(&records, MailFlags::SEEN), 1);
        assert_eq!(uid_range(&records), Some((1, 7)));
        let top = top_keywords(&records, 2);
        assert_eq!(top[0], ("work".to_string(), 2));
        assert_eq!(top[1], ("home".to_string(), 1));
    }

    #[test]
    fn test_empty() {
        assert_eq!(uid_range(&[]), None);
        assert!(top_keywords(&[], 5).is_empty());
    }
}
