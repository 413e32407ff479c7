//! Core data model: message flags, scanned records, and queued sync changes.

pub mod flags;
pub mod record;
pub mod sync_record;
