//! The message index the sync engine reconciles against.

pub mod format;
pub mod reader;
pub mod store;

pub use store::{FileIndex, IndexRecord, IndexTransaction, MailIndex};
