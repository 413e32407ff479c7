//! Access to the mailbox file on disk.

pub mod file;
