//! The synchronization engine.
//!
//! A sync is one or more forward passes over the mailbox. Each pass scans
//! records ([`crate::parser::mbox`]), matches them to the index
//! ([`reconcile`]), keeps the space account ([`ledger`]) and moves bytes
//! when the account allows it ([`rewrite`]). [`driver`] decides what kind
//! of pass to run and commits the result.

pub mod driver;
pub mod ledger;
pub mod pass;
pub mod reconcile;
pub mod rewrite;

pub use driver::{Mailbox, SyncFlags, SyncReport};
pub use pass::ScanMode;
