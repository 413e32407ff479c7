//! `mboxsync`: keeps an mbox mailbox and a binary message index in step.
//!
//! The library assigns stable UIDs to messages, writes flag, keyword and
//! UID headers back into the file, removes expunged messages, and does so
//! in a single forward pass that moves as few bytes as possible.

pub mod config;
pub mod error;
pub mod index;
pub mod lock;
pub mod model;
pub mod parser;
pub mod store;
pub mod sync;
