//! MBOX parsing: the record scanner and managed-header handling.

pub mod header;
pub mod mbox;
