//! Binary index file format.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER (128 bytes, fixed)            │
//! │  magic: [u8; 8] = b"MBXSYNC\0"       │
//! │  version: u32                        │
//! │  flags: IndexFlags (u32)             │
//! │  uid_validity: u32                   │
//! │  next_uid: u32                       │
//! │  sync_fingerprint: (u64, i64)        │
//! │  dirty_fingerprint: (u64, i64)       │
//! │  message_count: u64                  │
//! │  body_sha256: [u8; 32]               │
//! │  (padding to 128 bytes)              │
//! ├──────────────────────────────────────┤
//! │ BODY (variable)                      │
//! │  bincode-serialized IndexBody        │
//! └──────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::store::file::Fingerprint;

/// Magic bytes identifying an mboxsync index file.
pub const MAGIC: &[u8; 8] = b"MBXSYNC\0";

/// Current index format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 128;

bitflags::bitflags! {
    /// Mailbox-wide index state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct IndexFlags: u32 {
        /// A sync found the file and index irreconcilable.
        const CORRUPTED       = 0b0001;
        /// A lazy sync saw broken UIDs; the next write-capable sync must
        /// scan everything.
        const NEEDS_FULL_SYNC = 0b0010;
    }
}

impl Default for IndexFlags {
    fn default() -> Self {
        IndexFlags::empty()
    }
}

/// Serializable index header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    /// Magic bytes (must equal [`MAGIC`]).
    pub magic: [u8; 8],
    /// Format version (must equal [`VERSION`]).
    pub version: u32,
    pub flags: IndexFlags,
    /// Generation of the UID space; 0 until the first sync.
    pub uid_validity: u32,
    /// Next UID to assign.
    pub next_uid: u32,
    /// File state after the last sync that saw every record.
    pub sync_fingerprint: Fingerprint,
    /// File state after the last sync, even a partial one.
    pub dirty_fingerprint: Fingerprint,
    /// Number of records in the body.
    pub message_count: u64,
    /// SHA-256 of the serialized body.
    pub body_sha256: [u8; 32],
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            flags: IndexFlags::empty(),
            uid_validity: 0,
            next_uid: 1,
            sync_fingerprint: Fingerprint::default(),
            dirty_fingerprint: Fingerprint::default(),
            message_count: 0,
            body_sha256: [0; 32],
        }
    }
}

impl IndexHeader {
    /// Validate that the header is well-formed and matches the current format.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.magic != *MAGIC {
            return Err("Invalid magic bytes".into());
        }
        if self.version != VERSION {
            return Err(format!(
                "Incompatible version: expected {VERSION}, found {}",
                self.version
            ));
        }
        if self.next_uid == 0 {
            return Err("next UID is zero".into());
        }
        Ok(())
    }

    pub fn is_corrupted(&self) -> bool {
        self.flags.contains(IndexFlags::CORRUPTED)
    }

    /// Serialize into exactly [`HEADER_SIZE`] bytes.
    pub fn to_padded_bytes(&self) -> bincode::Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        let mut padded = vec![0u8; HEADER_SIZE];
        let len = bytes.len().min(HEADER_SIZE);
        padded[..len].copy_from_slice(&bytes[..len]);
        Ok(padded)
    }
}
