//! Core identifiers shared by every subsystem.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical block identifier handed out by the cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// Creates a BlockId from its raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block:{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Physical location of one block record in the backing file.
///
/// `offset` is the absolute file offset of the record header; `len` is the
/// payload length (the record on disk is longer, see `data_block::record`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    pub offset: u64,
    pub len: u32,
}

impl BlockLocation {
    pub fn new(offset: u64, len: u32) -> Self {
        Self { offset, len }
    }

    /// Offset of the extent containing this block
    pub fn extent(&self, extent_size: u64) -> u64 {
        self.offset - self.offset % extent_size
    }

    /// Offset of the record relative to its extent
    pub fn offset_in_extent(&self, extent_size: u64) -> u64 {
        self.offset % extent_size
    }
}

/// Result of an operation that may finish asynchronously.
///
/// `Complete` means the result is available now and the supplied callback was
/// dropped without being called. `Pending` means the callback fires exactly
/// once from a later `poll()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Complete(T),
    Pending,
}

impl<T> Outcome<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    /// Returns the value if the operation finished synchronously
    pub fn into_complete(self) -> Option<T> {
        match self {
            Outcome::Complete(value) => Some(value),
            Outcome::Pending => None,
        }
    }
}
