//! LBA Index Module
//!
//! Persistent mapping from block id to the block's current on-disk location.
//!
//! ## Responsibilities
//! - Point lookups, updates and deletions by block id
//! - Keep extent reference counts in step with every update/delete
//! - Persist itself incrementally as an append-only log of chunks living in
//!   dedicated LBA extents, compacting into a fresh snapshot when the log grows
//! - Contribute its extent list (the recovery cursor) to the metablock
//!
//! ## Chunk Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (16 bytes)                                       │
//! │   Magic: "ATLB" (4) | Count: u32 (4) | CRC32 (4) | 0 (4)│
//! ├─────────────────────────────────────────────────────────┤
//! │ Entries (20 bytes each)                                 │
//! │   [BlockId: u64][Offset: u64][Len: u32]                 │
//! │   (Offset = u64::MAX means deleted)                     │
//! ├─────────────────────────────────────────────────────────┤
//! │ Zero padding up to the block size                       │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod entry;
mod index;

pub use entry::LbaEntry;
pub use index::{LbaExtent, LbaFlush, LbaIndex, LbaPart, LbaWrite, Superseded, MAX_LOG_EXTENTS};
