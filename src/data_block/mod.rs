//! Data Block Module
//!
//! Append-only placement of block payloads plus the garbage collector that
//! rewrites live blocks out of sparse extents.
//!
//! ## Responsibilities
//! - Append records at the fill cursor of the active extent
//! - Switch to a fresh extent when a record would overflow the active one
//! - Track per-extent live bytes and unresolved placements
//! - Pick GC victims by live density and report extents that can be retired
//!
//! ## Record Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (24 bytes)                                            │
//! │   Magic: "ATBK" (4) | CRC32 (4) | BlockId: u64 (8)           │
//! │   Len: u32 (4) | Reserved (4)                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload (Len bytes)                                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Zero padding up to the block size                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod gc;
mod manager;
pub mod record;

pub use gc::GcState;
pub use manager::{DataBlockManager, DataBlockPart, ExtentUsage, Placement};
