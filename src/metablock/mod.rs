//! Metablock Module
//!
//! The recovery anchor: a small checkpoint holding every subsystem's
//! recovery state, written to rotating slots in the reserved first extent.
//!
//! ## Slot Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (24 bytes)                                            │
//! │   Magic: "ATMB" (4) | Version: u16 | Reserved: u16           │
//! │   Seq: u64 (8) | Len: u32 (4) | CRC32(seq ‖ payload) (4)     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload: bincode(Metablock)                                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Zero padding up to the slot size                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sequence `s` lives in slot `s % slots`. Only one metablock write is in
//! flight at a time, so the slot holding the last committed checkpoint is
//! never the one being overwritten.

mod manager;

pub use manager::{Metablock, MetablockManager, METABLOCK_HEADER_SIZE};
