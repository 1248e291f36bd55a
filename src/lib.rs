//! # AtlasLog
//!
//! A log-structured block store with:
//! - Append-only placement of variable-sized block payloads into extents
//! - A persistent LBA index mapping block ids to their current location
//! - Garbage collection that rewrites live blocks out of sparse extents
//! - Rotating metablock checkpoints for crash recovery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache Layer                            │
//! │          (do_read / do_write / shutdown by BlockId)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   LogSerializer                             │
//! │        (overlay, ordered txn chain, event loop)             │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//!  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐
//!  │ DataBlock │  │    LBA    │  │ Metablock │  │  Extent   │
//!  │ Manager+GC│  │   Index   │  │  Manager  │  │ Allocator │
//!  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘  └───────────┘
//!        │              │              │
//!        └──────────────┴──────┬───────┘
//!                              ▼
//!                      ┌─────────────┐
//!                      │ BlockDevice │
//!                      │ (file/mem)  │
//!                      └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod block;

pub mod io;
pub mod extent;
pub mod lba;
pub mod data_block;
pub mod metablock;
pub mod serializer;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use block::{BlockId, BlockLocation, Outcome};
pub use config::{Config, SyncStrategy};
pub use error::{AtlasError, Result};
pub use io::{BlockDevice, CompletionMode, FileDevice, MemoryDevice};
pub use serializer::{BlockWrite, LogSerializer, SerializerState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasLog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
