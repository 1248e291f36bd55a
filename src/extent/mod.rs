//! Extent Module
//!
//! Owns the fixed-size regions ("extents") the backing file is carved into.
//!
//! ## Responsibilities
//! - Hand out extents from the free list, growing the file when it is empty
//! - Track live-block reference counts per extent
//! - Retire unreferenced extents and release them once no committed
//!   metablock and no in-flight read can still observe them
//! - Rebuild the free list during recovery
//!
//! ## Layout
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────┐
//! │ extent 0     │ extent 1     │ extent 2     │ ... │
//! │ (metablocks) │ (data / LBA) │ (data / LBA) │     │
//! └──────────────┴──────────────┴──────────────┴─────┘
//! ```

mod manager;

pub use manager::{ExtentManager, ExtentManagerPart, RESERVED_EXTENTS};
