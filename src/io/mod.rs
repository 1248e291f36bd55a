//! Disk I/O Module
//!
//! The asynchronous block-device collaborator the serializer drives.
//!
//! ## Contract
//! - `submit_read` / `submit_write` return immediately
//! - The supplied completion is invoked exactly once, possibly from another
//!   thread, when the operation finishes
//! - A write completion means the bytes are as durable as the device's sync
//!   strategy makes them
//!
//! The serializer never mutates its own state from inside a completion; it
//! forwards the result onto its event channel and handles it in `poll()`.

mod file;
mod memory;

use bytes::Bytes;

use crate::error::Result;

pub use file::FileDevice;
pub use memory::{CompletionMode, MemoryDevice};

/// Completion for a read: the bytes read, zero-filled past end of device
pub type ReadDone = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// Completion for a write
pub type WriteDone = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Block-aligned asynchronous storage backing a serializer
pub trait BlockDevice: Send {
    /// Current logical size of the device in bytes
    fn size(&self) -> u64;

    /// Read `len` bytes at `offset`
    fn submit_read(&mut self, offset: u64, len: usize, done: ReadDone);

    /// Write `data` at `offset`, growing the device if needed
    fn submit_write(&mut self, offset: u64, data: Bytes, done: WriteDone);
}
