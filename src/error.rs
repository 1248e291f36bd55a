//! Error types for AtlasLog
//!
//! Provides a unified error type for all serializer operations.

use thiserror::Error;

use crate::block::BlockId;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasLog operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device closed")]
    DeviceClosed,

    // -------------------------------------------------------------------------
    // Space Errors
    // -------------------------------------------------------------------------
    #[error("Out of disk space: {needed} extent(s) needed, {available} available")]
    OutOfSpace { needed: u64, available: u64 },

    #[error("Payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Block not present: {0}")]
    BlockNotFound(BlockId),

    #[error("{id} is outside the supported range (limit {limit})")]
    BlockIdOutOfRange { id: BlockId, limit: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    // -------------------------------------------------------------------------
    // Recovery / Corruption Errors
    // -------------------------------------------------------------------------
    #[error("No valid metablock found on a non-empty device")]
    NoValidMetablock,

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch at offset {offset}: expected {expected:#x}, actual {actual:#x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Serializer poisoned by an earlier checkpoint failure")]
    Poisoned,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for AtlasError {
    fn from(err: bincode::Error) -> Self {
        AtlasError::Serialization(err.to_string())
    }
}
