//! LBA entries and the on-disk chunk codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::block::{BlockId, BlockLocation};
use crate::error::{AtlasError, Result};

/// Magic bytes identifying an LBA chunk
pub(crate) const CHUNK_MAGIC: &[u8; 4] = b"ATLB";

/// Header size: Magic (4) + Count (4) + CRC (4) + Reserved (4) = 16 bytes
pub(crate) const CHUNK_HEADER_SIZE: u64 = 16;

/// Entry size: BlockId (8) + Offset (8) + Len (4) = 20 bytes
pub(crate) const ENTRY_SIZE: u64 = 20;

/// Sentinel offset marking a deleted block
const DELETED_OFFSET: u64 = u64::MAX;

/// State of a block id that has been written at least once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbaEntry {
    /// Current version lives here
    Live(BlockLocation),

    /// The block was deleted
    Deleted,
}

impl LbaEntry {
    pub fn location(&self) -> Option<BlockLocation> {
        match self {
            LbaEntry::Live(loc) => Some(*loc),
            LbaEntry::Deleted => None,
        }
    }
}

/// On-disk size of a chunk holding `count` entries
pub(crate) fn chunk_len(count: usize, block_size: u64) -> u64 {
    (CHUNK_HEADER_SIZE + ENTRY_SIZE * count as u64).next_multiple_of(block_size)
}

/// Encode one chunk, padded to `block_size`
pub(crate) fn encode_chunk(records: &[(BlockId, LbaEntry)], block_size: u64) -> Bytes {
    let mut body = BytesMut::with_capacity(records.len() * ENTRY_SIZE as usize);
    for (id, entry) in records {
        body.put_u64_le(id.get());
        match entry {
            LbaEntry::Live(loc) => {
                body.put_u64_le(loc.offset);
                body.put_u32_le(loc.len);
            }
            LbaEntry::Deleted => {
                body.put_u64_le(DELETED_OFFSET);
                body.put_u32_le(0);
            }
        }
    }

    let total = chunk_len(records.len(), block_size) as usize;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(CHUNK_MAGIC);
    buf.put_u32_le(records.len() as u32);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_u32_le(0);
    buf.put_slice(&body);
    buf.resize(total, 0);
    buf.freeze()
}

/// Decode every chunk in the filled prefix of an LBA extent
pub(crate) fn decode_chunks(
    buf: &[u8],
    extent_offset: u64,
    block_size: u64,
) -> Result<Vec<(BlockId, LbaEntry)>> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        let chunk_offset = extent_offset + pos as u64;
        if buf.len() - pos < CHUNK_HEADER_SIZE as usize {
            return Err(AtlasError::Corruption(format!(
                "truncated LBA chunk header at offset {}",
                chunk_offset
            )));
        }
        let header = &buf[pos..pos + CHUNK_HEADER_SIZE as usize];
        if &header[0..4] != CHUNK_MAGIC {
            return Err(AtlasError::Corruption(format!(
                "invalid LBA chunk magic at offset {}",
                chunk_offset
            )));
        }
        let count = read_u32(header, 4) as usize;
        let expected_crc = read_u32(header, 8);

        let body_start = pos + CHUNK_HEADER_SIZE as usize;
        let body_end = body_start + count * ENTRY_SIZE as usize;
        if body_end > buf.len() {
            return Err(AtlasError::Corruption(format!(
                "LBA chunk at offset {} claims {} entries past the filled range",
                chunk_offset, count
            )));
        }
        let body = &buf[body_start..body_end];
        let actual_crc = crc32fast::hash(body);
        if actual_crc != expected_crc {
            return Err(AtlasError::ChecksumMismatch {
                offset: chunk_offset,
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        for raw in body.chunks_exact(ENTRY_SIZE as usize) {
            let id = BlockId::new(read_u64(raw, 0));
            let offset = read_u64(raw, 8);
            let entry = if offset == DELETED_OFFSET {
                LbaEntry::Deleted
            } else {
                LbaEntry::Live(BlockLocation::new(offset, read_u32(raw, 16)))
            };
            records.push((id, entry));
        }

        pos += chunk_len(count, block_size) as usize;
    }

    Ok(records)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}
