//! Block record codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::block::BlockId;
use crate::error::{AtlasError, Result};

/// Magic bytes identifying a block record
pub(crate) const RECORD_MAGIC: &[u8; 4] = b"ATBK";

/// Header size: Magic (4) + CRC (4) + BlockId (8) + Len (4) + Reserved (4)
pub const RECORD_HEADER_SIZE: u64 = 24;

/// On-disk size of a record carrying `payload_len` bytes
pub fn record_len(payload_len: u32, block_size: u64) -> u64 {
    (RECORD_HEADER_SIZE + u64::from(payload_len)).next_multiple_of(block_size)
}

/// Encode a record, padded to `block_size`
pub fn encode(id: BlockId, payload: &[u8], block_size: u64) -> Bytes {
    let total = record_len(payload.len() as u32, block_size) as usize;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(RECORD_MAGIC);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_u64_le(id.get());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(0);
    buf.put_slice(payload);
    buf.resize(total, 0);
    buf.freeze()
}

/// Decode the record at the start of `buf`, checking it belongs to `expected`.
///
/// `offset` is only used for error reporting. The returned payload shares
/// `buf`'s allocation.
pub fn decode(buf: &Bytes, offset: u64, expected: BlockId) -> Result<Bytes> {
    if buf.len() < RECORD_HEADER_SIZE as usize {
        return Err(AtlasError::Corruption(format!(
            "short block record at offset {}",
            offset
        )));
    }
    if &buf[0..4] != RECORD_MAGIC {
        return Err(AtlasError::Corruption(format!(
            "invalid block record magic at offset {}",
            offset
        )));
    }

    let expected_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let mut raw_id = [0u8; 8];
    raw_id.copy_from_slice(&buf[8..16]);
    let id = BlockId::new(u64::from_le_bytes(raw_id));
    let len = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;

    if id != expected {
        return Err(AtlasError::Corruption(format!(
            "record at offset {} belongs to {}, expected {}",
            offset, id, expected
        )));
    }

    let start = RECORD_HEADER_SIZE as usize;
    if buf.len() < start + len {
        return Err(AtlasError::Corruption(format!(
            "record at offset {} claims {} payload bytes past the read range",
            offset, len
        )));
    }

    let payload = buf.slice(start..start + len);
    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(AtlasError::ChecksumMismatch {
            offset,
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    Ok(payload)
}
