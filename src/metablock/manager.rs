//! Metablock encoding, slot rotation and recovery scan.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data_block::DataBlockPart;
use crate::error::{AtlasError, Result};
use crate::extent::ExtentManagerPart;
use crate::lba::LbaPart;

const METABLOCK_MAGIC: &[u8; 4] = b"ATMB";
const METABLOCK_VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + Reserved (2) + Seq (8) + Len (4) + CRC (4)
pub const METABLOCK_HEADER_SIZE: usize = 24;

/// Joint recovery state of the three managers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metablock {
    pub extent_manager: ExtentManagerPart,
    pub lba_index: LbaPart,
    pub data_block_manager: DataBlockPart,
}

/// Assigns sequence numbers and slots to metablocks
#[derive(Debug)]
pub struct MetablockManager {
    slot_size: u64,
    slots: u32,
    next_seq: u64,
}

impl MetablockManager {
    pub fn new(slot_size: u64, slots: u32) -> Self {
        Self {
            slot_size,
            slots,
            next_seq: 1,
        }
    }

    /// Sequence number the next `prepare_write` will use
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Bytes to read at offset 0 to see every slot
    pub fn region_len(&self) -> u64 {
        self.slot_size * u64::from(self.slots)
    }

    fn slot_offset(&self, seq: u64) -> u64 {
        (seq % u64::from(self.slots)) * self.slot_size
    }

    /// Encode `metablock` under the next sequence number.
    ///
    /// Returns the sequence, the device offset of its slot, and the slot bytes.
    pub fn prepare_write(&mut self, metablock: &Metablock) -> Result<(u64, u64, Bytes)> {
        let payload = bincode::serialize(metablock)?;
        if METABLOCK_HEADER_SIZE + payload.len() > self.slot_size as usize {
            return Err(AtlasError::Serialization(format!(
                "metablock of {} bytes exceeds the {} byte slot",
                payload.len(),
                self.slot_size
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&seq.to_le_bytes());
        hasher.update(&payload);

        let mut buf = BytesMut::with_capacity(self.slot_size as usize);
        buf.put_slice(METABLOCK_MAGIC);
        buf.put_u16_le(METABLOCK_VERSION);
        buf.put_u16_le(0);
        buf.put_u64_le(seq);
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(hasher.finalize());
        buf.put_slice(&payload);
        buf.resize(self.slot_size as usize, 0);

        let offset = self.slot_offset(seq);
        debug!(seq, offset, len = payload.len(), "prepared metablock");
        Ok((seq, offset, buf.freeze()))
    }

    /// Find the newest valid metablock in the slot region.
    ///
    /// Torn or blank slots are skipped. Later writes continue after the
    /// highest sequence found.
    pub fn recover(&mut self, region: &[u8]) -> Result<Option<(u64, Metablock)>> {
        let mut latest: Option<(u64, Metablock)> = None;

        for slot in 0..self.slots as usize {
            let start = slot * self.slot_size as usize;
            let end = (start + self.slot_size as usize).min(region.len());
            if start >= end {
                break;
            }
            match decode_slot(&region[start..end]) {
                Some((seq, metablock)) => {
                    if latest.as_ref().map_or(true, |(best, _)| seq > *best) {
                        latest = Some((seq, metablock));
                    }
                }
                None => continue,
            }
        }

        match &latest {
            Some((seq, _)) => {
                self.next_seq = seq + 1;
                info!(seq, "recovered metablock");
            }
            None => warn!("no valid metablock in {} slots", self.slots),
        }
        Ok(latest)
    }
}

/// Decode one slot, None if it is blank, torn or from another version
fn decode_slot(slot: &[u8]) -> Option<(u64, Metablock)> {
    if slot.len() < METABLOCK_HEADER_SIZE || &slot[0..4] != METABLOCK_MAGIC {
        return None;
    }
    let version = u16::from_le_bytes([slot[4], slot[5]]);
    if version != METABLOCK_VERSION {
        warn!(version, "skipping metablock with unknown version");
        return None;
    }

    let mut raw_seq = [0u8; 8];
    raw_seq.copy_from_slice(&slot[8..16]);
    let seq = u64::from_le_bytes(raw_seq);
    let len = u32::from_le_bytes([slot[16], slot[17], slot[18], slot[19]]) as usize;
    let expected_crc = u32::from_le_bytes([slot[20], slot[21], slot[22], slot[23]]);

    let payload = slot.get(METABLOCK_HEADER_SIZE..METABLOCK_HEADER_SIZE + len)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw_seq);
    hasher.update(payload);
    if hasher.finalize() != expected_crc {
        warn!(seq, "skipping metablock with bad checksum");
        return None;
    }

    match bincode::deserialize(payload) {
        Ok(metablock) => Some((seq, metablock)),
        Err(e) => {
            warn!(seq, error = %e, "skipping undecodable metablock");
            None
        }
    }
}
