//! In-memory LBA index with incremental on-disk persistence.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block::{BlockId, BlockLocation};
use crate::data_block::record;
use crate::error::{AtlasError, Result};
use crate::extent::ExtentManager;

use super::entry::{self, LbaEntry, CHUNK_HEADER_SIZE, ENTRY_SIZE};

/// Above this many LBA extents a checkpoint always compacts
const MAX_LBA_EXTENTS: usize = 128;

/// A full snapshot never needs more than this many extents; it bounds the
/// block id space so a compaction always brings the log back under
/// `MAX_LBA_EXTENTS`
const MAX_SNAPSHOT_EXTENTS: u64 = MAX_LBA_EXTENTS as u64 / 2;

/// Longest extent list a metablock can carry: a log just under the trigger
/// plus one flush of every id
pub const MAX_LOG_EXTENTS: usize = MAX_LBA_EXTENTS + MAX_SNAPSHOT_EXTENTS as usize;

/// Lower bound on the id count used by the compaction ratio
const MIN_COMPACTION_BASE: u64 = 64;

/// One extent of the on-disk LBA log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbaExtent {
    pub offset: u64,
    /// Bytes of chunks written so far
    pub filled: u64,
}

/// LBA state persisted in every metablock
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LbaPart {
    /// Log extents in replay order
    pub extents: Vec<LbaExtent>,
    /// Entries written across all log extents
    pub disk_entries: u64,
}

/// One chunk write produced by a flush
#[derive(Debug, Clone)]
pub struct LbaWrite {
    pub offset: u64,
    pub data: Bytes,
}

/// Result of preparing a flush
#[derive(Debug, Default)]
pub struct LbaFlush {
    pub writes: Vec<LbaWrite>,
    /// Old log extents dropped by a compaction
    pub retired: Vec<u64>,
    pub compacted: bool,
}

/// The previous location of a block that an update or delete replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superseded {
    pub location: BlockLocation,
    /// References left on the old location's extent
    pub remaining_refs: u32,
}

/// Maps block ids to their current on-disk location
pub struct LbaIndex {
    extent_size: u64,
    block_size: u64,
    compaction_ratio: u64,

    /// Indexed by block id; None = never written
    entries: Vec<Option<LbaEntry>>,
    /// Number of `Some` slots in `entries`
    written: u64,

    /// Entries changed since the last flush
    dirty: BTreeMap<BlockId, LbaEntry>,

    extents: Vec<LbaExtent>,
    disk_entries: u64,
    shut_down: bool,
}

impl LbaIndex {
    /// Create an empty index
    pub fn new(extent_size: u64, block_size: u64, compaction_ratio: u64) -> Self {
        Self {
            extent_size,
            block_size,
            compaction_ratio,
            entries: Vec::new(),
            written: 0,
            dirty: BTreeMap::new(),
            extents: Vec::new(),
            disk_entries: 0,
            shut_down: false,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current entry for a block id, None if never written
    pub fn lookup(&self, id: BlockId) -> Option<LbaEntry> {
        self.entries.get(id.index()).copied().flatten()
    }

    /// Every existing block has an id below this one
    pub fn max_block_id(&self) -> BlockId {
        BlockId::new(self.entries.len() as u64)
    }

    /// Whether the block currently holds a live version
    pub fn block_in_use(&self, id: BlockId) -> bool {
        self.lookup(id).and_then(|entry| entry.location()).is_some()
    }

    /// Entries that fit in one chunk filling a whole extent
    fn entries_per_extent(&self) -> u64 {
        (self.extent_size - CHUNK_HEADER_SIZE) / ENTRY_SIZE
    }

    /// Block ids must stay below this value
    pub fn id_limit(&self) -> u64 {
        MAX_SNAPSHOT_EXTENTS * self.entries_per_extent()
    }

    /// Reject ids the index cannot hold
    pub fn check_id(&self, id: BlockId) -> Result<()> {
        let limit = self.id_limit();
        if id.get() >= limit {
            return Err(AtlasError::BlockIdOutOfRange { id, limit });
        }
        Ok(())
    }

    /// Live blocks whose current version sits in `extent`
    pub fn live_blocks_in(&self, extent: u64) -> Vec<(BlockId, BlockLocation)> {
        self.iter_live()
            .filter(|(_, loc)| loc.extent(self.extent_size) == extent)
            .collect()
    }

    /// Every live block with its location, in id order
    pub fn iter_live(&self) -> impl Iterator<Item = (BlockId, BlockLocation)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.and_then(|entry| entry.location())
                .map(|loc| (BlockId::new(i as u64), loc))
        })
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Point a block at a new location, moving one reference from the old
    /// extent (if any) to the new one
    pub fn update(
        &mut self,
        id: BlockId,
        location: BlockLocation,
        extents: &mut ExtentManager,
    ) -> Option<Superseded> {
        debug_assert!(!self.shut_down, "LBA update after shutdown");

        if self.entries.len() <= id.index() {
            self.entries.resize(id.index() + 1, None);
        }
        let previous = self.entries[id.index()].replace(LbaEntry::Live(location));
        if previous.is_none() {
            self.written += 1;
        }
        self.dirty.insert(id, LbaEntry::Live(location));
        extents.add_reference(location.extent(self.extent_size));

        match previous {
            Some(LbaEntry::Live(old)) => Some(Superseded {
                location: old,
                remaining_refs: extents.remove_reference(old.extent(self.extent_size)),
            }),
            _ => None,
        }
    }

    /// Mark a block deleted; deleting a deleted or never-written id is a no-op
    pub fn delete(&mut self, id: BlockId, extents: &mut ExtentManager) -> Option<Superseded> {
        debug_assert!(!self.shut_down, "LBA delete after shutdown");

        let slot = self.entries.get_mut(id.index())?;
        let Some(LbaEntry::Live(old)) = *slot else {
            return None;
        };
        *slot = Some(LbaEntry::Deleted);
        self.dirty.insert(id, LbaEntry::Deleted);

        Some(Superseded {
            location: old,
            remaining_refs: extents.remove_reference(old.extent(self.extent_size)),
        })
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn compaction_due(&self, log_extents: usize, disk_entries: u64) -> bool {
        let base = (self.entries.len() as u64).max(MIN_COMPACTION_BASE);
        log_extents > MAX_LBA_EXTENTS || disk_entries > self.compaction_ratio.saturating_mul(base)
    }

    fn needs_compaction(&self) -> bool {
        self.compaction_due(self.extents.len(), self.disk_entries)
    }

    /// Entries a chunk written into `room` free bytes can carry
    fn chunk_fit(room: u64) -> u64 {
        if room >= CHUNK_HEADER_SIZE + ENTRY_SIZE {
            (room - CHUNK_HEADER_SIZE) / ENTRY_SIZE
        } else {
            0
        }
    }

    /// Upper bound on the fresh extents taken by a run of future flushes.
    ///
    /// `batches` holds, in commit order, the number of entries each upcoming
    /// checkpoint will change; entries already dirty count towards the first.
    /// Every flush writes at least one chunk padded to `block_size`, and a
    /// flush that falls due for compaction rewrites every written id.
    pub fn flush_extents_needed(&self, batches: impl IntoIterator<Item = usize>) -> u64 {
        let per_extent = self.entries_per_extent();
        if per_extent == 0 {
            return 0;
        }

        let mut room = self
            .extents
            .last()
            .map(|e| self.extent_size - e.filled)
            .unwrap_or(0);
        let mut log_extents = self.extents.len();
        let mut disk_entries = self.disk_entries;
        let mut written = self.written;
        let mut dirty = self.dirty.len() as u64;
        let mut needed = 0;

        for batch in batches {
            let count = dirty + batch as u64;
            dirty = 0;
            written += batch as u64;

            if self.compaction_due(log_extents, disk_entries) {
                let fresh = written.div_ceil(per_extent);
                needed += fresh;
                log_extents = fresh as usize;
                disk_entries = written;
                let tail = written - fresh.saturating_sub(1) * per_extent;
                room = if fresh == 0 {
                    0
                } else {
                    self.extent_size - entry::chunk_len(tail as usize, self.block_size)
                };
                continue;
            }

            let mut left = count;
            while left > 0 {
                let fit = Self::chunk_fit(room);
                if fit == 0 {
                    needed += 1;
                    log_extents += 1;
                    room = self.extent_size;
                    continue;
                }
                let take = fit.min(left);
                room -= entry::chunk_len(take as usize, self.block_size);
                left -= take;
            }
            disk_entries += count;
        }
        needed
    }

    /// Turn pending changes into chunk writes.
    ///
    /// Normally only dirty entries are appended. When the log has grown past
    /// the compaction threshold the whole index is written into fresh
    /// extents and the old ones are handed back for retirement.
    pub fn prepare_flush(&mut self, extents: &mut ExtentManager) -> Result<LbaFlush> {
        let mut flush = LbaFlush::default();

        let records: Vec<(BlockId, LbaEntry)> = if self.needs_compaction() {
            flush.compacted = true;
            flush.retired = self.extents.drain(..).map(|e| e.offset).collect();
            self.disk_entries = 0;
            self.dirty.clear();
            self.entries
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.map(|entry| (BlockId::new(i as u64), entry)))
                .collect()
        } else {
            std::mem::take(&mut self.dirty).into_iter().collect()
        };

        let mut remaining: &[(BlockId, LbaEntry)] = &records;
        while !remaining.is_empty() {
            let room = self
                .extents
                .last()
                .map(|e| self.extent_size - e.filled)
                .unwrap_or(0);
            let fit = Self::chunk_fit(room) as usize;
            if fit == 0 {
                let offset = extents.allocate_extent()?;
                self.extents.push(LbaExtent { offset, filled: 0 });
                continue;
            }

            let take = fit.min(remaining.len());
            let (chunk, rest) = remaining.split_at(take);
            let data = entry::encode_chunk(chunk, self.block_size);

            // The loop only reaches here with an extent present
            let Some(current) = self.extents.last_mut() else {
                break;
            };
            flush.writes.push(LbaWrite {
                offset: current.offset + current.filled,
                data: data.clone(),
            });
            current.filled += data.len() as u64;
            self.disk_entries += take as u64;
            remaining = rest;
        }

        if flush.compacted {
            info!(
                entries = records.len(),
                extents = self.extents.len(),
                retired = flush.retired.len(),
                "compacted LBA log"
            );
        } else if !records.is_empty() {
            debug!(entries = records.len(), chunks = flush.writes.len(), "flushing LBA");
        }

        Ok(flush)
    }

    pub fn metablock_part(&self) -> LbaPart {
        LbaPart {
            extents: self.extents.clone(),
            disk_entries: self.disk_entries,
        }
    }

    /// Rebuild the index from its log extents.
    ///
    /// `buffers[i]` holds the filled prefix of `part.extents[i]`. Log extents
    /// and every extent holding a live block are reserved in `extents`, and
    /// each live block adds one reference.
    pub fn recover(
        part: &LbaPart,
        buffers: &[Bytes],
        extents: &mut ExtentManager,
        block_size: u64,
        compaction_ratio: u64,
    ) -> Result<Self> {
        let extent_size = extents.extent_size();
        let mut index = Self::new(extent_size, block_size, compaction_ratio);

        if buffers.len() != part.extents.len() {
            return Err(AtlasError::Corruption(format!(
                "expected {} LBA extents, read {}",
                part.extents.len(),
                buffers.len()
            )));
        }

        let limit = index.id_limit();
        let mut replayed = 0u64;
        for (lba_extent, buf) in part.extents.iter().zip(buffers) {
            extents.reserve_extent(lba_extent.offset)?;
            if lba_extent.filled > extent_size || buf.len() as u64 != lba_extent.filled {
                return Err(AtlasError::Corruption(format!(
                    "LBA extent {} has inconsistent fill {}",
                    lba_extent.offset, lba_extent.filled
                )));
            }

            for (id, entry) in entry::decode_chunks(buf, lba_extent.offset, block_size)? {
                if id.get() >= limit {
                    return Err(AtlasError::Corruption(format!(
                        "LBA extent {} names {} beyond the id limit {}",
                        lba_extent.offset, id, limit
                    )));
                }
                if index.entries.len() <= id.index() {
                    index.entries.resize(id.index() + 1, None);
                }
                index.entries[id.index()] = Some(entry);
                replayed += 1;
            }
        }

        for (id, loc) in index.iter_live().collect::<Vec<_>>() {
            let end = loc.offset_in_extent(extent_size) + record::record_len(loc.len, block_size);
            if end > extent_size {
                return Err(AtlasError::Corruption(format!(
                    "{} at offset {} overruns its extent",
                    id, loc.offset
                )));
            }
            let extent = loc.extent(extent_size);
            extents.reserve_extent(extent)?;
            extents.add_reference(extent);
        }

        index.written = index.entries.iter().filter(|e| e.is_some()).count() as u64;
        index.extents = part.extents.clone();
        index.disk_entries = replayed;

        info!(
            replayed,
            max_block_id = index.entries.len(),
            lba_extents = index.extents.len(),
            "LBA index recovered"
        );
        Ok(index)
    }

    /// Stop accepting changes; true if nothing is left to flush
    pub fn shutdown(&mut self) -> bool {
        self.shut_down = true;
        self.dirty.is_empty()
    }

    /// Log extents currently in use
    pub fn extents(&self) -> &[LbaExtent] {
        &self.extents
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Whether any live entry points into `extent` (full scan)
    #[cfg(any(test, feature = "diagnostics"))]
    pub fn is_extent_referenced(&self, extent: u64) -> bool {
        self.iter_live()
            .any(|(_, loc)| loc.extent(self.extent_size) == extent)
    }

    /// Number of live entries pointing into `extent` (full scan)
    #[cfg(any(test, feature = "diagnostics"))]
    pub fn extent_refcount(&self, extent: u64) -> u32 {
        self.iter_live()
            .filter(|(_, loc)| loc.extent(self.extent_size) == extent)
            .count() as u32
    }
}
