//! Data block manager: append path, extent usage, and recovery.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block::{BlockId, BlockLocation};
use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::extent::ExtentManager;
use crate::lba::LbaIndex;

use super::gc::GcState;
use super::record::{self, RECORD_HEADER_SIZE};

/// Data block manager state persisted in every metablock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataBlockPart {
    /// Extent currently being filled
    pub active_extent: Option<u64>,
    /// Next free offset within the active extent
    pub cursor: u64,
}

/// Accounting for one data extent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentUsage {
    /// Bytes written from the start of the extent
    pub filled: u64,
    /// Bytes of records the LBA currently points at
    pub live_bytes: u64,
    /// Records written but not yet applied to or discarded from the LBA
    pub pending: u32,
}

/// Where a payload was placed and the record bytes to write there
#[derive(Debug, Clone)]
pub struct Placement {
    pub location: BlockLocation,
    pub record: Bytes,
}

/// Appends records into extents and tracks how much of each is live
pub struct DataBlockManager {
    pub(super) extent_size: u64,
    block_size: u64,
    pub(super) gc_density_threshold: f64,
    pub(super) gc_extent_budget: Option<u64>,

    pub(super) active: Option<u64>,
    cursor: u64,
    pub(super) usage: BTreeMap<u64, ExtentUsage>,

    pub(super) gc: GcState,
    pub(super) gc_runs: u64,
    pub(super) shutting_down: bool,
}

impl DataBlockManager {
    /// Create a manager with no extents
    pub fn new(config: &Config) -> Self {
        Self {
            extent_size: config.extent_size,
            block_size: config.block_size,
            gc_density_threshold: config.gc_density_threshold,
            gc_extent_budget: config.gc_extent_budget,
            active: None,
            cursor: 0,
            usage: BTreeMap::new(),
            gc: GcState::Idle,
            gc_runs: 0,
            shutting_down: false,
        }
    }

    /// Largest payload a single extent can hold
    pub fn max_payload(&self) -> usize {
        (self.extent_size - RECORD_HEADER_SIZE) as usize
    }

    fn record_len(&self, payload_len: u32) -> u64 {
        record::record_len(payload_len, self.block_size)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Fresh extents needed to place payloads of the given lengths in order
    pub fn extents_needed(&self, payload_lens: impl IntoIterator<Item = usize>) -> u64 {
        let mut cursor = match self.active {
            Some(_) => self.cursor,
            None => self.extent_size,
        };
        let mut needed = 0;
        for len in payload_lens {
            let size = self.record_len(len as u32);
            if cursor + size > self.extent_size {
                needed += 1;
                cursor = 0;
            }
            cursor += size;
        }
        needed
    }

    /// Append a payload at the active extent's cursor.
    ///
    /// The returned placement must later be resolved with `on_applied` or
    /// `on_discarded`.
    pub fn write_block(
        &mut self,
        id: BlockId,
        payload: &[u8],
        extents: &mut ExtentManager,
    ) -> Result<Placement> {
        if payload.len() > self.max_payload() {
            return Err(AtlasError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload(),
            });
        }

        let size = self.record_len(payload.len() as u32);
        let active = match self.active {
            Some(extent) if self.cursor + size <= self.extent_size => extent,
            _ => {
                let extent = extents.allocate_extent()?;
                if let Some(previous) = self.active {
                    debug!(previous, next = extent, "active extent filled");
                }
                self.usage.insert(extent, ExtentUsage::default());
                self.active = Some(extent);
                self.cursor = 0;
                extent
            }
        };

        let location = BlockLocation::new(active + self.cursor, payload.len() as u32);
        self.cursor += size;

        let usage = self.usage.entry(active).or_default();
        usage.filled = self.cursor;
        usage.pending += 1;

        Ok(Placement {
            location,
            record: record::encode(id, payload, self.block_size),
        })
    }

    /// A placement was applied to the LBA and is now live
    pub fn on_applied(&mut self, location: BlockLocation) {
        let size = self.record_len(location.len);
        if let Some(usage) = self.usage.get_mut(&location.extent(self.extent_size)) {
            usage.pending = usage.pending.saturating_sub(1);
            usage.live_bytes += size;
        }
    }

    /// A placement will never be referenced (failed write, lost GC race)
    pub fn on_discarded(&mut self, location: BlockLocation) {
        if let Some(usage) = self.usage.get_mut(&location.extent(self.extent_size)) {
            usage.pending = usage.pending.saturating_sub(1);
        }
    }

    /// A live record was replaced or deleted in the LBA
    pub fn on_superseded(&mut self, location: BlockLocation) {
        let size = self.record_len(location.len);
        if let Some(usage) = self.usage.get_mut(&location.extent(self.extent_size)) {
            usage.live_bytes = usage.live_bytes.saturating_sub(size);
        }
    }

    /// Remove and return data extents nothing can reference any more
    pub fn take_retirable(&mut self, extents: &ExtentManager) -> Vec<u64> {
        let retirable: Vec<u64> = self
            .usage
            .iter()
            .filter(|(offset, usage)| {
                Some(**offset) != self.active
                    && usage.pending == 0
                    && extents.refcount(**offset) == Some(0)
            })
            .map(|(offset, _)| *offset)
            .collect();

        for offset in &retirable {
            self.usage.remove(offset);
        }
        retirable
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    pub fn metablock_part(&self) -> DataBlockPart {
        DataBlockPart {
            active_extent: self.active,
            cursor: self.cursor,
        }
    }

    /// Rebuild usage from the recovered LBA and reserve the active extent
    pub fn recover(
        part: DataBlockPart,
        lba: &LbaIndex,
        extents: &mut ExtentManager,
        config: &Config,
    ) -> Result<Self> {
        let mut manager = Self::new(config);

        if let Some(active) = part.active_extent {
            if part.cursor > manager.extent_size || part.cursor % manager.block_size != 0 {
                return Err(AtlasError::Corruption(format!(
                    "active extent {} has invalid cursor {}",
                    active, part.cursor
                )));
            }
            extents.reserve_extent(active)?;
            manager.active = Some(active);
            manager.cursor = part.cursor;
            manager.usage.insert(
                active,
                ExtentUsage {
                    filled: part.cursor,
                    ..ExtentUsage::default()
                },
            );
        }

        for (id, loc) in lba.iter_live() {
            let extent = loc.extent(manager.extent_size);
            let size = manager.record_len(loc.len);
            if Some(extent) == manager.active
                && loc.offset_in_extent(manager.extent_size) + size > manager.cursor
            {
                return Err(AtlasError::Corruption(format!(
                    "{} at offset {} lies beyond the active extent's cursor",
                    id, loc.offset
                )));
            }
            let usage = manager.usage.entry(extent).or_insert(ExtentUsage {
                filled: manager.extent_size,
                ..ExtentUsage::default()
            });
            usage.live_bytes += size;
        }

        info!(
            active = ?manager.active,
            cursor = manager.cursor,
            data_extents = manager.usage.len(),
            "data block manager recovered"
        );
        Ok(manager)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop starting GC work; true if nothing is in flight
    pub fn shutdown(&mut self) -> bool {
        self.shutting_down = true;
        self.is_quiesced()
    }

    pub fn is_quiesced(&self) -> bool {
        matches!(self.gc, GcState::Idle)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn active_extent(&self) -> Option<u64> {
        self.active
    }

    pub fn usage(&self, extent: u64) -> Option<ExtentUsage> {
        self.usage.get(&extent).copied()
    }
}
