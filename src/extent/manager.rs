//! Extent allocator with reference counts and deferred release.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AtlasError, Result};

/// Extents at the head of the file that are never allocated (metablock region)
pub const RESERVED_EXTENTS: u64 = 1;

/// Extent allocator state persisted in every metablock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentManagerPart {
    /// Number of extents the file has grown to, reserved ones included
    pub extent_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct Retired {
    offset: u64,
    after_seq: u64,
}

/// Tracks every extent of the backing file
///
/// An extent is either free or allocated. Allocated extents carry the number
/// of live blocks pointing into them. Unreferenced extents are retired rather
/// than freed on the spot; `note_commit` and `unpin` move them to the free
/// list once it is safe.
pub struct ExtentManager {
    extent_size: u64,
    max_extents: Option<u64>,
    extent_count: u64,
    refcounts: HashMap<u64, u32>,
    free: BTreeSet<u64>,
    retired: Vec<Retired>,
    pins: HashMap<u64, u32>,
    committed_seq: u64,
    reconstructing: bool,
}

impl ExtentManager {
    /// Create the allocator for a brand new file
    pub fn new(extent_size: u64, max_extents: Option<u64>) -> Self {
        Self {
            extent_size,
            max_extents,
            extent_count: RESERVED_EXTENTS,
            refcounts: HashMap::new(),
            free: BTreeSet::new(),
            retired: Vec::new(),
            pins: HashMap::new(),
            committed_seq: 0,
            reconstructing: false,
        }
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Hand out an unreferenced extent, reusing the lowest free one first
    pub fn allocate_extent(&mut self) -> Result<u64> {
        debug_assert!(!self.reconstructing, "allocation during reconstruction");

        let offset = match self.free.pop_first() {
            Some(offset) => offset,
            None => {
                if self.max_extents.is_some_and(|max| self.extent_count >= max) {
                    return Err(AtlasError::OutOfSpace {
                        needed: 1,
                        available: 0,
                    });
                }
                let offset = self.extent_count * self.extent_size;
                self.extent_count += 1;
                offset
            }
        };

        self.refcounts.insert(offset, 0);
        debug!(offset, extent_count = self.extent_count, "allocated extent");
        Ok(offset)
    }

    /// Fail with `OutOfSpace` unless `needed` extents could be allocated now
    pub fn ensure_available(&self, needed: u64) -> Result<()> {
        let available = self.available();
        if needed > available {
            return Err(AtlasError::OutOfSpace { needed, available });
        }
        Ok(())
    }

    /// Extents that could still be allocated (free list plus growth room)
    pub fn available(&self) -> u64 {
        let growth = match self.max_extents {
            Some(max) => max.saturating_sub(self.extent_count),
            None => u64::MAX / 2,
        };
        self.free.len() as u64 + growth
    }

    /// Return an unreferenced extent to the free list immediately
    pub fn release_extent(&mut self, offset: u64) -> Result<()> {
        match self.refcounts.get(&offset) {
            Some(0) => {}
            Some(refs) => {
                return Err(AtlasError::Corruption(format!(
                    "release of extent {} with {} live references",
                    offset, refs
                )));
            }
            None => {
                return Err(AtlasError::Corruption(format!(
                    "release of unallocated extent {}",
                    offset
                )));
            }
        }
        self.refcounts.remove(&offset);
        self.free.insert(offset);
        debug!(offset, "released extent");
        Ok(())
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Record one more live block in the extent; returns the new count
    pub fn add_reference(&mut self, offset: u64) -> u32 {
        match self.refcounts.get_mut(&offset) {
            Some(refs) => {
                *refs += 1;
                *refs
            }
            None => {
                warn!(offset, "reference added to unallocated extent");
                debug_assert!(false, "reference added to unallocated extent {offset}");
                0
            }
        }
    }

    /// Record one less live block in the extent; returns the new count
    pub fn remove_reference(&mut self, offset: u64) -> u32 {
        match self.refcounts.get_mut(&offset) {
            Some(refs) if *refs > 0 => {
                *refs -= 1;
                *refs
            }
            _ => {
                warn!(offset, "reference removed from unreferenced extent");
                debug_assert!(false, "reference underflow on extent {offset}");
                0
            }
        }
    }

    /// Live-block count of an allocated extent
    pub fn refcount(&self, offset: u64) -> Option<u32> {
        self.refcounts.get(&offset).copied()
    }

    pub fn is_allocated(&self, offset: u64) -> bool {
        self.refcounts.contains_key(&offset)
    }

    // =========================================================================
    // Retirement
    // =========================================================================

    /// Schedule an unreferenced extent for release once the metablock with
    /// sequence `after_seq` has committed and nothing pins it
    pub fn retire_extent(&mut self, offset: u64, after_seq: u64) {
        if self.retired.iter().any(|r| r.offset == offset) {
            return;
        }
        debug!(offset, after_seq, "retired extent");
        self.retired.push(Retired { offset, after_seq });
    }

    pub fn is_retired(&self, offset: u64) -> bool {
        self.retired.iter().any(|r| r.offset == offset)
    }

    /// Keep the extent from being released while a read is in flight
    pub fn pin(&mut self, offset: u64) {
        *self.pins.entry(offset).or_insert(0) += 1;
    }

    /// Drop a read pin; returns extents that became free as a result
    pub fn unpin(&mut self, offset: u64) -> Vec<u64> {
        if let Some(count) = self.pins.get_mut(&offset) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&offset);
            }
        }
        self.collect_retired()
    }

    /// Metablock `seq` is durable; returns extents that became free
    pub fn note_commit(&mut self, seq: u64) -> Vec<u64> {
        self.committed_seq = self.committed_seq.max(seq);
        self.collect_retired()
    }

    fn collect_retired(&mut self) -> Vec<u64> {
        let mut released = Vec::new();
        let mut still_retired = Vec::with_capacity(self.retired.len());

        for retired in std::mem::take(&mut self.retired) {
            match self.refcounts.get(&retired.offset) {
                // Picked up new references (or already gone): no longer retired
                Some(refs) if *refs > 0 => continue,
                None => continue,
                Some(_) => {}
            }
            let pinned = self.pins.contains_key(&retired.offset);
            if retired.after_seq <= self.committed_seq && !pinned {
                self.refcounts.remove(&retired.offset);
                self.free.insert(retired.offset);
                released.push(retired.offset);
            } else {
                still_retired.push(retired);
            }
        }

        self.retired = still_retired;
        if !released.is_empty() {
            debug!(?released, committed_seq = self.committed_seq, "released retired extents");
        }
        released
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    pub fn metablock_part(&self) -> ExtentManagerPart {
        ExtentManagerPart {
            extent_count: self.extent_count,
        }
    }

    /// Begin rebuilding state from a recovered metablock
    pub fn start_reconstruct(&mut self, part: ExtentManagerPart, committed_seq: u64) -> Result<()> {
        if part.extent_count < RESERVED_EXTENTS {
            return Err(AtlasError::Corruption(format!(
                "metablock records {} extents, fewer than the reserved region",
                part.extent_count
            )));
        }
        self.extent_count = part.extent_count;
        self.refcounts.clear();
        self.free.clear();
        self.retired.clear();
        self.pins.clear();
        self.committed_seq = committed_seq;
        self.reconstructing = true;
        Ok(())
    }

    /// Mark an extent as in use; idempotent
    pub fn reserve_extent(&mut self, offset: u64) -> Result<()> {
        debug_assert!(self.reconstructing, "reserve outside reconstruction");

        if offset % self.extent_size != 0 {
            return Err(AtlasError::Corruption(format!(
                "extent offset {} is not aligned to {}",
                offset, self.extent_size
            )));
        }
        let index = offset / self.extent_size;
        if index < RESERVED_EXTENTS || index >= self.extent_count {
            return Err(AtlasError::Corruption(format!(
                "extent offset {} outside the allocatable range of {} extents",
                offset, self.extent_count
            )));
        }
        self.refcounts.entry(offset).or_insert(0);
        Ok(())
    }

    /// Everything not reserved becomes free
    pub fn end_reconstruct(&mut self) {
        for index in RESERVED_EXTENTS..self.extent_count {
            let offset = index * self.extent_size;
            if !self.refcounts.contains_key(&offset) {
                self.free.insert(offset);
            }
        }
        self.reconstructing = false;
        debug!(
            extent_count = self.extent_count,
            allocated = self.refcounts.len(),
            free = self.free.len(),
            "extent reconstruction finished"
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn extent_count(&self) -> u64 {
        self.extent_count
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.refcounts.len()
    }

    pub fn is_free(&self, offset: u64) -> bool {
        self.free.contains(&offset)
    }
}
