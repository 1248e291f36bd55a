//! Garbage collection policy and bookkeeping.
//!
//! The manager only decides *what* to collect. Reading the victim, filtering
//! live blocks through the LBA and relocating them as an ordinary write
//! transaction is driven by the serializer.

use tracing::{debug, info};

use crate::extent::ExtentManager;

use super::manager::DataBlockManager;

/// Progress of the single GC pass that may be running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcState {
    #[default]
    Idle,
    /// Victim contents are being read from disk
    Reading { extent: u64 },
    /// Live blocks were handed to relocation transaction `txn`
    Relocating { extent: u64, txn: u64 },
}

impl GcState {
    pub fn extent(&self) -> Option<u64> {
        match self {
            GcState::Idle => None,
            GcState::Reading { extent } | GcState::Relocating { extent, .. } => Some(*extent),
        }
    }
}

impl DataBlockManager {
    fn density(&self, filled: u64, live: u64) -> f64 {
        if filled == 0 {
            1.0
        } else {
            live as f64 / filled as f64
        }
    }

    /// Candidate extents: filled, not active, nothing unresolved, something live
    fn candidates<'a>(
        &'a self,
        extents: &'a ExtentManager,
    ) -> impl Iterator<Item = (u64, f64)> + 'a {
        self.usage
            .iter()
            .filter(move |(offset, usage)| {
                Some(**offset) != self.active
                    && usage.pending == 0
                    && usage.live_bytes > 0
                    && extents.refcount(**offset).is_some_and(|refs| refs > 0)
            })
            .map(move |(offset, usage)| (*offset, self.density(usage.filled, usage.live_bytes)))
    }

    fn over_budget(&self) -> bool {
        self.gc_extent_budget
            .is_some_and(|budget| self.usage.len() as u64 > budget)
    }

    /// Live density across every filled extent except the active one
    pub fn overall_density(&self) -> f64 {
        let (filled, live) = self
            .usage
            .iter()
            .filter(|(offset, _)| Some(**offset) != self.active)
            .fold((0u64, 0u64), |(f, l), (_, u)| (f + u.filled, l + u.live_bytes));
        self.density(filled, live)
    }

    /// Whether the policy calls for a GC pass right now
    pub fn should_gc(&self) -> bool {
        if self.shutting_down || self.gc != GcState::Idle {
            return false;
        }
        self.over_budget() || self.overall_density() < self.gc_density_threshold
    }

    /// Sparsest eligible extent, if the policy calls for collecting one
    pub fn select_gc_victim(&self, extents: &ExtentManager) -> Option<u64> {
        if !self.should_gc() {
            return None;
        }
        // Under budget pressure any partially-dead extent qualifies
        let limit = if self.over_budget() {
            1.0
        } else {
            self.gc_density_threshold
        };

        let victim = self
            .candidates(extents)
            .filter(|(_, density)| *density < limit)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((extent, density)) = victim {
            debug!(extent, density, "selected GC victim");
        }
        victim.map(|(extent, _)| extent)
    }

    /// Bytes of the victim that must be read to find its live records
    pub fn gc_read_len(&self, extent: u64) -> u64 {
        self.usage
            .get(&extent)
            .map(|usage| usage.filled)
            .unwrap_or(self.extent_size)
    }

    pub fn begin_gc_read(&mut self, extent: u64) {
        debug_assert_eq!(self.gc, GcState::Idle);
        self.gc = GcState::Reading { extent };
    }

    pub fn begin_relocation(&mut self, txn: u64) {
        if let GcState::Reading { extent } = self.gc {
            self.gc = GcState::Relocating { extent, txn };
        }
    }

    /// The relocation transaction committed
    pub fn finish_gc(&mut self) {
        if let Some(extent) = self.gc.extent() {
            self.gc_runs += 1;
            info!(extent, runs = self.gc_runs, "GC pass finished");
        }
        self.gc = GcState::Idle;
    }

    /// Drop the current pass without relocating anything
    pub fn abandon_gc(&mut self) {
        if let Some(extent) = self.gc.extent() {
            debug!(extent, "GC pass abandoned");
        }
        self.gc = GcState::Idle;
    }

    pub fn gc_state(&self) -> GcState {
        self.gc
    }

    pub fn gc_runs(&self) -> u64 {
        self.gc_runs
    }
}
