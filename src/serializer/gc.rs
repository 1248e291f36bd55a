//! Garbage collection driver.
//!
//! A pass reads the victim extent's filled range, keeps the records the LBA
//! still points at (skipping blocks with newer uncommitted versions), and
//! writes them back through an ordinary transaction of `Relocate` ops. The
//! victim is pinned while its read is in flight so it cannot be released and
//! reused underneath it.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::data_block::{record, GcState};
use crate::error::Result;

use super::txn::{TxnKind, TxnOp, TxnStage, WriteTxn};
use super::{LogSerializer, PendingIo, SerializerState};

impl LogSerializer {
    /// Start a GC pass if the policy asks for one and none is running
    pub fn consider_start_gc(&mut self) {
        if self.state != SerializerState::Ready || self.data_blocks.gc_state() != GcState::Idle {
            return;
        }
        let Some(victim) = self.data_blocks.select_gc_victim(&self.extents) else {
            return;
        };

        let len = self.data_blocks.gc_read_len(victim) as usize;
        info!(
            victim,
            len,
            density = self.data_blocks.overall_density(),
            "starting GC pass"
        );
        self.extents.pin(victim);
        self.data_blocks.begin_gc_read(victim);
        self.submit_read(victim, len, PendingIo::GcRead { extent: victim });
    }

    pub(super) fn on_gc_read_done(&mut self, extent: u64, result: Result<Bytes>) {
        self.unpin(extent);

        if self.state != SerializerState::Ready {
            self.data_blocks.abandon_gc();
            self.advance_shutdown();
            return;
        }
        let buf = match result {
            Ok(buf) => buf,
            Err(e) => {
                warn!(extent, error = %e, "GC read failed");
                self.data_blocks.abandon_gc();
                return;
            }
        };

        let block_size = self.config.block_size;
        let mut survivors = Vec::new();
        for (id, location) in self.lba.live_blocks_in(extent) {
            if self.overlay.contains_key(&id) {
                continue;
            }
            let start = (location.offset - extent) as usize;
            let end = (start + record::record_len(location.len, block_size) as usize).min(buf.len());
            if start >= end {
                warn!(%id, offset = location.offset, "live record outside GC read range");
                continue;
            }
            match record::decode(&buf.slice(start..end), location.offset, id) {
                Ok(payload) => survivors.push((id, location, payload)),
                Err(e) => warn!(%id, offset = location.offset, error = %e, "skipping unreadable record"),
            }
        }

        if survivors.is_empty() {
            debug!(extent, "GC victim has nothing left to move");
            self.data_blocks.abandon_gc();
            return;
        }

        let needed = self
            .data_blocks
            .extents_needed(survivors.iter().map(|(_, _, payload)| payload.len()))
            + self
                .lba
                .flush_extents_needed(self.unapplied_batches().chain(Some(survivors.len())));
        if let Err(e) = self.extents.ensure_available(needed) {
            warn!(extent, error = %e, "not enough space to relocate GC victim");
            self.data_blocks.abandon_gc();
            return;
        }

        let txn_id = self.allocate_txn_id();
        let mut txn = WriteTxn {
            id: txn_id,
            kind: TxnKind::Gc,
            ops: Vec::with_capacity(survivors.len()),
            outstanding: 0,
            error: None,
            stage: TxnStage::Writing,
        };

        for (id, from, payload) in survivors {
            let placement = match self
                .data_blocks
                .write_block(id, &payload, &mut self.extents)
            {
                Ok(placement) => placement,
                Err(e) => {
                    txn.error = Some(e);
                    break;
                }
            };
            txn.ops.push(TxnOp::Relocate {
                block_id: id,
                location: placement.location,
                from,
            });
            txn.outstanding += 1;
            self.submit_write(
                placement.location.offset,
                placement.record,
                PendingIo::DataWrite { txn: txn_id },
            );
        }

        debug!(extent, txn = txn_id, blocks = txn.ops.len(), "GC relocation submitted");
        self.data_blocks.begin_relocation(txn_id);
        self.push_gc_txn(txn);
    }
}
