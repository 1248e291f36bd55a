//! Write transactions and the ordered commit chain.
//!
//! Every transaction joins `txns` in arrival order. Payload writes are
//! submitted immediately, but LBA mutations are applied only once a
//! transaction is at the head of the chain with all its payloads durable.
//! The head then flushes the LBA and writes a metablock; the next
//! transaction does not start its checkpoint until that metablock commits.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::block::{BlockId, BlockLocation, Outcome};
use crate::data_block::record::RECORD_HEADER_SIZE;
use crate::error::{AtlasError, Result};
use crate::lba::LbaEntry;
use crate::metablock::Metablock;

use super::{LogSerializer, OverlayEntry, PendingIo, SerializerState, WriteCallback};

/// One entry of a write batch
pub struct BlockWrite<'a> {
    pub block_id: BlockId,
    /// New payload, or None to delete the block
    pub data: Option<&'a [u8]>,
    /// Fired once the transaction commits
    pub callback: Option<Box<dyn FnOnce()>>,
}

impl<'a> BlockWrite<'a> {
    pub fn update(block_id: BlockId, data: &'a [u8]) -> Self {
        Self {
            block_id,
            data: Some(data),
            callback: None,
        }
    }

    pub fn delete(block_id: BlockId) -> Self {
        Self {
            block_id,
            data: None,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: impl FnOnce() + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum TxnOp {
    Update {
        block_id: BlockId,
        location: BlockLocation,
    },
    Delete {
        block_id: BlockId,
    },
    /// GC copy; applied only if the block still lives at `from`
    Relocate {
        block_id: BlockId,
        location: BlockLocation,
        from: BlockLocation,
    },
}

impl TxnOp {
    /// Location this op placed a record at, if any
    fn placed(&self) -> Option<BlockLocation> {
        match self {
            TxnOp::Update { location, .. } | TxnOp::Relocate { location, .. } => Some(*location),
            TxnOp::Delete { .. } => None,
        }
    }
}

pub(super) enum TxnKind {
    Client {
        callback: Option<WriteCallback>,
        block_callbacks: Vec<Box<dyn FnOnce()>>,
    },
    Gc,
    /// Checkpoint with no ops, used to persist leftover LBA changes
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TxnStage {
    /// Payload writes outstanding or waiting to reach the head
    Writing,
    FlushingLba { remaining: usize },
    WritingMetablock { seq: u64 },
}

pub(super) struct WriteTxn {
    pub(super) id: u64,
    pub(super) kind: TxnKind,
    pub(super) ops: Vec<TxnOp>,
    /// Payload writes not yet completed
    pub(super) outstanding: usize,
    pub(super) error: Option<AtlasError>,
    pub(super) stage: TxnStage,
}

impl WriteTxn {
    fn is_gc(&self) -> bool {
        matches!(self.kind, TxnKind::Gc)
    }

    /// Resolve with the transaction's callbacks; block callbacks only run on success
    fn into_completion(self, result: Result<()>) -> Option<Box<dyn FnOnce()>> {
        match self.kind {
            TxnKind::Client {
                callback,
                block_callbacks,
            } => {
                let ok = result.is_ok();
                Some(Box::new(move || {
                    if ok {
                        for block_callback in block_callbacks {
                            block_callback();
                        }
                    }
                    if let Some(callback) = callback {
                        callback(result);
                    }
                }))
            }
            TxnKind::Gc | TxnKind::Flush => None,
        }
    }
}

impl LogSerializer {
    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a batch of updates and deletions as one transaction.
    ///
    /// The callback fires after the transaction's metablock commits, and only
    /// after every earlier transaction has committed. An empty batch with no
    /// transaction in flight completes immediately.
    pub fn do_write(
        &mut self,
        writes: Vec<BlockWrite<'_>>,
        callback: impl FnOnce(Result<()>) + 'static,
    ) -> Result<Outcome<()>> {
        self.check_accepting()?;
        if writes.is_empty() && self.txns.is_empty() {
            return Ok(Outcome::Complete(()));
        }

        for write in &writes {
            self.lba.check_id(write.block_id)?;
        }

        let max = self.data_blocks.max_payload();
        if let Some(len) = writes
            .iter()
            .filter_map(|w| w.data.map(<[u8]>::len))
            .find(|len| *len > max)
        {
            return Err(AtlasError::PayloadTooLarge { len, max });
        }

        let data_extents = self
            .data_blocks
            .extents_needed(writes.iter().filter_map(|w| w.data.map(<[u8]>::len)));
        let lba_extents = self
            .lba
            .flush_extents_needed(self.unapplied_batches().chain(Some(writes.len())));
        self.extents.ensure_available(data_extents + lba_extents)?;

        let txn_id = self.allocate_txn_id();
        let mut txn = WriteTxn {
            id: txn_id,
            kind: TxnKind::Client {
                callback: Some(Box::new(callback)),
                block_callbacks: Vec::new(),
            },
            ops: Vec::with_capacity(writes.len()),
            outstanding: 0,
            error: None,
            stage: TxnStage::Writing,
        };

        for write in writes {
            if let (TxnKind::Client { block_callbacks, .. }, Some(cb)) =
                (&mut txn.kind, write.callback)
            {
                block_callbacks.push(cb);
            }

            let Some(data) = write.data else {
                txn.ops.push(TxnOp::Delete {
                    block_id: write.block_id,
                });
                self.overlay_insert(write.block_id, txn_id, None);
                continue;
            };

            let placement =
                match self
                    .data_blocks
                    .write_block(write.block_id, data, &mut self.extents)
                {
                    Ok(placement) => placement,
                    Err(e) => {
                        // Already-submitted writes finish; the txn fails at the head
                        error!(txn = txn_id, error = %e, "block placement failed");
                        txn.error = Some(e);
                        break;
                    }
                };

            let payload = placement
                .record
                .slice(RECORD_HEADER_SIZE as usize..RECORD_HEADER_SIZE as usize + data.len());
            self.overlay_insert(write.block_id, txn_id, Some(payload));

            txn.ops.push(TxnOp::Update {
                block_id: write.block_id,
                location: placement.location,
            });
            txn.outstanding += 1;
            self.submit_write(
                placement.location.offset,
                placement.record,
                PendingIo::DataWrite { txn: txn_id },
            );
        }

        debug!(
            txn = txn_id,
            ops = txn.ops.len(),
            writes = txn.outstanding,
            "write transaction submitted"
        );
        self.txns.push_back(txn);
        self.advance_chain();
        Ok(Outcome::Pending)
    }

    /// Queue a transaction that writes already-placed GC copies
    pub(super) fn push_gc_txn(&mut self, txn: WriteTxn) {
        self.txns.push_back(txn);
        self.advance_chain();
    }

    /// Queue an op-less checkpoint
    pub(super) fn push_flush_txn(&mut self) {
        let id = self.allocate_txn_id();
        self.txns.push_back(WriteTxn {
            id,
            kind: TxnKind::Flush,
            ops: Vec::new(),
            outstanding: 0,
            error: None,
            stage: TxnStage::Writing,
        });
        self.advance_chain();
    }

    /// Entry counts of queued transactions whose LBA flush is still ahead,
    /// in commit order
    pub(super) fn unapplied_batches(&self) -> impl Iterator<Item = usize> + '_ {
        self.txns
            .iter()
            .filter(|txn| txn.stage == TxnStage::Writing)
            .map(|txn| txn.ops.len())
    }

    pub(super) fn allocate_txn_id(&mut self) -> u64 {
        let id = self.next_txn;
        self.next_txn += 1;
        id
    }

    fn overlay_insert(&mut self, id: BlockId, txn: u64, data: Option<Bytes>) {
        self.overlay
            .entry(id)
            .or_default()
            .push(OverlayEntry { txn, data });
    }

    fn overlay_remove(&mut self, txn: &WriteTxn) {
        for op in &txn.ops {
            let block_id = match op {
                TxnOp::Update { block_id, .. } | TxnOp::Delete { block_id } => *block_id,
                TxnOp::Relocate { .. } => continue,
            };
            if let Some(versions) = self.overlay.get_mut(&block_id) {
                versions.retain(|entry| entry.txn != txn.id);
                if versions.is_empty() {
                    self.overlay.remove(&block_id);
                }
            }
        }
    }

    fn find_txn(&mut self, id: u64) -> Option<&mut WriteTxn> {
        self.txns.iter_mut().find(|txn| txn.id == id)
    }

    // =========================================================================
    // Completions
    // =========================================================================

    pub(super) fn on_data_write_done(&mut self, txn_id: u64, result: Result<()>) {
        let Some(txn) = self.find_txn(txn_id) else {
            return;
        };
        txn.outstanding -= 1;
        if let Err(e) = result {
            warn!(txn = txn_id, error = %e, "data write failed");
            txn.error.get_or_insert(e);
        }
        self.advance_chain();
    }

    pub(super) fn on_lba_write_done(&mut self, txn_id: u64, result: Result<()>) {
        if let Err(e) = result {
            self.poison(e);
            return;
        }
        let Some(txn) = self.find_txn(txn_id) else {
            return;
        };
        let TxnStage::FlushingLba { remaining } = &mut txn.stage else {
            return;
        };
        *remaining -= 1;
        if *remaining == 0 {
            if let Err(e) = self.write_metablock() {
                self.poison(e);
            }
        }
    }

    pub(super) fn on_metablock_write_done(&mut self, txn_id: u64, seq: u64, result: Result<()>) {
        if let Err(e) = result {
            self.poison(e);
            return;
        }
        let committing = self
            .txns
            .front()
            .is_some_and(|txn| txn.stage == TxnStage::WritingMetablock { seq });
        if !committing {
            warn!(txn = txn_id, seq, "metablock completion out of order");
            return;
        }
        let Some(txn) = self.txns.pop_front() else {
            return;
        };

        let released = self.extents.note_commit(seq);
        debug!(txn = txn_id, seq, ?released, "metablock committed");

        self.overlay_remove(&txn);
        if txn.is_gc() {
            self.data_blocks.finish_gc();
        }
        if let Some(completion) = txn.into_completion(Ok(())) {
            self.callbacks.push_back(completion);
        }

        self.advance_chain();
        self.consider_start_gc();
        self.advance_shutdown();
    }

    // =========================================================================
    // Chain Head
    // =========================================================================

    /// Move the head of the chain forward as far as it can go without I/O
    pub(super) fn advance_chain(&mut self) {
        while let Some(head) = self.txns.front() {
            if head.stage != TxnStage::Writing || head.outstanding > 0 {
                return;
            }

            if head.error.is_some() {
                if let Some(mut txn) = self.txns.pop_front() {
                    let err = txn.error.take().unwrap_or(AtlasError::Poisoned);
                    self.fail_txn(txn, err);
                }
                continue;
            }

            if let Err(e) = self.apply_head() {
                self.poison(e);
            }
            return;
        }
        self.advance_shutdown();
    }

    /// Drop a transaction whose payloads never all became durable
    fn fail_txn(&mut self, txn: WriteTxn, err: AtlasError) {
        warn!(txn = txn.id, error = %err, "write transaction failed");
        for location in txn.ops.iter().filter_map(TxnOp::placed) {
            self.data_blocks.on_discarded(location);
        }
        self.overlay_remove(&txn);
        if txn.is_gc() {
            self.data_blocks.abandon_gc();
        }
        if let Some(completion) = txn.into_completion(Err(err)) {
            self.callbacks.push_back(completion);
        }
    }

    /// Apply the head's ops to the LBA and start its checkpoint
    fn apply_head(&mut self) -> Result<()> {
        let Some(head) = self.txns.front() else {
            return Ok(());
        };
        let txn_id = head.id;
        let ops = head.ops.clone();

        let mut relocated = 0usize;
        for op in ops {
            match op {
                TxnOp::Update { block_id, location } => {
                    self.apply_update(block_id, location);
                }
                TxnOp::Delete { block_id } => {
                    if let Some(old) = self.lba.delete(block_id, &mut self.extents) {
                        self.data_blocks.on_superseded(old.location);
                    }
                }
                TxnOp::Relocate {
                    block_id,
                    location,
                    from,
                } => {
                    if self.lba.lookup(block_id) == Some(LbaEntry::Live(from)) {
                        self.apply_update(block_id, location);
                        relocated += 1;
                    } else {
                        // Overwritten or deleted since the GC read
                        self.data_blocks.on_discarded(location);
                    }
                }
            }
        }
        if relocated > 0 {
            debug!(txn = txn_id, relocated, "GC relocations applied");
        }

        let seq = self.metablocks.next_seq();
        for extent in self.data_blocks.take_retirable(&self.extents) {
            self.extents.retire_extent(extent, seq);
        }

        let flush = self.lba.prepare_flush(&mut self.extents)?;
        for extent in &flush.retired {
            self.extents.retire_extent(*extent, seq);
        }

        let writes = flush.writes;
        if writes.is_empty() {
            return self.write_metablock();
        }

        if let Some(head) = self.txns.front_mut() {
            head.stage = TxnStage::FlushingLba {
                remaining: writes.len(),
            };
        }
        for write in writes {
            self.submit_write(write.offset, write.data, PendingIo::LbaWrite { txn: txn_id });
        }
        Ok(())
    }

    fn apply_update(&mut self, block_id: BlockId, location: BlockLocation) {
        if let Some(old) = self.lba.update(block_id, location, &mut self.extents) {
            self.data_blocks.on_superseded(old.location);
        }
        self.data_blocks.on_applied(location);
    }

    fn current_metablock(&self) -> Metablock {
        Metablock {
            extent_manager: self.extents.metablock_part(),
            lba_index: self.lba.metablock_part(),
            data_block_manager: self.data_blocks.metablock_part(),
        }
    }

    /// Write the checkpoint for the head transaction
    fn write_metablock(&mut self) -> Result<()> {
        let Some(txn_id) = self.txns.front().map(|txn| txn.id) else {
            return Ok(());
        };

        let metablock = self.current_metablock();
        let (seq, offset, data) = self.metablocks.prepare_write(&metablock)?;

        #[cfg(feature = "diagnostics")]
        {
            self.last_metablock = Some(metablock);
        }

        if let Some(head) = self.txns.front_mut() {
            head.stage = TxnStage::WritingMetablock { seq };
        }
        self.submit_write(offset, data, PendingIo::MetablockWrite { txn: txn_id, seq });
        Ok(())
    }

    /// Write the checkpoint describing freshly initialised managers
    pub(super) fn write_initial_metablock(&mut self) -> Result<()> {
        let metablock = self.current_metablock();
        let (seq, offset, data) = self.metablocks.prepare_write(&metablock)?;
        info!(seq, "initialising new store");

        #[cfg(feature = "diagnostics")]
        {
            self.last_metablock = Some(metablock);
        }

        self.submit_write(offset, data, PendingIo::StartupMetablockWrite);
        Ok(())
    }

    // =========================================================================
    // Failure
    // =========================================================================

    /// A checkpoint could not be persisted; refuse all further work
    pub(super) fn poison(&mut self, err: AtlasError) {
        error!(error = %err, "checkpoint failed, serializer poisoned");
        self.state = SerializerState::Failed;

        let mut first = Some(err);
        while let Some(txn) = self.txns.pop_front() {
            let err = first.take().unwrap_or(AtlasError::Poisoned);
            if txn.stage == TxnStage::Writing {
                for location in txn.ops.iter().filter_map(TxnOp::placed) {
                    self.data_blocks.on_discarded(location);
                }
            }
            if let Some(completion) = txn.into_completion(Err(err)) {
                self.callbacks.push_back(completion);
            }
        }
        self.overlay.clear();
        self.data_blocks.abandon_gc();
        self.fail_shutdown();
    }
}
