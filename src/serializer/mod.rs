//! Serializer Module
//!
//! The coordinator that owns every subsystem and exposes the caller-facing
//! read / write / shutdown operations.
//!
//! ## Responsibilities
//! - Drive startup recovery and orderly shutdown of the managers
//! - Serve reads from the in-flight overlay, falling back to the LBA and disk
//! - Chain write transactions so their checkpoints commit in arrival order
//! - Kick off garbage collection once write bookkeeping settles
//!
//! ## Execution Model
//!
//! ```text
//!   caller ──► do_read / do_write / shutdown ──► BlockDevice::submit_*
//!                                                      │
//!                                                      ▼ (any thread)
//!   caller ◄── callbacks ◄── poll() ◄── IoEvent ◄── crossbeam channel
//! ```
//!
//! Device completions never touch serializer state. They post an `IoEvent`
//! and the owning thread applies it inside `poll()` or `run_until_idle()`,
//! which is also where every caller callback runs.

mod gc;
mod shutdown;
mod startup;
mod txn;

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::block::{BlockId, BlockLocation, Outcome};
use crate::config::Config;
use crate::data_block::{record, DataBlockManager};
use crate::error::{AtlasError, Result};
use crate::extent::ExtentManager;
use crate::io::BlockDevice;
use crate::lba::LbaIndex;
use crate::metablock::MetablockManager;

#[cfg(feature = "diagnostics")]
use crate::data_block::GcState;
#[cfg(feature = "diagnostics")]
use crate::metablock::Metablock;

pub use txn::BlockWrite;

use shutdown::ShutdownContext;
use startup::StartupContext;
use txn::WriteTxn;

/// Completion for `start`
pub type ReadyCallback = Box<dyn FnOnce(Result<()>)>;

/// Completion for `do_read`
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes>)>;

/// Completion for a write transaction
pub type WriteCallback = Box<dyn FnOnce(Result<()>)>;

/// Completion for `shutdown`
pub type ShutdownCallback = Box<dyn FnOnce(Result<()>)>;

/// Lifecycle of a serializer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerState {
    Unstarted,
    StartingUp,
    Ready,
    ShuttingDown,
    ShutDown,
    /// Startup failed or a checkpoint write failed; only shutdown is accepted
    Failed,
}

/// A finished device operation, posted by the completion closure
struct IoEvent {
    token: u64,
    result: IoResult,
}

enum IoResult {
    Read(Result<Bytes>),
    Write(Result<()>),
}

/// What a device operation was issued for
enum PendingIo {
    DataWrite {
        txn: u64,
    },
    Read {
        id: BlockId,
        location: BlockLocation,
        callback: ReadCallback,
    },
    GcRead {
        extent: u64,
    },
    LbaWrite {
        txn: u64,
    },
    MetablockWrite {
        txn: u64,
        seq: u64,
    },
    StartupMetablockRead,
    StartupLbaRead {
        index: usize,
    },
    StartupMetablockWrite,
}

/// A not-yet-committed version of a block
struct OverlayEntry {
    txn: u64,
    /// None for a deletion
    data: Option<Bytes>,
}

/// Log-structured block store over a single device
pub struct LogSerializer {
    config: Config,
    state: SerializerState,

    device: Option<Box<dyn BlockDevice>>,
    events_tx: Sender<IoEvent>,
    events_rx: Receiver<IoEvent>,
    next_token: u64,
    pending_io: HashMap<u64, PendingIo>,

    /// Caller callbacks waiting to run at the end of `poll()`
    callbacks: VecDeque<Box<dyn FnOnce()>>,

    extents: ExtentManager,
    lba: LbaIndex,
    data_blocks: DataBlockManager,
    metablocks: MetablockManager,

    next_txn: u64,
    txns: VecDeque<WriteTxn>,

    /// Uncommitted versions per block, oldest first
    overlay: BTreeMap<BlockId, Vec<OverlayEntry>>,
    reads_in_flight: usize,

    startup: Option<StartupContext>,
    shutdown: Option<ShutdownContext>,

    #[cfg(feature = "diagnostics")]
    last_metablock: Option<Metablock>,
}

impl LogSerializer {
    /// Create a serializer that opens `config.db_path` on `start`
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Create a serializer over an already-open device
    pub fn with_device(config: Config, device: Box<dyn BlockDevice>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, Some(device)))
    }

    fn build(config: Config, device: Option<Box<dyn BlockDevice>>) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        Self {
            extents: ExtentManager::new(config.extent_size, config.max_extents),
            lba: LbaIndex::new(
                config.extent_size,
                config.block_size,
                config.lba_compaction_ratio,
            ),
            data_blocks: DataBlockManager::new(&config),
            metablocks: MetablockManager::new(
                config.metablock_slot_size(),
                config.metablock_slots,
            ),
            config,
            state: SerializerState::Unstarted,
            device,
            events_tx,
            events_rx,
            next_token: 0,
            pending_io: HashMap::new(),
            callbacks: VecDeque::new(),
            next_txn: 0,
            txns: VecDeque::new(),
            overlay: BTreeMap::new(),
            reads_in_flight: 0,
            startup: None,
            shutdown: None,
            #[cfg(feature = "diagnostics")]
            last_metablock: None,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn state(&self) -> SerializerState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every block that exists has an id below this one
    pub fn max_block_id(&self) -> BlockId {
        let from_overlay = self
            .overlay
            .keys()
            .next_back()
            .map(|id| BlockId::new(id.get().saturating_add(1)))
            .unwrap_or(BlockId::new(0));
        self.lba.max_block_id().max(from_overlay)
    }

    /// Whether the newest accepted version of a block is live
    pub fn block_in_use(&self, id: BlockId) -> bool {
        match self.overlay.get(&id).and_then(|versions| versions.last()) {
            Some(entry) => entry.data.is_some(),
            None => self.lba.block_in_use(id),
        }
    }

    /// True when no device operation is outstanding
    pub fn is_idle(&self) -> bool {
        self.pending_io.is_empty() && self.callbacks.is_empty()
    }

    fn check_accepting(&self) -> Result<()> {
        match self.state {
            SerializerState::Ready => Ok(()),
            SerializerState::Failed => Err(AtlasError::Poisoned),
            SerializerState::Unstarted | SerializerState::StartingUp => {
                Err(AtlasError::InvalidState("serializer is not started"))
            }
            SerializerState::ShuttingDown | SerializerState::ShutDown => {
                Err(AtlasError::InvalidState("serializer is shutting down"))
            }
        }
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Read the current payload of a block.
    ///
    /// Versions still being written are served from memory. A block that was
    /// never written or is deleted yields `BlockNotFound`.
    pub fn do_read(
        &mut self,
        id: BlockId,
        callback: impl FnOnce(Result<Bytes>) + 'static,
    ) -> Result<Outcome<Bytes>> {
        self.check_accepting()?;

        if let Some(entry) = self.overlay.get(&id).and_then(|versions| versions.last()) {
            return match &entry.data {
                Some(data) => Ok(Outcome::Complete(data.clone())),
                None => Err(AtlasError::BlockNotFound(id)),
            };
        }

        let Some(location) = self.lba.lookup(id).and_then(|entry| entry.location()) else {
            return Err(AtlasError::BlockNotFound(id));
        };

        let extent = location.extent(self.config.extent_size);
        self.extents.pin(extent);
        self.reads_in_flight += 1;

        let len = record::record_len(location.len, self.config.block_size) as usize;
        self.submit_read(
            location.offset,
            len,
            PendingIo::Read {
                id,
                location,
                callback: Box::new(callback),
            },
        );
        Ok(Outcome::Pending)
    }

    fn on_read_done(
        &mut self,
        id: BlockId,
        location: BlockLocation,
        callback: ReadCallback,
        result: Result<Bytes>,
    ) {
        self.reads_in_flight -= 1;
        self.unpin(location.extent(self.config.extent_size));

        let result = result.and_then(|buf| record::decode(&buf, location.offset, id));
        if let Err(e) = &result {
            warn!(%id, offset = location.offset, error = %e, "block read failed");
        }
        self.defer(move || callback(result));
        self.advance_shutdown();
    }

    fn unpin(&mut self, extent: u64) {
        let released = self.extents.unpin(extent);
        if !released.is_empty() {
            debug!(?released, "extents released after read");
        }
    }

    // =========================================================================
    // Event Loop
    // =========================================================================

    /// Apply every completion that has arrived and run ready callbacks.
    ///
    /// Never blocks. Returns the number of events and callbacks processed.
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            processed += 1;
        }
        processed + self.run_callbacks()
    }

    /// Block until no device operation is outstanding.
    ///
    /// Requires a device that completes on its own; with a manually driven
    /// device use `poll()` instead.
    pub fn run_until_idle(&mut self) {
        loop {
            self.run_callbacks();
            if self.pending_io.is_empty() {
                break;
            }
            match self.events_rx.recv() {
                Ok(event) => self.handle_event(event),
                Err(_) => break,
            }
        }
    }

    fn run_callbacks(&mut self) -> usize {
        let mut ran = 0;
        while let Some(callback) = self.callbacks.pop_front() {
            callback();
            ran += 1;
        }
        ran
    }

    fn defer(&mut self, callback: impl FnOnce() + 'static) {
        self.callbacks.push_back(Box::new(callback));
    }

    fn handle_event(&mut self, event: IoEvent) {
        let Some(pending) = self.pending_io.remove(&event.token) else {
            warn!(token = event.token, "completion for unknown request");
            return;
        };

        match (pending, event.result) {
            (PendingIo::DataWrite { txn }, IoResult::Write(result)) => {
                self.on_data_write_done(txn, result)
            }
            (PendingIo::Read { id, location, callback }, IoResult::Read(result)) => {
                self.on_read_done(id, location, callback, result)
            }
            (PendingIo::GcRead { extent }, IoResult::Read(result)) => {
                self.on_gc_read_done(extent, result)
            }
            (PendingIo::LbaWrite { txn }, IoResult::Write(result)) => {
                self.on_lba_write_done(txn, result)
            }
            (PendingIo::MetablockWrite { txn, seq }, IoResult::Write(result)) => {
                self.on_metablock_write_done(txn, seq, result)
            }
            (PendingIo::StartupMetablockRead, IoResult::Read(result)) => {
                self.on_startup_metablock_read(result)
            }
            (PendingIo::StartupLbaRead { index }, IoResult::Read(result)) => {
                self.on_startup_lba_read(index, result)
            }
            (PendingIo::StartupMetablockWrite, IoResult::Write(result)) => {
                self.on_startup_metablock_write(result)
            }
            (_, _) => {
                error!(token = event.token, "completion kind does not match request");
            }
        }
    }

    // =========================================================================
    // Device Submission
    // =========================================================================

    fn register(&mut self, pending: PendingIo) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.pending_io.insert(token, pending);
        token
    }

    fn submit_read(&mut self, offset: u64, len: usize, pending: PendingIo) {
        let token = self.register(pending);
        let tx = self.events_tx.clone();
        let done = move |result: Result<Bytes>| {
            // The receiver only disappears with the serializer itself
            let _ = tx.send(IoEvent {
                token,
                result: IoResult::Read(result),
            });
        };
        match self.device.as_mut() {
            Some(device) => device.submit_read(offset, len, Box::new(done)),
            None => done(Err(AtlasError::DeviceClosed)),
        }
    }

    fn submit_write(&mut self, offset: u64, data: Bytes, pending: PendingIo) {
        let token = self.register(pending);
        let tx = self.events_tx.clone();
        let done = move |result: Result<()>| {
            let _ = tx.send(IoEvent {
                token,
                result: IoResult::Write(result),
            });
        };
        match self.device.as_mut() {
            Some(device) => device.submit_write(offset, data, Box::new(done)),
            None => done(Err(AtlasError::DeviceClosed)),
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Whether the allocator counts any live block in `extent`
    #[cfg(feature = "diagnostics")]
    pub fn is_extent_referenced(&self, extent: u64) -> bool {
        self.extents.refcount(extent).is_some_and(|refs| refs > 0)
    }

    /// Allocator reference count of `extent`, zero if unallocated
    #[cfg(feature = "diagnostics")]
    pub fn extent_refcount(&self, extent: u64) -> u32 {
        self.extents.refcount(extent).unwrap_or(0)
    }

    /// Live LBA entries pointing into `extent`, counted by scanning the index
    #[cfg(feature = "diagnostics")]
    pub fn lba_extent_refcount(&self, extent: u64) -> u32 {
        self.lba.extent_refcount(extent)
    }

    /// The most recent metablock committed or recovered
    #[cfg(feature = "diagnostics")]
    pub fn last_metablock(&self) -> Option<&Metablock> {
        self.last_metablock.as_ref()
    }

    /// Extents on the free list
    #[cfg(feature = "diagnostics")]
    pub fn free_extent_count(&self) -> usize {
        self.extents.free_count()
    }

    /// Completed garbage-collection passes
    #[cfg(feature = "diagnostics")]
    pub fn gc_runs(&self) -> u64 {
        self.data_blocks.gc_runs()
    }

    /// Progress of the current garbage-collection pass
    #[cfg(feature = "diagnostics")]
    pub fn gc_state(&self) -> GcState {
        self.data_blocks.gc_state()
    }

    /// Extent the data block manager is currently appending to
    #[cfg(feature = "diagnostics")]
    pub fn active_extent(&self) -> Option<u64> {
        self.data_blocks.active_extent()
    }
}
