//! Startup: open the device, then either initialise a new store or recover
//! the newest metablock and rebuild every manager from it.

use bytes::Bytes;
use tracing::{error, info};

use crate::block::Outcome;
use crate::data_block::DataBlockManager;
use crate::error::{AtlasError, Result};
use crate::extent::ExtentManager;
use crate::io::FileDevice;
use crate::lba::LbaIndex;
use crate::metablock::Metablock;

use super::{LogSerializer, PendingIo, ReadyCallback, SerializerState};

pub(super) struct StartupContext {
    callback: Option<ReadyCallback>,
    seq: u64,
    metablock: Metablock,
    lba_buffers: Vec<Option<Bytes>>,
}

impl LogSerializer {
    /// Open the store and bring every manager to a consistent state.
    ///
    /// Always needs disk I/O, so the result arrives through `callback`. A
    /// non-empty device without a valid metablock fails with
    /// `NoValidMetablock`.
    pub fn start(
        &mut self,
        callback: impl FnOnce(Result<()>) + 'static,
    ) -> Result<Outcome<()>> {
        if self.state != SerializerState::Unstarted {
            return Err(AtlasError::InvalidState("serializer already started"));
        }

        if self.device.is_none() {
            let device = FileDevice::open(&self.config.db_path, self.config.sync_strategy)?;
            info!(path = %self.config.db_path.display(), "opened backing file");
            self.device = Some(Box::new(device));
        }
        let size = self.device.as_ref().map(|d| d.size()).unwrap_or(0);

        self.state = SerializerState::StartingUp;
        self.startup = Some(StartupContext {
            callback: Some(Box::new(callback)),
            seq: 0,
            metablock: Metablock::default(),
            lba_buffers: Vec::new(),
        });

        if size == 0 {
            if let Err(e) = self.write_initial_metablock() {
                self.fail_startup(e);
            }
        } else {
            let region = self.metablocks.region_len() as usize;
            self.submit_read(0, region, PendingIo::StartupMetablockRead);
        }
        Ok(Outcome::Pending)
    }

    pub(super) fn on_startup_metablock_write(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                self.extents.note_commit(self.metablocks.next_seq() - 1);
                self.finish_startup();
            }
            Err(e) => self.fail_startup(e),
        }
    }

    pub(super) fn on_startup_metablock_read(&mut self, result: Result<Bytes>) {
        if let Err(e) = self.load_metablock(result) {
            self.fail_startup(e);
        }
    }

    fn load_metablock(&mut self, result: Result<Bytes>) -> Result<()> {
        let region = result?;
        let (seq, metablock) = self
            .metablocks
            .recover(&region)?
            .ok_or(AtlasError::NoValidMetablock)?;

        self.extents = ExtentManager::new(self.config.extent_size, self.config.max_extents);
        self.extents
            .start_reconstruct(metablock.extent_manager, seq)?;

        let lba_extents = metablock.lba_index.extents.clone();
        if let Some(ctx) = self.startup.as_mut() {
            ctx.seq = seq;
            ctx.lba_buffers = vec![None; lba_extents.len()];
            ctx.metablock = metablock;
        }

        if lba_extents.is_empty() {
            return self.rebuild_managers();
        }
        for (index, extent) in lba_extents.iter().enumerate() {
            self.submit_read(
                extent.offset,
                extent.filled as usize,
                PendingIo::StartupLbaRead { index },
            );
        }
        Ok(())
    }

    pub(super) fn on_startup_lba_read(&mut self, index: usize, result: Result<Bytes>) {
        if self.state != SerializerState::StartingUp {
            return;
        }
        let buf = match result {
            Ok(buf) => buf,
            Err(e) => {
                self.fail_startup(e);
                return;
            }
        };

        let complete = match self.startup.as_mut() {
            Some(ctx) => {
                if let Some(slot) = ctx.lba_buffers.get_mut(index) {
                    *slot = Some(buf);
                }
                ctx.lba_buffers.iter().all(Option::is_some)
            }
            None => false,
        };
        if complete {
            if let Err(e) = self.rebuild_managers() {
                self.fail_startup(e);
            }
        }
    }

    /// Every LBA extent has been read; reconstruct and go live
    fn rebuild_managers(&mut self) -> Result<()> {
        let Some(ctx) = self.startup.as_mut() else {
            return Ok(());
        };
        let buffers: Vec<Bytes> = ctx.lba_buffers.drain(..).flatten().collect();
        let metablock = std::mem::take(&mut ctx.metablock);
        let seq = ctx.seq;

        self.lba = LbaIndex::recover(
            &metablock.lba_index,
            &buffers,
            &mut self.extents,
            self.config.block_size,
            self.config.lba_compaction_ratio,
        )?;
        self.data_blocks = DataBlockManager::recover(
            metablock.data_block_manager,
            &self.lba,
            &mut self.extents,
            &self.config,
        )?;
        self.extents.end_reconstruct();

        info!(
            seq,
            extents = self.extents.extent_count(),
            free = self.extents.free_count(),
            max_block_id = self.lba.max_block_id().get(),
            "recovery complete"
        );

        #[cfg(feature = "diagnostics")]
        {
            self.last_metablock = Some(metablock);
        }

        self.finish_startup();
        Ok(())
    }

    fn finish_startup(&mut self) {
        self.state = SerializerState::Ready;
        if let Some(callback) = self.startup.take().and_then(|ctx| ctx.callback) {
            self.defer(move || callback(Ok(())));
        }
        self.consider_start_gc();
    }

    fn fail_startup(&mut self, err: AtlasError) {
        error!(error = %err, "startup failed");
        self.state = SerializerState::Failed;
        if let Some(callback) = self.startup.take().and_then(|ctx| ctx.callback) {
            self.defer(move || callback(Err(err)));
        }
    }
}
