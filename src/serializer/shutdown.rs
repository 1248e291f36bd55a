//! Orderly shutdown.
//!
//! ```text
//! Begin ──► WaitingOnSerializer ──► WaitingOnDataBlockManager ──► WaitingOnLba ──► ShutDown
//!            (txns + reads drain)     (GC pass ends)                (LBA persisted)
//! ```

use tracing::{debug, info};

use crate::block::Outcome;
use crate::error::{AtlasError, Result};

use super::{LogSerializer, SerializerState, ShutdownCallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ShutdownStage {
    Begin,
    WaitingOnSerializer,
    WaitingOnDataBlockManager,
    WaitingOnLba,
}

pub(super) struct ShutdownContext {
    stage: ShutdownStage,
    callback: Option<ShutdownCallback>,
}

impl LogSerializer {
    /// Stop accepting work, drain everything in flight and close the device.
    ///
    /// Returns `Complete` when nothing was in flight; otherwise the callback
    /// fires once the last stage finishes.
    pub fn shutdown(
        &mut self,
        callback: impl FnOnce(Result<()>) + 'static,
    ) -> Result<Outcome<()>> {
        match self.state {
            SerializerState::Ready => {}
            SerializerState::Unstarted | SerializerState::ShutDown => {
                self.state = SerializerState::ShutDown;
                self.device = None;
                return Ok(Outcome::Complete(()));
            }
            SerializerState::StartingUp => {
                return Err(AtlasError::InvalidState("startup in progress"));
            }
            SerializerState::ShuttingDown => {
                return Err(AtlasError::InvalidState("shutdown already in progress"));
            }
            SerializerState::Failed => {
                self.device = None;
                return Err(AtlasError::Poisoned);
            }
        }

        info!(
            txns = self.txns.len(),
            reads = self.reads_in_flight,
            "shutdown requested"
        );
        self.state = SerializerState::ShuttingDown;
        self.shutdown = Some(ShutdownContext {
            stage: ShutdownStage::Begin,
            callback: None,
        });
        self.advance_shutdown();

        if self.state == SerializerState::ShutDown {
            return Ok(Outcome::Complete(()));
        }
        if let Some(ctx) = self.shutdown.as_mut() {
            ctx.callback = Some(Box::new(callback));
        }
        Ok(Outcome::Pending)
    }

    /// Step through as many shutdown stages as are already satisfied
    pub(super) fn advance_shutdown(&mut self) {
        if self.state != SerializerState::ShuttingDown {
            return;
        }
        loop {
            let Some(stage) = self.shutdown.as_ref().map(|ctx| ctx.stage) else {
                return;
            };
            let next = match stage {
                ShutdownStage::Begin => {
                    self.data_blocks.shutdown();
                    ShutdownStage::WaitingOnSerializer
                }
                ShutdownStage::WaitingOnSerializer => {
                    if !self.txns.is_empty() || self.reads_in_flight > 0 {
                        return;
                    }
                    ShutdownStage::WaitingOnDataBlockManager
                }
                ShutdownStage::WaitingOnDataBlockManager => {
                    if !self.data_blocks.is_quiesced() {
                        return;
                    }
                    if !self.lba.shutdown() {
                        self.push_flush_txn();
                    }
                    ShutdownStage::WaitingOnLba
                }
                ShutdownStage::WaitingOnLba => {
                    if !self.txns.is_empty() {
                        return;
                    }
                    self.finish_shutdown();
                    return;
                }
            };
            debug!(from = ?stage, to = ?next, "shutdown stage");
            if let Some(ctx) = self.shutdown.as_mut() {
                ctx.stage = next;
            }
        }
    }

    fn finish_shutdown(&mut self) {
        self.state = SerializerState::ShutDown;
        self.device = None;
        info!("serializer shut down");
        if let Some(callback) = self.shutdown.take().and_then(|ctx| ctx.callback) {
            self.defer(move || callback(Ok(())));
        }
    }

    /// Shutdown cannot finish because the serializer was poisoned
    pub(super) fn fail_shutdown(&mut self) {
        if let Some(callback) = self.shutdown.take().and_then(|ctx| ctx.callback) {
            self.defer(move || callback(Err(AtlasError::Poisoned)));
        }
    }
}
