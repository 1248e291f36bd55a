//! In-memory device
//!
//! Holds the device contents in a `Vec<u8>`. In `Manual` mode requests are
//! queued until the owner completes them, which lets tests pick the order in
//! which I/O finishes and simulate a crash that loses queued writes.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{BlockDevice, ReadDone, WriteDone};

/// When submitted requests complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Complete inside `submit_*`
    Immediate,
    /// Queue until `complete_next` / `complete_last` / `complete_all`
    Manual,
}

enum Queued {
    Read {
        offset: u64,
        len: usize,
        done: ReadDone,
    },
    Write {
        offset: u64,
        data: Bytes,
        done: WriteDone,
    },
}

struct MemoryInner {
    data: Vec<u8>,
    mode: CompletionMode,
    queue: VecDeque<Queued>,
    failing_writes: usize,
    writes_completed: u64,
}

/// Cloneable handle to a shared in-memory device
#[derive(Clone)]
pub struct MemoryDevice {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryDevice {
    /// Create an empty device
    pub fn new(mode: CompletionMode) -> Self {
        Self::with_contents(Vec::new(), mode)
    }

    fn with_contents(data: Vec<u8>, mode: CompletionMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                data,
                mode,
                queue: VecDeque::new(),
                failing_writes: 0,
                writes_completed: 0,
            })),
        }
    }

    /// Number of queued requests
    pub fn pending_ops(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of queued writes
    pub fn pending_writes(&self) -> usize {
        self.inner
            .lock()
            .queue
            .iter()
            .filter(|q| matches!(q, Queued::Write { .. }))
            .count()
    }

    /// Total writes that have completed successfully
    pub fn writes_completed(&self) -> u64 {
        self.inner.lock().writes_completed
    }

    /// Make the next `count` writes fail with an I/O error
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.lock().failing_writes = count;
    }

    /// Complete the oldest queued request
    pub fn complete_next(&self) -> bool {
        let queued = self.inner.lock().queue.pop_front();
        match queued {
            Some(q) => {
                self.finish(q);
                true
            }
            None => false,
        }
    }

    /// Complete the newest queued request
    pub fn complete_last(&self) -> bool {
        let queued = self.inner.lock().queue.pop_back();
        match queued {
            Some(q) => {
                self.finish(q);
                true
            }
            None => false,
        }
    }

    /// Complete every queued request, including ones queued while completing
    pub fn complete_all(&self) -> usize {
        let mut count = 0;
        while self.complete_next() {
            count += 1;
        }
        count
    }

    /// Simulate power loss: queued writes are lost, completed ones survive.
    ///
    /// Returns a fresh `Immediate` device over the surviving bytes. Queued
    /// completions on this device are dropped without being called.
    pub fn crash(&self) -> MemoryDevice {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        MemoryDevice::with_contents(inner.data.clone(), CompletionMode::Immediate)
    }

    /// Copy of `len` bytes at `offset`, zero-filled past the end
    pub fn read_raw(&self, offset: u64, len: usize) -> Vec<u8> {
        read_range(&self.inner.lock().data, offset, len)
    }

    /// Overwrite bytes directly, bypassing the request path
    pub fn write_raw(&self, offset: u64, data: &[u8]) {
        write_range(&mut self.inner.lock().data, offset, data);
    }

    fn finish(&self, queued: Queued) {
        match queued {
            Queued::Read { offset, len, done } => {
                let buf = read_range(&self.inner.lock().data, offset, len);
                done(Ok(Bytes::from(buf)));
            }
            Queued::Write { offset, data, done } => {
                let result = {
                    let mut inner = self.inner.lock();
                    if inner.failing_writes > 0 {
                        inner.failing_writes -= 1;
                        Err(io::Error::other("injected write failure").into())
                    } else {
                        write_range(&mut inner.data, offset, &data);
                        inner.writes_completed += 1;
                        Ok(())
                    }
                };
                done(result);
            }
        }
    }

    fn submit(&self, queued: Queued) {
        let immediate = {
            let mut inner = self.inner.lock();
            match inner.mode {
                CompletionMode::Immediate => Some(queued),
                CompletionMode::Manual => {
                    inner.queue.push_back(queued);
                    None
                }
            }
        };
        if let Some(q) = immediate {
            self.finish(q);
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn size(&self) -> u64 {
        self.inner.lock().data.len() as u64
    }

    fn submit_read(&mut self, offset: u64, len: usize, done: ReadDone) {
        self.submit(Queued::Read { offset, len, done });
    }

    fn submit_write(&mut self, offset: u64, data: Bytes, done: WriteDone) {
        self.submit(Queued::Write { offset, data, done });
    }
}

fn read_range(data: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let start = offset as usize;
    if start < data.len() {
        let end = (start + len).min(data.len());
        buf[..end - start].copy_from_slice(&data[start..end]);
    }
    buf
}

fn write_range(data: &mut Vec<u8>, offset: u64, bytes: &[u8]) {
    let start = offset as usize;
    let end = start + bytes.len();
    if data.len() < end {
        data.resize(end, 0);
    }
    data[start..end].copy_from_slice(bytes);
}

/// Run a read against a device and wait for it
#[cfg(test)]
pub(crate) fn read_blocking(
    device: &mut dyn BlockDevice,
    offset: u64,
    len: usize,
) -> crate::error::Result<Bytes> {
    let (tx, rx) = crossbeam::channel::bounded(1);
    device.submit_read(
        offset,
        len,
        Box::new(move |r| {
            let _ = tx.send(r);
        }),
    );
    rx.recv()
        .map_err(|_| crate::error::AtlasError::DeviceClosed)?
}
