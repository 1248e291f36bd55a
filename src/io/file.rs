//! File-backed device
//!
//! A single backing file served by a dedicated worker thread. Requests are
//! queued on a crossbeam channel and executed in submission order.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::SyncStrategy;
use crate::error::{AtlasError, Result};

use super::{BlockDevice, ReadDone, WriteDone};

enum Request {
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

/// Device backed by one file on the local filesystem
pub struct FileDevice {
    path: PathBuf,
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    size: u64,
}

impl FileDevice {
    /// Open or create the backing file and start the I/O worker
    pub fn open(path: &Path, sync_strategy: SyncStrategy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        let (tx, rx) = channel::unbounded();
        let worker = thread::Builder::new()
            .name("atlaslog-io".to_string())
            .spawn(move || run_worker(file, rx, sync_strategy))?;

        debug!(path = %path.display(), size, "opened file device");

        Ok(Self {
            path: path.to_path_buf(),
            requests: Some(tx),
            worker: Some(worker),
            size,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn submit_read(&mut self, offset: u64, len: usize, done: ReadDone) {
        let Some(requests) = &self.requests else {
            done(Err(AtlasError::DeviceClosed));
            return;
        };
        if let Err(err) = requests.send(Request::Read { offset, len, done }) {
            if let Request::Read { done, .. } = err.into_inner() {
                done(Err(AtlasError::DeviceClosed));
            }
        }
    }

    fn submit_write(&mut self, offset: u64, data: Bytes, done: WriteDone) {
        self.size = self.size.max(offset + data.len() as u64);
        let Some(requests) = &self.requests else {
            done(Err(AtlasError::DeviceClosed));
            return;
        };
        if let Err(err) = requests.send(Request::Write { offset, data, done }) {
            if let Request::Write { done, .. } = err.into_inner() {
                done(Err(AtlasError::DeviceClosed));
            }
        }
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(path = %self.path.display(), "file device worker panicked");
            }
        }
    }
}

fn run_worker(mut file: File, requests: Receiver<Request>, sync_strategy: SyncStrategy) {
    for request in requests.iter() {
        match request {
            Request::Read { offset, len, done } => done(read_at(&mut file, offset, len)),
            Request::Write { offset, data, done } => {
                done(write_at(&mut file, offset, &data, sync_strategy))
            }
        }
    }
}

fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;

    // Anything past end of file reads back as zeroes
    let mut filled = 0;
    while filled < len {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Bytes::from(buf))
}

fn write_at(file: &mut File, offset: u64, data: &[u8], sync_strategy: SyncStrategy) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    if sync_strategy == SyncStrategy::EveryWrite {
        file.sync_data()?;
    }
    Ok(())
}
