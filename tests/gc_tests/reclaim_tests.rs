//! Tests for garbage collection and space reclamation
//!
//! These tests verify:
//! - Sparse extents are relocated and returned to the free list
//! - Freed extents are reused by later allocations
//! - Dense stores never trigger a GC pass
//! - Caller writes racing a GC pass keep the newest version
//! - Extents retired while a read is in flight stay allocated until it ends
//! - Shutdown waits for a running GC pass

use std::cell::RefCell;
use std::rc::Rc;

use atlaslog::data_block::GcState;
use atlaslog::{
    BlockId, BlockWrite, CompletionMode, Config, LogSerializer, MemoryDevice, Result,
    SerializerState, SyncStrategy,
};
use bytes::Bytes;

// =============================================================================
// Helper Functions
// =============================================================================

type Slot<T> = Rc<RefCell<Option<Result<T>>>>;

const EXTENT: u64 = 64 * 1024;

/// Payload size whose record fills exactly 4 KB, so 16 fit in an extent
const PAYLOAD: usize = 4000;

fn test_config() -> Config {
    Config::builder()
        .block_size(512)
        .extent_size(EXTENT)
        .gc_density_threshold(0.5)
        .sync_strategy(SyncStrategy::Never)
        .build()
}

fn capture<T: 'static>() -> (Slot<T>, impl FnOnce(Result<T>) + 'static) {
    let slot: Slot<T> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    (slot, move |result| *sink.borrow_mut() = Some(result))
}

fn take<T>(slot: &Slot<T>) -> Option<Result<T>> {
    slot.borrow_mut().take()
}

fn settle(device: &MemoryDevice, serializer: &mut LogSerializer) {
    loop {
        let completed = device.complete_all();
        let processed = serializer.poll();
        if completed == 0 && processed == 0 {
            break;
        }
    }
}

/// Complete requests one at a time until `done` holds
fn step_until(
    device: &MemoryDevice,
    serializer: &mut LogSerializer,
    done: impl Fn(&LogSerializer) -> bool,
) {
    while !done(serializer) {
        let completed = device.complete_next();
        let processed = serializer.poll();
        assert!(completed || processed > 0, "serializer stalled");
    }
}

fn start(device: &MemoryDevice) -> LogSerializer {
    let mut serializer = LogSerializer::with_device(test_config(), Box::new(device.clone())).unwrap();
    let (ready, done) = capture();
    serializer.start(done).unwrap();
    settle(device, &mut serializer);
    take(&ready).unwrap().unwrap();
    serializer
}

fn payload(id: u64, tag: u8) -> Vec<u8> {
    let mut data = vec![tag; PAYLOAD];
    data[..8].copy_from_slice(&id.to_le_bytes());
    data
}

fn submit(serializer: &mut LogSerializer, writes: Vec<BlockWrite<'_>>) -> Slot<()> {
    let (result, done) = capture();
    serializer.do_write(writes, done).unwrap();
    result
}

fn write_all(serializer: &mut LogSerializer, device: &MemoryDevice, writes: Vec<BlockWrite<'_>>) {
    let result = submit(serializer, writes);
    settle(device, serializer);
    take(&result).unwrap().unwrap();
}

fn read(serializer: &mut LogSerializer, device: &MemoryDevice, id: u64) -> Bytes {
    let (result, done) = capture();
    if let Some(data) = serializer.do_read(BlockId::new(id), done).unwrap().into_complete() {
        return data;
    }
    settle(device, serializer);
    take(&result).unwrap().unwrap()
}

/// Blocks 0..40 fill the first two data extents and half of a third
fn populate(serializer: &mut LogSerializer, device: &MemoryDevice) {
    let payloads: Vec<Vec<u8>> = (0..40).map(|id| payload(id, b'p')).collect();
    let writes = payloads
        .iter()
        .enumerate()
        .map(|(id, data)| BlockWrite::update(BlockId::new(id as u64), data))
        .collect();
    write_all(serializer, device, writes);
}

/// Leaves block 15 alone in the first extent and 29..32 in the second
fn sparse_deletes() -> Vec<BlockWrite<'static>> {
    (0..15)
        .chain(16..29)
        .map(|id| BlockWrite::delete(BlockId::new(id)))
        .collect()
}

// =============================================================================
// Reclamation Tests
// =============================================================================

#[test]
fn test_gc_reclaims_sparse_extents() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    populate(&mut serializer, &device);
    assert_eq!(serializer.extent_refcount(EXTENT), 16);
    assert_eq!(serializer.gc_runs(), 0);

    write_all(&mut serializer, &device, sparse_deletes());

    assert_eq!(serializer.gc_runs(), 2);
    assert_eq!(serializer.gc_state(), GcState::Idle);
    assert!(!serializer.is_extent_referenced(EXTENT));
    assert!(!serializer.is_extent_referenced(2 * EXTENT));
    assert_eq!(serializer.free_extent_count(), 2);

    for id in [15u64, 29, 30, 31].into_iter().chain(32..40) {
        assert_eq!(read(&mut serializer, &device, id), payload(id, b'p'));
    }
    for id in 0..15u64 {
        assert!(!serializer.block_in_use(BlockId::new(id)));
    }

    // New allocations reuse the lowest freed extent
    let fresh: Vec<Vec<u8>> = (40..56).map(|id| payload(id, b'n')).collect();
    let writes = fresh
        .iter()
        .zip(40u64..)
        .map(|(data, id)| BlockWrite::update(BlockId::new(id), data))
        .collect();
    write_all(&mut serializer, &device, writes);
    assert_eq!(serializer.active_extent(), Some(EXTENT));

    let survivor = device.crash();
    let mut restarted = start(&survivor);
    for id in [15u64, 29, 30, 31].into_iter().chain(32..40) {
        assert_eq!(read(&mut restarted, &survivor, id), payload(id, b'p'));
    }
    for id in 40..56u64 {
        assert_eq!(read(&mut restarted, &survivor, id), payload(id, b'n'));
    }
}

#[test]
fn test_dense_store_never_collects() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    populate(&mut serializer, &device);

    // One delete per extent keeps density well above the threshold
    let deletes = vec![
        BlockWrite::delete(BlockId::new(0)),
        BlockWrite::delete(BlockId::new(16)),
    ];
    write_all(&mut serializer, &device, deletes);

    assert_eq!(serializer.gc_runs(), 0);
    assert_eq!(serializer.gc_state(), GcState::Idle);
    assert_eq!(serializer.extent_refcount(EXTENT), 15);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_write_during_gc_relocation_keeps_newest() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    populate(&mut serializer, &device);

    let deleted = submit(&mut serializer, sparse_deletes());
    step_until(&device, &mut serializer, |s| {
        matches!(s.gc_state(), GcState::Relocating { .. })
    });
    assert!(matches!(take(&deleted), Some(Ok(()))));

    let rewritten = submit(
        &mut serializer,
        vec![BlockWrite::update(BlockId::new(15), b"fresh")],
    );
    settle(&device, &mut serializer);
    assert!(matches!(take(&rewritten), Some(Ok(()))));

    assert_eq!(&read(&mut serializer, &device, 15)[..], b"fresh");
    assert!(!serializer.is_extent_referenced(EXTENT));

    let survivor = device.crash();
    let mut restarted = start(&survivor);
    assert_eq!(&read(&mut restarted, &survivor, 15)[..], b"fresh");
    assert_eq!(read(&mut restarted, &survivor, 29), payload(29, b'p'));
}

#[test]
fn test_write_during_gc_read_skips_block() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    populate(&mut serializer, &device);

    let deleted = submit(&mut serializer, sparse_deletes());
    step_until(&device, &mut serializer, |s| {
        matches!(s.gc_state(), GcState::Reading { extent } if extent == EXTENT)
    });
    assert!(matches!(take(&deleted), Some(Ok(()))));

    // Block 15 gets a newer version before the GC read returns
    let rewritten = submit(
        &mut serializer,
        vec![BlockWrite::update(BlockId::new(15), b"fresh")],
    );
    settle(&device, &mut serializer);
    assert!(matches!(take(&rewritten), Some(Ok(()))));

    assert_eq!(&read(&mut serializer, &device, 15)[..], b"fresh");
    assert!(!serializer.is_extent_referenced(EXTENT));
    assert_eq!(read(&mut serializer, &device, 30), payload(30, b'p'));
}

#[test]
fn test_pinned_extent_outlives_retirement() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    let old = vec![b'A'; 40_000];
    let new = vec![b'B'; 40_000];

    write_all(
        &mut serializer,
        &device,
        vec![BlockWrite::update(BlockId::new(1), &old)],
    );
    let old_extent = serializer.active_extent().unwrap();

    let (read_result, done) = capture();
    assert!(serializer.do_read(BlockId::new(1), done).unwrap().is_pending());

    // Commit the overwrite while the read stays queued
    let written = submit(
        &mut serializer,
        vec![BlockWrite::update(BlockId::new(1), &new)],
    );
    while device.pending_ops() > 1 {
        device.complete_last();
        serializer.poll();
    }
    assert!(matches!(take(&written), Some(Ok(()))));
    assert!(!serializer.is_extent_referenced(old_extent));
    assert_eq!(serializer.free_extent_count(), 0);

    assert!(device.complete_next());
    serializer.poll();
    assert_eq!(&take(&read_result).unwrap().unwrap()[..], &old[..]);
    assert_eq!(serializer.free_extent_count(), 1);
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[test]
fn test_shutdown_during_gc() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    populate(&mut serializer, &device);

    submit(&mut serializer, sparse_deletes());
    step_until(&device, &mut serializer, |s| {
        matches!(s.gc_state(), GcState::Reading { .. })
    });

    let (stopped, done) = capture();
    assert!(serializer.shutdown(done).unwrap().is_pending());
    settle(&device, &mut serializer);

    assert!(matches!(take(&stopped), Some(Ok(()))));
    assert_eq!(serializer.state(), SerializerState::ShutDown);
    assert_eq!(serializer.gc_state(), GcState::Idle);
    assert_eq!(serializer.gc_runs(), 0);

    let survivor = device.crash();
    let mut restarted = start(&survivor);
    assert_eq!(read(&mut restarted, &survivor, 15), payload(15, b'p'));
}
