//! Tests for the LogSerializer read/write path
//!
//! These tests verify:
//! - Writes complete through callbacks and become readable
//! - Reads of in-flight writes are served from the overlay
//! - Overwrites move extent references
//! - Checkpoints commit in transaction arrival order
//! - Deletion idempotence and not-found reporting
//! - Space exhaustion, oversized payloads and I/O failures

use std::cell::RefCell;
use std::rc::Rc;

use atlaslog::{
    AtlasError, BlockId, BlockWrite, CompletionMode, Config, LogSerializer, MemoryDevice, Result,
    SerializerState, SyncStrategy,
};
use bytes::Bytes;

// =============================================================================
// Helper Functions
// =============================================================================

type Slot<T> = Rc<RefCell<Option<Result<T>>>>;

fn test_config() -> Config {
    Config::builder()
        .block_size(512)
        .extent_size(64 * 1024)
        .sync_strategy(SyncStrategy::Never)
        .build()
}

/// A callback that stores its result in the returned slot
fn capture<T: 'static>() -> (Slot<T>, impl FnOnce(Result<T>) + 'static) {
    let slot: Slot<T> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    (slot, move |result| *sink.borrow_mut() = Some(result))
}

fn take<T>(slot: &Slot<T>) -> Option<Result<T>> {
    slot.borrow_mut().take()
}

/// Complete device requests and apply them until nothing moves
fn settle(device: &MemoryDevice, serializer: &mut LogSerializer) {
    loop {
        let completed = device.complete_all();
        let processed = serializer.poll();
        if completed == 0 && processed == 0 {
            break;
        }
    }
}

fn start_with(device: &MemoryDevice, config: Config) -> LogSerializer {
    let mut serializer = LogSerializer::with_device(config, Box::new(device.clone())).unwrap();
    let (ready, done) = capture();
    assert!(serializer.start(done).unwrap().is_pending());
    settle(device, &mut serializer);
    assert!(matches!(take(&ready), Some(Ok(()))));
    assert_eq!(serializer.state(), SerializerState::Ready);
    serializer
}

fn start(device: &MemoryDevice) -> LogSerializer {
    start_with(device, test_config())
}

fn write(serializer: &mut LogSerializer, device: &MemoryDevice, id: u64, data: &[u8]) -> Result<()> {
    let (result, done) = capture();
    serializer.do_write(vec![BlockWrite::update(BlockId::new(id), data)], done)?;
    settle(device, serializer);
    take(&result).unwrap_or(Err(AtlasError::InvalidState("write never completed")))
}

fn delete(serializer: &mut LogSerializer, device: &MemoryDevice, id: u64) -> Result<()> {
    let (result, done) = capture();
    serializer.do_write(vec![BlockWrite::delete(BlockId::new(id))], done)?;
    settle(device, serializer);
    take(&result).unwrap_or(Err(AtlasError::InvalidState("delete never completed")))
}

fn read(serializer: &mut LogSerializer, device: &MemoryDevice, id: u64) -> Result<Bytes> {
    let (result, done) = capture();
    if let Some(data) = serializer.do_read(BlockId::new(id), done)?.into_complete() {
        return Ok(data);
    }
    settle(device, serializer);
    take(&result).unwrap_or(Err(AtlasError::InvalidState("read never completed")))
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_write_then_read() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);

    write(&mut serializer, &device, 0, b"hello").unwrap();
    write(&mut serializer, &device, 1, b"world").unwrap();

    assert_eq!(&read(&mut serializer, &device, 0).unwrap()[..], b"hello");
    assert_eq!(&read(&mut serializer, &device, 1).unwrap()[..], b"world");
    assert_eq!(serializer.max_block_id(), BlockId::new(2));
}

#[test]
fn test_committed_read_goes_to_disk() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    write(&mut serializer, &device, 3, b"on disk").unwrap();

    let (result, done) = capture();
    assert!(serializer.do_read(BlockId::new(3), done).unwrap().is_pending());
    assert!(take(&result).is_none());

    settle(&device, &mut serializer);
    assert_eq!(&take(&result).unwrap().unwrap()[..], b"on disk");
}

#[test]
fn test_empty_batch_completes_immediately() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);

    let (result, done) = capture();
    let outcome = serializer.do_write(Vec::new(), done).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(serializer.poll(), 0);
    assert!(take(&result).is_none());
}

#[test]
fn test_operations_rejected_before_start() {
    let device = MemoryDevice::new(CompletionMode::Immediate);
    let mut serializer = LogSerializer::with_device(test_config(), Box::new(device)).unwrap();

    let (_, done) = capture();
    assert!(matches!(
        serializer.do_write(vec![BlockWrite::update(BlockId::new(0), b"x")], done),
        Err(AtlasError::InvalidState(_))
    ));
    let (_, done) = capture();
    assert!(matches!(
        serializer.do_read(BlockId::new(0), done),
        Err(AtlasError::InvalidState(_))
    ));
}

#[test]
fn test_invalid_config_rejected() {
    let config = Config::builder().block_size(1000).build();
    let device = MemoryDevice::new(CompletionMode::Immediate);
    assert!(matches!(
        LogSerializer::with_device(config, Box::new(device)),
        Err(AtlasError::Config(_))
    ));
}

// =============================================================================
// Overlay and Reference Tests
// =============================================================================

#[test]
fn test_overwrite_moves_reference_and_survives_crash() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    let a = vec![b'A'; 40_000];
    let b = vec![b'B'; 40_000];

    let (first, done) = capture();
    let outcome = serializer
        .do_write(vec![BlockWrite::update(BlockId::new(7), &a)], done)
        .unwrap();
    assert!(outcome.is_pending());
    settle(&device, &mut serializer);
    assert!(matches!(take(&first), Some(Ok(()))));
    assert!(serializer.block_in_use(BlockId::new(7)));

    let extent_a = serializer.active_extent().unwrap();
    assert_eq!(serializer.extent_refcount(extent_a), 1);

    let (second, done) = capture();
    let outcome = serializer
        .do_write(vec![BlockWrite::update(BlockId::new(7), &b)], done)
        .unwrap();
    assert!(outcome.is_pending());
    let extent_b = serializer.active_extent().unwrap();
    assert_ne!(extent_a, extent_b);

    // Not durable yet: the overlay serves the new version
    let (_, done) = capture();
    let payload = serializer
        .do_read(BlockId::new(7), done)
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(&payload[..], &b[..]);

    settle(&device, &mut serializer);
    assert!(matches!(take(&second), Some(Ok(()))));
    assert_eq!(serializer.extent_refcount(extent_a), 0);
    assert!(!serializer.is_extent_referenced(extent_a));
    assert_eq!(serializer.extent_refcount(extent_b), 1);
    assert_eq!(serializer.lba_extent_refcount(extent_b), 1);

    let survivor = device.crash();
    let mut restarted = start(&survivor);
    assert_eq!(&read(&mut restarted, &survivor, 7).unwrap()[..], &b[..]);
}

#[test]
fn test_overlay_serves_newest_of_several_pending_versions() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);

    for version in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        let (_, done) = capture();
        serializer
            .do_write(vec![BlockWrite::update(BlockId::new(4), version)], done)
            .unwrap();
    }
    let (_, done) = capture();
    let payload = serializer.do_read(BlockId::new(4), done).unwrap().into_complete();
    assert_eq!(payload.as_deref(), Some(&b"three"[..]));

    settle(&device, &mut serializer);
    assert_eq!(&read(&mut serializer, &device, 4).unwrap()[..], b"three");
}

#[test]
fn test_pending_delete_hides_block() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    write(&mut serializer, &device, 2, b"doomed").unwrap();

    let (_, done) = capture();
    serializer
        .do_write(vec![BlockWrite::delete(BlockId::new(2))], done)
        .unwrap();
    assert!(!serializer.block_in_use(BlockId::new(2)));

    let (_, done) = capture();
    assert!(matches!(
        serializer.do_read(BlockId::new(2), done),
        Err(AtlasError::BlockNotFound(_))
    ));
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_checkpoints_commit_in_arrival_order() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    let order = Rc::new(RefCell::new(Vec::new()));

    for id in [1u64, 2] {
        let order = Rc::clone(&order);
        serializer
            .do_write(
                vec![BlockWrite::update(BlockId::new(id), b"payload")],
                move |result| {
                    assert!(result.is_ok());
                    order.borrow_mut().push(id);
                },
            )
            .unwrap();
    }

    // The second transaction's data lands first
    assert!(device.complete_last());
    serializer.poll();
    assert!(order.borrow().is_empty());
    assert_eq!(device.pending_writes(), 1);

    settle(&device, &mut serializer);
    assert_eq!(*order.borrow(), vec![1, 2]);
}

#[test]
fn test_block_callbacks_fire_before_transaction_callback() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    let events = Rc::new(RefCell::new(Vec::new()));

    let writes = (0..3u64)
        .map(|id| {
            let events = Rc::clone(&events);
            BlockWrite::update(BlockId::new(id), b"x")
                .with_callback(move || events.borrow_mut().push(format!("block {}", id)))
        })
        .collect();
    let txn_events = Rc::clone(&events);
    serializer
        .do_write(writes, move |_| txn_events.borrow_mut().push("txn".to_string()))
        .unwrap();

    settle(&device, &mut serializer);
    assert_eq!(
        *events.borrow(),
        vec!["block 0", "block 1", "block 2", "txn"]
    );
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[test]
fn test_delete_is_idempotent() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    write(&mut serializer, &device, 5, b"value").unwrap();

    delete(&mut serializer, &device, 5).unwrap();
    delete(&mut serializer, &device, 5).unwrap();
    delete(&mut serializer, &device, 9).unwrap();

    assert!(!serializer.block_in_use(BlockId::new(5)));
    assert!(!serializer.block_in_use(BlockId::new(9)));
    assert!(matches!(
        read(&mut serializer, &device, 5),
        Err(AtlasError::BlockNotFound(id)) if id == BlockId::new(5)
    ));

    write(&mut serializer, &device, 5, b"again").unwrap();
    assert_eq!(&read(&mut serializer, &device, 5).unwrap()[..], b"again");
}

#[test]
fn test_read_never_written_block() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    assert!(matches!(
        read(&mut serializer, &device, 42),
        Err(AtlasError::BlockNotFound(_))
    ));
    assert!(!serializer.block_in_use(BlockId::new(42)));
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_payload_too_large() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    let payload = vec![0u8; 64 * 1024];

    let (_, done) = capture();
    assert!(matches!(
        serializer.do_write(vec![BlockWrite::update(BlockId::new(0), &payload)], done),
        Err(AtlasError::PayloadTooLarge { .. })
    ));
    assert!(!serializer.block_in_use(BlockId::new(0)));
}

#[test]
fn test_out_of_space() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let config = Config::builder()
        .block_size(512)
        .extent_size(64 * 1024)
        .max_extents(4)
        .sync_strategy(SyncStrategy::Never)
        .build();
    let mut serializer = start_with(&device, config);
    let payload = vec![7u8; 40_000];

    write(&mut serializer, &device, 0, &payload).unwrap();
    write(&mut serializer, &device, 1, &payload).unwrap();
    let err = write(&mut serializer, &device, 2, &payload).unwrap_err();
    assert!(matches!(err, AtlasError::OutOfSpace { needed: 1, available: 0 }));

    // Nothing from the rejected write is visible; earlier data is intact
    assert!(!serializer.block_in_use(BlockId::new(2)));
    assert_eq!(read(&mut serializer, &device, 1).unwrap().len(), 40_000);
}

#[test]
fn test_out_of_space_counts_queued_checkpoints() {
    // Extent 0 holds two metablock slots, one data extent, one LBA extent
    let device = MemoryDevice::new(CompletionMode::Manual);
    let config = Config::builder()
        .block_size(512)
        .extent_size(8192)
        .metablock_slots(2)
        .max_extents(3)
        .sync_strategy(SyncStrategy::Never)
        .build();
    let mut serializer = start_with(&device, config);

    // Each commit appends one 512-byte chunk; 15 of them leave room for one more
    for id in 0..15 {
        write(&mut serializer, &device, id, b"fill").unwrap();
    }

    // The first transaction takes the last chunk while still in flight
    let (first, done) = capture();
    assert!(serializer
        .do_write(vec![BlockWrite::update(BlockId::new(20), b"last")], done)
        .unwrap()
        .is_pending());

    // The second would need a new LBA extent at its checkpoint
    let (second, done) = capture();
    let err = serializer
        .do_write(vec![BlockWrite::delete(BlockId::new(14))], done)
        .unwrap_err();
    assert!(matches!(err, AtlasError::OutOfSpace { needed: 1, available: 0 }));

    settle(&device, &mut serializer);
    assert!(matches!(take(&first), Some(Ok(()))));
    assert!(take(&second).is_none());

    assert_eq!(serializer.state(), SerializerState::Ready);
    assert!(serializer.block_in_use(BlockId::new(14)));
    assert_eq!(&read(&mut serializer, &device, 14).unwrap()[..], b"fill");
    assert_eq!(&read(&mut serializer, &device, 20).unwrap()[..], b"last");
}

#[test]
fn test_block_id_out_of_range() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    write(&mut serializer, &device, 3, b"kept").unwrap();

    for id in [u64::MAX, 1 << 40] {
        let (_, done) = capture();
        let err = serializer
            .do_write(vec![BlockWrite::update(BlockId::new(id), b"x")], done)
            .unwrap_err();
        assert!(matches!(err, AtlasError::BlockIdOutOfRange { .. }));
    }

    // A batch with one bad id is rejected whole
    let (_, done) = capture();
    assert!(serializer
        .do_write(
            vec![
                BlockWrite::update(BlockId::new(4), b"y"),
                BlockWrite::delete(BlockId::new(u64::MAX)),
            ],
            done,
        )
        .is_err());

    assert_eq!(serializer.max_block_id(), BlockId::new(4));
    assert!(!serializer.block_in_use(BlockId::new(4)));
    assert!(!serializer.block_in_use(BlockId::new(u64::MAX)));
    assert!(matches!(
        read(&mut serializer, &device, u64::MAX),
        Err(AtlasError::BlockNotFound(_))
    ));
    assert_eq!(serializer.state(), SerializerState::Ready);
}

#[test]
fn test_data_write_failure_fails_only_its_transaction() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    write(&mut serializer, &device, 1, b"kept").unwrap();

    device.fail_next_writes(1);
    let err = write(&mut serializer, &device, 1, b"lost").unwrap_err();
    assert!(matches!(err, AtlasError::Io(_)));

    assert_eq!(serializer.state(), SerializerState::Ready);
    assert_eq!(&read(&mut serializer, &device, 1).unwrap()[..], b"kept");
    write(&mut serializer, &device, 1, b"retried").unwrap();
    assert_eq!(&read(&mut serializer, &device, 1).unwrap()[..], b"retried");
}

#[test]
fn test_checkpoint_failure_poisons() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);

    let (first, done) = capture();
    serializer
        .do_write(vec![BlockWrite::update(BlockId::new(1), b"a")], done)
        .unwrap();
    let (second, done) = capture();
    serializer
        .do_write(vec![BlockWrite::update(BlockId::new(2), b"b")], done)
        .unwrap();

    // Both data writes succeed, then the LBA write fails
    assert!(device.complete_next());
    assert!(device.complete_next());
    serializer.poll();
    device.fail_next_writes(1);
    settle(&device, &mut serializer);

    assert!(matches!(take(&first), Some(Err(AtlasError::Io(_)))));
    assert!(matches!(take(&second), Some(Err(AtlasError::Poisoned))));
    assert_eq!(serializer.state(), SerializerState::Failed);

    let (_, done) = capture();
    assert!(matches!(
        serializer.do_write(vec![BlockWrite::update(BlockId::new(3), b"c")], done),
        Err(AtlasError::Poisoned)
    ));
    let (_, done) = capture();
    assert!(matches!(serializer.shutdown(done), Err(AtlasError::Poisoned)));
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[test]
fn test_idle_shutdown_completes_in_one_shot() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    write(&mut serializer, &device, 0, b"x").unwrap();

    let (result, done) = capture();
    assert!(serializer.shutdown(done).unwrap().is_complete());
    assert_eq!(serializer.state(), SerializerState::ShutDown);
    assert_eq!(serializer.poll(), 0);
    assert!(take(&result).is_none());

    // Shutting down twice is harmless
    let (_, done) = capture();
    assert!(serializer.shutdown(done).unwrap().is_complete());
}

#[test]
fn test_shutdown_waits_for_in_flight_work() {
    let device = MemoryDevice::new(CompletionMode::Manual);
    let mut serializer = start(&device);
    write(&mut serializer, &device, 0, b"committed").unwrap();

    let (written, done) = capture();
    serializer
        .do_write(vec![BlockWrite::update(BlockId::new(1), b"pending")], done)
        .unwrap();
    let (read_result, done) = capture();
    assert!(serializer.do_read(BlockId::new(0), done).unwrap().is_pending());

    let (stopped, done) = capture();
    assert!(serializer.shutdown(done).unwrap().is_pending());
    assert_eq!(serializer.state(), SerializerState::ShuttingDown);

    let (_, done) = capture();
    assert!(matches!(
        serializer.do_write(vec![BlockWrite::update(BlockId::new(2), b"late")], done),
        Err(AtlasError::InvalidState(_))
    ));

    settle(&device, &mut serializer);
    assert!(matches!(take(&written), Some(Ok(()))));
    assert_eq!(&take(&read_result).unwrap().unwrap()[..], b"committed");
    assert!(matches!(take(&stopped), Some(Ok(()))));
    assert_eq!(serializer.state(), SerializerState::ShutDown);

    let survivor = device.crash();
    let mut restarted = start(&survivor);
    assert_eq!(&read(&mut restarted, &survivor, 1).unwrap()[..], b"pending");
}
