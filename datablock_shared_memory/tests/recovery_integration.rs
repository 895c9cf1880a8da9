//! Recovery against real, exited processes
//!
//! A short-lived child is spawned and reaped so its PID is genuinely dead,
//! then slot and heartbeat state is stamped with that PID the way a crashed
//! participant would have left it.

use datablock_shared_memory::{
    DataBlockConsumer, DataBlockLayout, DataBlockProducer, DataBlockRecovery, RecoveryResult,
    SlotError, SlotRWCoordinator, SlotState, get_metrics,
};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::process::Command;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn dead_pid() -> u64 {
    let mut child = Command::new("true").spawn().expect("spawn child");
    let pid = u64::from(child.id());
    child.wait().expect("reap child");
    pid
}

fn setup(name: &str) -> (TempDir, DataBlockProducer) {
    let dir = TempDir::new().unwrap();
    let layout = DataBlockLayout::new(4, 32).flexible_zone_size(64).checksums(true);
    let producer = DataBlockProducer::create_in(dir.path(), name, layout).unwrap();
    (dir, producer)
}

#[test]
fn test_dead_writer_is_released() {
    let (dir, producer) = setup("recovery_dead_writer");
    let pid = dead_pid();

    let crashed = producer.coordinator(1).unwrap().with_pid(pid);
    crashed.acquire_write(0).unwrap();

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_dead_writer").unwrap();
    let diag = recovery.diagnose_slot(1).unwrap();
    assert!(diag.is_stuck);
    assert_eq!(diag.write_lock, pid);
    assert_eq!(diag.state(), Some(SlotState::Writing));

    let stuck: Vec<_> = recovery
        .diagnose_all_slots()
        .into_iter()
        .filter(|d| d.is_stuck)
        .map(|d| d.slot_index)
        .collect();
    assert_eq!(stuck, vec![1]);

    assert_eq!(recovery.release_zombie_writer(1), RecoveryResult::Success);
    assert_eq!(recovery.release_zombie_writer(1), RecoveryResult::NotStuck);

    let state = producer.segment().slot_state(1).unwrap();
    assert_eq!(state.writer_pid(), 0);
    assert_eq!(state.state(), Some(SlotState::Free));

    // The slot is usable again
    assert_eq!(producer.write_slot(1, b"after", 100).unwrap(), 1);
    let metrics = get_metrics(producer.segment().header());
    assert_eq!(metrics.zombie_writers_released, 1);
    assert!(metrics.recovery_actions_count >= 1);
}

#[test]
fn test_dead_writer_after_commit_frees_slot() {
    let (dir, producer) = setup("recovery_committed_writer");
    let pid = dead_pid();

    let crashed = producer.coordinator(0).unwrap().with_pid(pid);
    crashed.acquire_write(0).unwrap();
    let generation = crashed.commit().unwrap();

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_committed_writer").unwrap();
    assert_eq!(recovery.release_zombie_writer(0), RecoveryResult::Success);

    let state = producer.segment().slot_state(0).unwrap();
    assert_eq!(state.state(), Some(SlotState::Free));
    assert_eq!(state.writer_pid(), 0);
    assert_eq!(state.generation(), generation);

    let reader = SlotRWCoordinator::new(state);
    assert_eq!(reader.acquire_read(0), Err(SlotError::NotReady));
    assert_eq!(producer.write_slot(0, b"next", 100).unwrap(), generation + 1);
}

#[test]
fn test_integrity_after_crashed_overwrite() {
    let (dir, producer) = setup("recovery_crashed_overwrite");
    producer.write_slot(0, b"committed", 100).unwrap();

    // A writer dies halfway through replacing the payload
    let crashed = producer.coordinator(0).unwrap().with_pid(dead_pid());
    crashed.acquire_write(0).unwrap();
    let payload = producer.segment().payload_ptr(0).unwrap();
    unsafe { std::ptr::write_bytes(payload.as_ptr(), 0x5A, 8) };

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_crashed_overwrite").unwrap();
    assert_eq!(recovery.release_zombie_writer(0), RecoveryResult::Success);
    let state = producer.segment().slot_state(0).unwrap();
    assert_eq!(state.state(), Some(SlotState::Free));
    assert_eq!(state.generation(), 1);

    // The half-written payload is unpublished, so it is not a checksum failure
    assert_eq!(recovery.validate_integrity(false), RecoveryResult::Success);
    assert_eq!(recovery.validate_integrity(true), RecoveryResult::Success);
    assert_eq!(get_metrics(producer.segment().header()).checksum_failures, 0);

    producer.write_slot(0, b"rewritten", 100).unwrap();
    assert_eq!(recovery.validate_integrity(false), RecoveryResult::Success);
}

#[test]
fn test_forced_reset_while_writer_drains() {
    let (dir, producer) = setup("recovery_reset_drain");
    producer.write_slot(0, b"first", 100).unwrap();
    let state = producer.segment().slot_state(0).unwrap();
    let reader = SlotRWCoordinator::new(state);
    reader.acquire_read(0).unwrap();

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_reset_drain").unwrap();
    // Distinct token so the recovery claim is visible to the writer
    let writer_pid = u64::from(u32::MAX) + 11;

    thread::scope(|s| {
        let writer = s.spawn(|| {
            SlotRWCoordinator::new(state)
                .with_pid(writer_pid)
                .acquire_write(3_000)
        });

        let started = Instant::now();
        while state.state() != Some(SlotState::Draining) {
            assert!(started.elapsed() < Duration::from_secs(2), "writer never drained");
            thread::yield_now();
        }
        assert_eq!(recovery.force_reset_slot(0, true), RecoveryResult::Success);
        assert_eq!(writer.join().unwrap(), Err(SlotError::Error));
    });

    assert_eq!(state.state(), Some(SlotState::Free));
    assert_eq!(state.writer_pid(), 0);
    assert_eq!(state.readers(), 0);
    assert!(!state.is_writer_waiting());

    // Nothing is wedged
    assert_eq!(producer.write_slot(0, b"second", 0).unwrap(), 2);
    let (generation, bytes) = DataBlockConsumer::attach_in(dir.path(), "recovery_reset_drain")
        .unwrap()
        .read_slot(0, 0)
        .unwrap();
    assert_eq!(generation, 2);
    assert_eq!(&bytes[..6], b"second");
}

#[test]
fn test_live_writer_is_protected() {
    let (dir, producer) = setup("recovery_live_writer");
    let writer = producer.coordinator(2).unwrap();
    writer.acquire_write(0).unwrap();

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_live_writer").unwrap();
    assert!(!recovery.diagnose_slot(2).unwrap().is_stuck);
    assert_eq!(recovery.release_zombie_writer(2), RecoveryResult::Unsafe);
    assert_eq!(recovery.force_reset_slot(2, false), RecoveryResult::Unsafe);
    assert_eq!(recovery.release_zombie_writer(9), RecoveryResult::InvalidSlot);

    writer.release_write().unwrap();
    assert_eq!(recovery.release_zombie_writer(2), RecoveryResult::NotStuck);
}

#[test]
fn test_zombie_readers_released() {
    let (dir, producer) = setup("recovery_zombie_readers");
    producer.write_slot(3, b"data", 100).unwrap();

    // Two readers that will never leave
    let state = producer.segment().slot_state(3).unwrap();
    let reader = SlotRWCoordinator::new(state);
    reader.acquire_read(0).unwrap();
    reader.acquire_read(0).unwrap();

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_zombie_readers").unwrap();
    // No writer is involved, so no force is needed
    assert_eq!(recovery.release_zombie_readers(3, false), RecoveryResult::Success);
    assert_eq!(state.readers(), 0);
    assert_eq!(state.state(), Some(SlotState::Committed));
    assert_eq!(state.writer_pid(), 0);
    assert_eq!(recovery.release_zombie_readers(3, false), RecoveryResult::NotStuck);

    assert_eq!(producer.write_slot(3, b"next", 0).unwrap(), 2);
}

#[test]
fn test_dead_consumers_swept() {
    let (dir, producer) = setup("recovery_dead_consumers");
    let consumer = DataBlockConsumer::attach_in(dir.path(), "recovery_dead_consumers").unwrap();
    let header = producer.segment().header();
    header.register_consumer(dead_pid(), 1).unwrap();
    assert_eq!(header.active_consumer_count.load(Ordering::Relaxed), 2);

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_dead_consumers").unwrap();
    assert_eq!(recovery.cleanup_dead_consumers(), RecoveryResult::Success);
    assert_eq!(header.active_consumer_count.load(Ordering::Relaxed), 1);
    assert_eq!(recovery.cleanup_dead_consumers(), RecoveryResult::NotStuck);

    consumer.heartbeat().unwrap();
    assert_eq!(get_metrics(header).dead_consumers_removed, 1);
}

#[test]
fn test_integrity_repair() {
    let (dir, producer) = setup("recovery_integrity");
    producer.write_slot(0, b"good", 100).unwrap();
    producer.write_flexible_zone(b"zone").unwrap();

    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_integrity").unwrap();
    assert_eq!(recovery.validate_integrity(false), RecoveryResult::Success);

    // Flip a payload byte behind the protocol's back
    let payload = producer.segment().payload_ptr(0).unwrap();
    unsafe { *payload.as_ptr() ^= 0xFF };

    assert_eq!(recovery.validate_integrity(false), RecoveryResult::Failed);
    assert_eq!(recovery.validate_integrity(true), RecoveryResult::Success);
    assert_eq!(recovery.validate_integrity(false), RecoveryResult::Success);

    let consumer = DataBlockConsumer::attach_in(dir.path(), "recovery_integrity").unwrap();
    consumer.verify_checksum_slot(0).unwrap();
    assert!(get_metrics(producer.segment().header()).checksum_failures >= 2);
}

#[test]
fn test_corrupted_header_detected() {
    let (dir, producer) = setup("recovery_bad_magic");
    let recovery = DataBlockRecovery::open_in(dir.path(), "recovery_bad_magic").unwrap();

    // Magic is the first field of the backing file
    let file = OpenOptions::new()
        .write(true)
        .open(producer.segment().path())
        .unwrap();
    file.write_all_at(&[0u8; 8], 0).unwrap();

    assert_eq!(recovery.validate_integrity(true), RecoveryResult::Failed);
    assert!(DataBlockConsumer::attach_in(dir.path(), "recovery_bad_magic").is_err());
}
