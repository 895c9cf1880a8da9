//! Shared segment header: layout constants, commit index, metrics block and
//! consumer heartbeat table

use crate::liveness::ProcessLiveness;
use crate::platform::now_ns;
use crate::segment::DataBlockLayout;
use datablock_common::consts::{
    DATABLOCK_MAGIC, DATABLOCK_VERSION_MAJOR, DATABLOCK_VERSION_MINOR, HEADER_FLAG_CHECKSUMS,
    MAX_CONSUMER_HEARTBEATS,
};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::warn;

/// One entry of the consumer heartbeat table.
#[repr(C)]
pub struct ConsumerHeartbeat {
    /// PID of the registered consumer, 0 when the entry is free
    pub consumer_pid: AtomicU64,
    /// Wall-clock time of the consumer's last heartbeat
    pub last_seen_ns: AtomicU64,
}

impl ConsumerHeartbeat {
    const fn new() -> Self {
        Self {
            consumer_pid: AtomicU64::new(0),
            last_seen_ns: AtomicU64::new(0),
        }
    }
}

/// Aggregate protocol counters.
///
/// Every field is independently atomic. Readers get a per-field consistent
/// value, never a point-in-time snapshot across fields.
#[repr(C, align(64))]
pub struct MetricsBlock {
    /// Writer acquisitions that timed out, for any reason
    pub writer_timeout_count: AtomicU64,
    /// Writer timeouts spent waiting for another writer's lock
    pub writer_lock_timeout_count: AtomicU64,
    /// Writer timeouts spent waiting for readers to drain
    pub writer_reader_timeout_count: AtomicU64,
    /// Total time writers spent polling, in nanoseconds
    pub writer_blocked_total_ns: AtomicU64,
    /// Write acquisitions that found the lock taken
    pub write_lock_contention: AtomicU64,
    /// Write acquisitions that had to drain readers
    pub writer_drain_count: AtomicU64,
    /// Read acquisitions on a slot that was not committed
    pub reader_not_ready_count: AtomicU64,
    /// Read acquisitions that lost a race with a writer and backed out
    pub reader_race_detected: AtomicU64,
    /// Read validations that found a newer generation
    pub reader_validation_failed: AtomicU64,
    /// Read acquisitions that timed out
    pub reader_timeout_count: AtomicU64,
    /// Highest reader count observed on any slot
    pub reader_peak_count: AtomicU64,
    /// Acquisitions that failed with an error or invalid state
    pub slot_acquire_errors: AtomicU64,
    /// Commits rejected because the caller did not hold the slot
    pub slot_commit_errors: AtomicU64,
    /// Releases rejected because the caller did not hold the slot
    pub slot_release_errors: AtomicU64,
    /// Checksum mismatches found by integrity validation
    pub checksum_failures: AtomicU64,
    /// Write locks reclaimed from dead processes
    pub zombie_writers_released: AtomicU64,
    /// Reader counts reclaimed by recovery
    pub zombie_readers_released: AtomicU64,
    /// Heartbeat entries removed for dead consumers
    pub dead_consumers_removed: AtomicU64,
    /// State-mutating recovery actions performed
    pub recovery_actions_count: AtomicU64,
    /// Wall-clock time of the last recorded error or recovery action
    pub last_error_timestamp_ns: AtomicU64,
    /// Code of the last recorded error
    pub last_error_code: AtomicU64,
    /// Number of errors recorded
    pub error_sequence: AtomicU64,
    /// Successful commits
    pub total_slots_written: AtomicU64,
    /// Successful read validations
    pub total_slots_read: AtomicU64,
    /// Payload bytes reported by producers
    pub total_bytes_written: AtomicU64,
    /// Payload bytes reported by consumers
    pub total_bytes_read: AtomicU64,
}

/// Number of counters in [`MetricsBlock`].
pub const METRICS_COUNTER_COUNT: usize = 26;

const_assert_eq!(
    core::mem::size_of::<MetricsBlock>(),
    (METRICS_COUNTER_COUNT * 8).div_ceil(64) * 64
);

impl MetricsBlock {
    const fn new() -> Self {
        Self {
            writer_timeout_count: AtomicU64::new(0),
            writer_lock_timeout_count: AtomicU64::new(0),
            writer_reader_timeout_count: AtomicU64::new(0),
            writer_blocked_total_ns: AtomicU64::new(0),
            write_lock_contention: AtomicU64::new(0),
            writer_drain_count: AtomicU64::new(0),
            reader_not_ready_count: AtomicU64::new(0),
            reader_race_detected: AtomicU64::new(0),
            reader_validation_failed: AtomicU64::new(0),
            reader_timeout_count: AtomicU64::new(0),
            reader_peak_count: AtomicU64::new(0),
            slot_acquire_errors: AtomicU64::new(0),
            slot_commit_errors: AtomicU64::new(0),
            slot_release_errors: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            zombie_writers_released: AtomicU64::new(0),
            zombie_readers_released: AtomicU64::new(0),
            dead_consumers_removed: AtomicU64::new(0),
            recovery_actions_count: AtomicU64::new(0),
            last_error_timestamp_ns: AtomicU64::new(0),
            last_error_code: AtomicU64::new(0),
            error_sequence: AtomicU64::new(0),
            total_slots_written: AtomicU64::new(0),
            total_slots_read: AtomicU64::new(0),
            total_bytes_written: AtomicU64::new(0),
            total_bytes_read: AtomicU64::new(0),
        }
    }

    /// Every counter, in declaration order.
    pub fn counters(&self) -> [&AtomicU64; METRICS_COUNTER_COUNT] {
        [
            &self.writer_timeout_count,
            &self.writer_lock_timeout_count,
            &self.writer_reader_timeout_count,
            &self.writer_blocked_total_ns,
            &self.write_lock_contention,
            &self.writer_drain_count,
            &self.reader_not_ready_count,
            &self.reader_race_detected,
            &self.reader_validation_failed,
            &self.reader_timeout_count,
            &self.reader_peak_count,
            &self.slot_acquire_errors,
            &self.slot_commit_errors,
            &self.slot_release_errors,
            &self.checksum_failures,
            &self.zombie_writers_released,
            &self.zombie_readers_released,
            &self.dead_consumers_removed,
            &self.recovery_actions_count,
            &self.last_error_timestamp_ns,
            &self.last_error_code,
            &self.error_sequence,
            &self.total_slots_written,
            &self.total_slots_read,
            &self.total_bytes_written,
            &self.total_bytes_read,
        ]
    }

    /// Increment a counter by one.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Header at offset 0 of every DataBlock segment.
///
/// Plain fields are written once by the creator before the segment is
/// published and never change afterwards. Everything else is atomic.
#[repr(C, align(64))]
pub struct SharedMemoryHeader {
    /// Must equal [`DATABLOCK_MAGIC`]
    pub magic_number: u64,
    /// Layout major version
    pub version_major: u16,
    /// Layout minor version
    pub version_minor: u16,
    /// Feature flags (`HEADER_FLAG_*`)
    pub flags: u32,
    /// Number of slots in the ring
    pub ring_buffer_capacity: u32,
    /// Page size the segment was rounded to
    pub physical_page_size: u32,
    /// Payload bytes per slot
    pub logical_unit_size: u32,
    /// Size of the auxiliary flexible zone
    pub flexible_zone_size: u32,
    /// CRC-32 of the immutable layout parameters
    pub layout_checksum: u32,
    _reserved0: u32,
    /// Wall-clock creation time
    pub created_at_ns: u64,
    /// Successful commits across all slots
    pub commit_index: AtomicU64,
    /// CRC-32 of the flexible zone
    pub flexible_zone_checksum: AtomicU32,
    /// Non-zero once `flexible_zone_checksum` has been stamped
    pub flexible_zone_checksum_valid: AtomicU32,
    /// Registered consumers in the heartbeat table
    pub active_consumer_count: AtomicU32,
    _reserved1: [u8; 60],
    /// Fixed-size consumer heartbeat table
    pub consumer_heartbeats: [ConsumerHeartbeat; MAX_CONSUMER_HEARTBEATS],
    /// Aggregate protocol counters
    pub metrics: MetricsBlock,
}

const_assert_eq!(core::mem::align_of::<SharedMemoryHeader>(), 64);
const_assert_eq!(core::mem::size_of::<SharedMemoryHeader>() % 64, 0);

impl SharedMemoryHeader {
    /// Build a fresh header for `layout`.
    pub fn new(layout: &DataBlockLayout) -> Self {
        Self {
            magic_number: DATABLOCK_MAGIC,
            version_major: DATABLOCK_VERSION_MAJOR,
            version_minor: DATABLOCK_VERSION_MINOR,
            flags: layout.flags(),
            ring_buffer_capacity: layout.capacity(),
            physical_page_size: layout.page_size(),
            logical_unit_size: layout.logical_unit_size(),
            flexible_zone_size: layout.zone_size(),
            layout_checksum: layout.checksum(),
            _reserved0: 0,
            created_at_ns: now_ns(),
            commit_index: AtomicU64::new(0),
            flexible_zone_checksum: AtomicU32::new(0),
            flexible_zone_checksum_valid: AtomicU32::new(0),
            active_consumer_count: AtomicU32::new(0),
            _reserved1: [0; 60],
            consumer_heartbeats: [const { ConsumerHeartbeat::new() }; MAX_CONSUMER_HEARTBEATS],
            metrics: MetricsBlock::new(),
        }
    }

    /// Layout parameters as recorded in this header.
    pub fn layout(&self) -> DataBlockLayout {
        DataBlockLayout::new(self.ring_buffer_capacity, self.logical_unit_size)
            .physical_page_size(self.physical_page_size)
            .flexible_zone_size(self.flexible_zone_size)
            .checksums(self.flags & HEADER_FLAG_CHECKSUMS != 0)
    }

    /// Whether producers maintain payload checksums.
    pub fn checksums_enabled(&self) -> bool {
        self.flags & HEADER_FLAG_CHECKSUMS != 0
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.ring_buffer_capacity as usize
    }

    /// Stamp an error into the metrics block.
    pub fn record_error(&self, code: u64) {
        self.metrics
            .last_error_timestamp_ns
            .store(now_ns(), Ordering::Relaxed);
        self.metrics.last_error_code.store(code, Ordering::Relaxed);
        MetricsBlock::bump(&self.metrics.error_sequence);
    }

    /// Account a state-mutating recovery action.
    pub fn record_recovery_action(&self) {
        MetricsBlock::bump(&self.metrics.recovery_actions_count);
        self.metrics
            .last_error_timestamp_ns
            .store(now_ns(), Ordering::Relaxed);
    }

    /// Register `pid` in the heartbeat table.
    ///
    /// Idempotent for an already registered PID. Returns the entry index, or
    /// `None` when the table is full.
    pub fn register_consumer(&self, pid: u64, now_ns: u64) -> Option<usize> {
        if pid == 0 {
            return None;
        }
        if let Some(index) = self.find_consumer(pid) {
            self.consumer_heartbeats[index]
                .last_seen_ns
                .store(now_ns, Ordering::Release);
            return Some(index);
        }
        for (index, entry) in self.consumer_heartbeats.iter().enumerate() {
            if entry
                .consumer_pid
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                entry.last_seen_ns.store(now_ns, Ordering::Release);
                self.active_consumer_count.fetch_add(1, Ordering::AcqRel);
                // A concurrent registration of the same PID may hold an earlier entry
                if let Some(first) = self.find_consumer(pid).filter(|&first| first < index) {
                    self.release_consumer_entry(index, pid);
                    self.consumer_heartbeats[first]
                        .last_seen_ns
                        .store(now_ns, Ordering::Release);
                    return Some(first);
                }
                return Some(index);
            }
        }
        None
    }

    /// Refresh the heartbeat of `pid`. Returns false if it is not registered.
    pub fn update_heartbeat(&self, pid: u64, now_ns: u64) -> bool {
        match self.find_consumer(pid) {
            Some(index) => {
                self.consumer_heartbeats[index]
                    .last_seen_ns
                    .store(now_ns, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Remove `pid` from the heartbeat table.
    pub fn unregister_consumer(&self, pid: u64) -> bool {
        match self.find_consumer(pid) {
            Some(index) => self.release_consumer_entry(index, pid),
            None => false,
        }
    }

    /// Free entry `index` if it still belongs to `pid`.
    ///
    /// The CAS makes concurrent sweeps count each removal exactly once.
    pub fn release_consumer_entry(&self, index: usize, pid: u64) -> bool {
        let Some(entry) = self.consumer_heartbeats.get(index) else {
            return false;
        };
        if pid == 0
            || entry
                .consumer_pid
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        entry.last_seen_ns.store(0, Ordering::Release);
        let _ = self.active_consumer_count.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        );
        true
    }

    /// Remove every registered consumer the oracle reports dead.
    ///
    /// Returns the number of entries this call removed. Concurrent sweeps
    /// never remove the same entry twice.
    pub fn sweep_dead_consumers<L: ProcessLiveness + ?Sized>(&self, oracle: &L) -> usize {
        let mut removed = 0;
        for (index, entry) in self.consumer_heartbeats.iter().enumerate() {
            let pid = entry.consumer_pid.load(Ordering::Acquire);
            if pid == 0 || oracle.is_alive(pid) {
                continue;
            }
            let last_seen_ns = entry.last_seen_ns.load(Ordering::Acquire);
            if self.release_consumer_entry(index, pid) {
                warn!(entry = index, consumer_pid = pid, last_seen_ns, "removed dead consumer");
                removed += 1;
            }
        }
        removed
    }

    fn find_consumer(&self, pid: u64) -> Option<usize> {
        if pid == 0 {
            return None;
        }
        self.consumer_heartbeats
            .iter()
            .position(|entry| entry.consumer_pid.load(Ordering::Acquire) == pid)
    }
}

impl std::fmt::Debug for SharedMemoryHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryHeader")
            .field("version", &(self.version_major, self.version_minor))
            .field("ring_buffer_capacity", &self.ring_buffer_capacity)
            .field("logical_unit_size", &self.logical_unit_size)
            .field("commit_index", &self.commit_index.load(Ordering::Relaxed))
            .field(
                "active_consumer_count",
                &self.active_consumer_count.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}
