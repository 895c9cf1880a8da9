//! Metrics snapshots of the shared header
//!
//! Snapshots read each field independently with relaxed ordering. They are
//! safe to take while producers and consumers are running and reflect a
//! recent, not a point-in-time consistent, view.

use crate::header::SharedMemoryHeader;
use crate::platform::now_ns;
use serde::Serialize;
use std::sync::atomic::Ordering;

/// Plain copy of the header's state and counters.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataBlockMetrics {
    // State, never cleared by reset
    /// Successful commits across all slots
    pub commit_index: u64,
    /// Ring capacity
    pub slot_count: u64,
    /// Segment creation time
    pub created_at_ns: u64,
    /// Seconds since creation
    pub uptime_seconds: u64,

    // Counters
    /// See [`crate::header::MetricsBlock::writer_timeout_count`]
    pub writer_timeout_count: u64,
    /// See [`crate::header::MetricsBlock::writer_lock_timeout_count`]
    pub writer_lock_timeout_count: u64,
    /// See [`crate::header::MetricsBlock::writer_reader_timeout_count`]
    pub writer_reader_timeout_count: u64,
    /// See [`crate::header::MetricsBlock::writer_blocked_total_ns`]
    pub writer_blocked_total_ns: u64,
    /// See [`crate::header::MetricsBlock::write_lock_contention`]
    pub write_lock_contention: u64,
    /// See [`crate::header::MetricsBlock::writer_drain_count`]
    pub writer_drain_count: u64,
    /// See [`crate::header::MetricsBlock::reader_not_ready_count`]
    pub reader_not_ready_count: u64,
    /// See [`crate::header::MetricsBlock::reader_race_detected`]
    pub reader_race_detected: u64,
    /// See [`crate::header::MetricsBlock::reader_validation_failed`]
    pub reader_validation_failed: u64,
    /// See [`crate::header::MetricsBlock::reader_timeout_count`]
    pub reader_timeout_count: u64,
    /// See [`crate::header::MetricsBlock::reader_peak_count`]
    pub reader_peak_count: u64,
    /// See [`crate::header::MetricsBlock::slot_acquire_errors`]
    pub slot_acquire_errors: u64,
    /// See [`crate::header::MetricsBlock::slot_commit_errors`]
    pub slot_commit_errors: u64,
    /// See [`crate::header::MetricsBlock::slot_release_errors`]
    pub slot_release_errors: u64,
    /// See [`crate::header::MetricsBlock::checksum_failures`]
    pub checksum_failures: u64,
    /// See [`crate::header::MetricsBlock::zombie_writers_released`]
    pub zombie_writers_released: u64,
    /// See [`crate::header::MetricsBlock::zombie_readers_released`]
    pub zombie_readers_released: u64,
    /// See [`crate::header::MetricsBlock::dead_consumers_removed`]
    pub dead_consumers_removed: u64,
    /// See [`crate::header::MetricsBlock::recovery_actions_count`]
    pub recovery_actions_count: u64,
    /// See [`crate::header::MetricsBlock::last_error_timestamp_ns`]
    pub last_error_timestamp_ns: u64,
    /// See [`crate::header::MetricsBlock::last_error_code`]
    pub last_error_code: u64,
    /// See [`crate::header::MetricsBlock::error_sequence`]
    pub error_sequence: u64,
    /// See [`crate::header::MetricsBlock::total_slots_written`]
    pub total_slots_written: u64,
    /// See [`crate::header::MetricsBlock::total_slots_read`]
    pub total_slots_read: u64,
    /// See [`crate::header::MetricsBlock::total_bytes_written`]
    pub total_bytes_written: u64,
    /// See [`crate::header::MetricsBlock::total_bytes_read`]
    pub total_bytes_read: u64,
}

/// Snapshot the header.
pub fn get_metrics(header: &SharedMemoryHeader) -> DataBlockMetrics {
    let m = &header.metrics;
    let load = |counter: &std::sync::atomic::AtomicU64| counter.load(Ordering::Relaxed);

    DataBlockMetrics {
        commit_index: header.commit_index.load(Ordering::Acquire),
        slot_count: u64::from(header.ring_buffer_capacity),
        created_at_ns: header.created_at_ns,
        uptime_seconds: now_ns().saturating_sub(header.created_at_ns) / 1_000_000_000,

        writer_timeout_count: load(&m.writer_timeout_count),
        writer_lock_timeout_count: load(&m.writer_lock_timeout_count),
        writer_reader_timeout_count: load(&m.writer_reader_timeout_count),
        writer_blocked_total_ns: load(&m.writer_blocked_total_ns),
        write_lock_contention: load(&m.write_lock_contention),
        writer_drain_count: load(&m.writer_drain_count),
        reader_not_ready_count: load(&m.reader_not_ready_count),
        reader_race_detected: load(&m.reader_race_detected),
        reader_validation_failed: load(&m.reader_validation_failed),
        reader_timeout_count: load(&m.reader_timeout_count),
        reader_peak_count: load(&m.reader_peak_count),
        slot_acquire_errors: load(&m.slot_acquire_errors),
        slot_commit_errors: load(&m.slot_commit_errors),
        slot_release_errors: load(&m.slot_release_errors),
        checksum_failures: load(&m.checksum_failures),
        zombie_writers_released: load(&m.zombie_writers_released),
        zombie_readers_released: load(&m.zombie_readers_released),
        dead_consumers_removed: load(&m.dead_consumers_removed),
        recovery_actions_count: load(&m.recovery_actions_count),
        last_error_timestamp_ns: load(&m.last_error_timestamp_ns),
        last_error_code: load(&m.last_error_code),
        error_sequence: load(&m.error_sequence),
        total_slots_written: load(&m.total_slots_written),
        total_slots_read: load(&m.total_slots_read),
        total_bytes_written: load(&m.total_bytes_written),
        total_bytes_read: load(&m.total_bytes_read),
    }
}

/// Zero every counter. `commit_index` and the layout are left untouched.
pub fn reset_metrics(header: &SharedMemoryHeader) {
    for counter in header.metrics.counters() {
        counter.store(0, Ordering::Relaxed);
    }
}

/// Successful commits since the last reset.
pub fn get_total_slots_written(header: &SharedMemoryHeader) -> u64 {
    header.metrics.total_slots_written.load(Ordering::Relaxed)
}

/// Successful commits since creation.
pub fn get_commit_index(header: &SharedMemoryHeader) -> u64 {
    header.commit_index.load(Ordering::Acquire)
}

/// Ring capacity.
pub fn get_slot_count(header: &SharedMemoryHeader) -> u64 {
    u64::from(header.ring_buffer_capacity)
}

/// Account payload bytes handed to a slot by a producer.
pub fn record_bytes_written(header: &SharedMemoryHeader, bytes: u64) {
    header
        .metrics
        .total_bytes_written
        .fetch_add(bytes, Ordering::Relaxed);
}

/// Account payload bytes copied out of a slot by a consumer.
pub fn record_bytes_read(header: &SharedMemoryHeader, bytes: u64) {
    header
        .metrics
        .total_bytes_read
        .fetch_add(bytes, Ordering::Relaxed);
}

// Keep the snapshot in step with the shared block
static_assertions::const_assert_eq!(
    core::mem::size_of::<DataBlockMetrics>(),
    (4 + crate::header::METRICS_COUNTER_COUNT) * 8
);
