//! Per-slot atomic control block shared between processes

use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Slot lifecycle tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum SlotState {
    /// Never committed, or abandoned by an uncommitted writer
    Free = 0,
    /// A writer holds the lock and may be modifying the payload
    Writing = 1,
    /// A writer holds the lock and waits for readers to leave
    Draining = 2,
    /// Payload is complete and readable
    Committed = 3,
}

impl SlotState {
    /// Decode a raw tag. Returns `None` for values no build ever writes.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Writing),
            2 => Some(Self::Draining),
            3 => Some(Self::Committed),
            _ => None,
        }
    }

    /// Upper-case name used in logs and the admin tool.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Writing => "WRITING",
            Self::Draining => "DRAINING",
            Self::Committed => "COMMITTED",
        }
    }

    /// Whether a writer is expected to hold the lock in this state.
    #[inline]
    pub const fn is_write_held(&self) -> bool {
        matches!(self, Self::Writing | Self::Draining)
    }
}

/// Atomic control block for one ring-buffer position.
///
/// Lives inside the shared segment and is zero-initialized by the allocator
/// (FREE, unlocked, no readers, generation 0). It is never destroyed, only
/// reset in place by recovery.
///
/// Invariants at every API boundary:
/// - `write_lock != 0` implies the tag is WRITING or DRAINING
/// - `reader_count > 0` implies the slot has been committed at least once
/// - `write_generation` never decreases
#[repr(C, align(64))]
pub struct SlotRWState {
    /// PID of the writer holding the slot, 0 when unlocked
    pub write_lock: AtomicU64,
    /// Incremented exactly once per successful commit
    pub write_generation: AtomicU64,
    /// Wall-clock time the current write lock was taken, 0 when unlocked
    pub lock_acquired_at_ns: AtomicU64,
    /// Generation observed when the current write lock was taken
    pub acquired_generation: AtomicU64,
    /// Readers currently inside their read window
    pub reader_count: AtomicU32,
    /// Raw [`SlotState`] tag
    pub slot_state: AtomicU8,
    /// Non-zero while a writer waits for readers to drain
    pub writer_waiting: AtomicU8,
    _padding: [u8; 26],
}

const_assert_eq!(core::mem::size_of::<SlotRWState>(), 64);
const_assert_eq!(core::mem::align_of::<SlotRWState>(), 64);

impl SlotRWState {
    /// Zeroed control block, identical to what the allocator produces.
    pub const fn new() -> Self {
        Self {
            write_lock: AtomicU64::new(0),
            write_generation: AtomicU64::new(0),
            lock_acquired_at_ns: AtomicU64::new(0),
            acquired_generation: AtomicU64::new(0),
            reader_count: AtomicU32::new(0),
            slot_state: AtomicU8::new(SlotState::Free as u8),
            writer_waiting: AtomicU8::new(0),
            _padding: [0; 26],
        }
    }

    /// Raw tag with acquire ordering.
    #[inline]
    pub fn raw_state(&self) -> u8 {
        self.slot_state.load(Ordering::Acquire)
    }

    /// Decoded tag, `None` if the shared value is garbage.
    #[inline]
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u8(self.raw_state())
    }

    /// Store a tag.
    #[inline]
    pub fn set_state(&self, state: SlotState, order: Ordering) {
        self.slot_state.store(state as u8, order);
    }

    /// PID holding the write lock, 0 when unlocked.
    #[inline]
    pub fn writer_pid(&self) -> u64 {
        self.write_lock.load(Ordering::Acquire)
    }

    /// Current generation with acquire ordering.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.write_generation.load(Ordering::Acquire)
    }

    /// Current reader count.
    #[inline]
    pub fn readers(&self) -> u32 {
        self.reader_count.load(Ordering::Acquire)
    }

    /// Whether a writer is parked waiting for readers.
    #[inline]
    pub fn is_writer_waiting(&self) -> bool {
        self.writer_waiting.load(Ordering::Acquire) != 0
    }
}

impl Default for SlotRWState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlotRWState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRWState")
            .field("slot_state", &self.state())
            .field("write_lock", &self.writer_pid())
            .field("reader_count", &self.readers())
            .field("write_generation", &self.generation())
            .field("writer_waiting", &self.is_writer_waiting())
            .finish()
    }
}

/// Stored checksum of one slot payload.
#[repr(C)]
pub struct SlotChecksum {
    /// CRC-32 over the full logical unit
    pub crc32: AtomicU32,
    /// Non-zero once `crc32` has been stamped by a producer
    pub valid: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<SlotChecksum>(), 8);

impl SlotChecksum {
    /// Stamp a checksum.
    pub fn store(&self, crc32: u32) {
        self.crc32.store(crc32, Ordering::Relaxed);
        self.valid.store(1, Ordering::Release);
    }

    /// Stored checksum, `None` if never stamped.
    pub fn load(&self) -> Option<u32> {
        if self.valid.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.crc32.load(Ordering::Relaxed))
    }

    /// Forget the stored checksum.
    pub fn invalidate(&self) {
        self.valid.store(0, Ordering::Release);
    }
}
