//! Read-only slot snapshots
//!
//! A [`SlotDiagnostic`] is a plain copy of one control block plus the
//! stuck-writer verdict. It holds no reference into shared memory.

use crate::error::DataBlockResult;
use crate::liveness::{ProcessLiveness, is_lock_holder_alive};
use crate::platform::now_ns;
use crate::segment::DataBlockSegment;
use crate::slot::{SlotRWState, SlotState};
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::debug;

/// Point-in-time copy of a slot's control block.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotDiagnostic {
    /// Stable slot identifier (the ring position)
    pub slot_id: u64,
    /// Ring position
    pub slot_index: u32,
    /// Readers inside their read window
    pub reader_count: u32,
    /// PID holding the write lock, 0 when unlocked
    pub write_lock: u64,
    /// Commit generation
    pub write_generation: u64,
    /// How long the current write lock has been held, 0 when unlocked
    pub stuck_duration_ms: u64,
    /// Raw slot tag
    pub slot_state: u8,
    /// Non-zero while a writer waits for readers
    pub writer_waiting: u8,
    /// Write lock held by a process that no longer exists
    pub is_stuck: bool,
}

impl SlotDiagnostic {
    /// Decoded slot tag.
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u8(self.slot_state)
    }

    /// Tag name for display, `"INVALID"` for garbage.
    pub fn state_name(&self) -> &'static str {
        self.state().map_or("INVALID", |state| state.name())
    }

    /// Whether a write lock is held.
    pub fn is_locked(&self) -> bool {
        self.write_lock != 0
    }
}

/// Snapshot one control block.
pub fn diagnose_slot<L: ProcessLiveness + ?Sized>(
    state: &SlotRWState,
    index: usize,
    oracle: &L,
) -> SlotDiagnostic {
    let write_lock = state.write_lock.load(Ordering::Acquire);
    let acquired_at_ns = state.lock_acquired_at_ns.load(Ordering::Acquire);

    let stuck_duration_ms = if write_lock != 0 && acquired_at_ns != 0 {
        now_ns().saturating_sub(acquired_at_ns) / 1_000_000
    } else {
        0
    };

    SlotDiagnostic {
        slot_id: index as u64,
        slot_index: u32::try_from(index).unwrap_or(u32::MAX),
        reader_count: state.reader_count.load(Ordering::Acquire),
        write_lock,
        write_generation: state.write_generation.load(Ordering::Acquire),
        stuck_duration_ms,
        slot_state: state.slot_state.load(Ordering::Acquire),
        writer_waiting: state.writer_waiting.load(Ordering::Acquire),
        is_stuck: write_lock != 0 && !is_lock_holder_alive(oracle, write_lock, acquired_at_ns),
    }
}

/// Snapshot slot `index` of a mapped segment.
pub fn diagnose_segment_slot<L: ProcessLiveness + ?Sized>(
    segment: &DataBlockSegment,
    index: usize,
    oracle: &L,
) -> DataBlockResult<SlotDiagnostic> {
    Ok(diagnose_slot(segment.slot_state(index)?, index, oracle))
}

/// Snapshot every slot into `out`.
///
/// Stops when `out` is full and returns the number of entries written; a
/// count below the ring capacity means the output was truncated.
pub fn diagnose_all_slots_into<L: ProcessLiveness + ?Sized>(
    segment: &DataBlockSegment,
    out: &mut [SlotDiagnostic],
    oracle: &L,
) -> usize {
    let states = segment.slot_states();
    let written = states.len().min(out.len());
    for (index, (state, entry)) in states.iter().zip(out.iter_mut()).enumerate() {
        *entry = diagnose_slot(state, index, oracle);
    }
    if written < segment.capacity() {
        debug!(
            segment = segment.name(),
            written,
            capacity = segment.capacity(),
            "slot diagnostics truncated"
        );
    }
    written
}

/// Snapshot every slot.
pub fn diagnose_all_slots<L: ProcessLiveness + ?Sized>(
    segment: &DataBlockSegment,
    oracle: &L,
) -> Vec<SlotDiagnostic> {
    segment
        .slot_states()
        .iter()
        .enumerate()
        .map(|(index, state)| diagnose_slot(state, index, oracle))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::SlotRWCoordinator;
    use crate::liveness::testing::FakeLiveness;
    use crate::segment::DataBlockLayout;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_slot_snapshot() {
        let state = SlotRWState::new();
        let diag = diagnose_slot(&state, 3, &FakeLiveness::default());
        assert_eq!(diag.slot_id, 3);
        assert_eq!(diag.slot_index, 3);
        assert_eq!(diag.state(), Some(SlotState::Free));
        assert!(!diag.is_locked());
        assert!(!diag.is_stuck);
        assert_eq!(diag.stuck_duration_ms, 0);
    }

    #[test]
    fn test_live_writer_is_not_stuck() {
        let state = SlotRWState::new();
        let coord = SlotRWCoordinator::new(&state).with_pid(500);
        coord.acquire_write(0).unwrap();

        let oracle = FakeLiveness::with_alive(&[500]);
        let diag = diagnose_slot(&state, 0, &oracle);
        assert_eq!(diag.write_lock, 500);
        assert_eq!(diag.state_name(), "WRITING");
        assert!(!diag.is_stuck);

        oracle.kill(500);
        assert!(diagnose_slot(&state, 0, &oracle).is_stuck);
    }

    #[test]
    fn test_stuck_duration_from_lock_stamp() {
        let state = SlotRWState::new();
        state.write_lock.store(77, Ordering::Relaxed);
        state.set_state(SlotState::Writing, Ordering::Relaxed);
        state
            .lock_acquired_at_ns
            .store(now_ns() - 3_000_000_000, Ordering::Relaxed);

        let diag = diagnose_slot(&state, 0, &FakeLiveness::default());
        assert!(diag.is_stuck);
        assert!(diag.stuck_duration_ms >= 3_000);
    }

    #[test]
    fn test_garbage_tag_name() {
        let state = SlotRWState::new();
        state.slot_state.store(9, Ordering::Relaxed);
        let diag = diagnose_slot(&state, 0, &FakeLiveness::default());
        assert_eq!(diag.state(), None);
        assert_eq!(diag.state_name(), "INVALID");
    }

    #[test]
    fn test_diagnose_all_truncates() {
        let dir = TempDir::new().unwrap();
        let name = format!("diag_test_{}", std::process::id());
        let segment = DataBlockSegment::create_in(dir.path(), &name, DataBlockLayout::new(6, 32)).unwrap();
        let oracle = FakeLiveness::default();

        assert_eq!(diagnose_all_slots(&segment, &oracle).len(), 6);

        let mut out = [SlotDiagnostic::default(); 4];
        assert_eq!(diagnose_all_slots_into(&segment, &mut out, &oracle), 4);
        assert_eq!(out[3].slot_index, 3);

        let mut roomy = [SlotDiagnostic::default(); 10];
        assert_eq!(diagnose_all_slots_into(&segment, &mut roomy, &oracle), 6);

        assert!(diagnose_segment_slot(&segment, 6, &oracle).is_err());
    }
}
