//! C ABI
//!
//! Protocol entry points take raw pointers into a mapped segment. Admin entry
//! points take a segment name, open the segment in the default shm directory
//! and close it before returning.
//!
//! Return conventions: protocol calls return [`SlotAcquireResult`], recovery
//! calls return [`RecoveryResult`], everything else returns `0` on success,
//! `-1` for invalid arguments, `-2` for open/internal errors, `-3` for an
//! invalid slot index, `-4` for runtime errors and `-5` for a caught panic.
//! No call unwinds into C.

use crate::coordinator::{SlotAcquireResult, SlotRWCoordinator};
use crate::diagnostics::{SlotDiagnostic, diagnose_all_slots_into};
use crate::error::DataBlockError;
use crate::header::SharedMemoryHeader;
use crate::metrics::{
    DataBlockMetrics, get_commit_index, get_metrics, get_slot_count, get_total_slots_written,
    reset_metrics,
};
use crate::platform::is_process_alive;
use crate::recovery::{DataBlockRecovery, RecoveryResult};
use crate::slot::SlotRWState;
use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::error;

const FFI_OK: i32 = 0;
const FFI_INVALID_ARGUMENT: i32 = -1;
const FFI_PANIC: i32 = -5;

fn guarded<T>(fallback: T, call: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|_| {
        error!("panic caught at the C boundary");
        fallback
    })
}

fn code(result: Result<(), DataBlockError>) -> i32 {
    match result {
        Ok(()) => FFI_OK,
        Err(err) => err.ffi_code(),
    }
}

/// Segment name from a C string, `None` if null or not UTF-8.
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string.
unsafe fn segment_name<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    // Safety: non-null and NUL-terminated per the caller's contract
    let name = unsafe { CStr::from_ptr(name) };
    name.to_str().ok()
}

fn open_recovery(name: &str) -> Result<DataBlockRecovery, DataBlockError> {
    DataBlockRecovery::open(name)
}

/// # Safety
/// `state` must be null or point to a live `SlotRWState`.
unsafe fn coordinator<'a>(state: *const SlotRWState) -> Option<SlotRWCoordinator<'a>> {
    // Safety: forwarded from the caller
    let state = unsafe { state.as_ref() };
    state.map(SlotRWCoordinator::new)
}

// ─── Writer ─────────────────────────────────────────────────────────

/// Take the write lock of a slot.
///
/// # Safety
/// `state` must be null or point to a `SlotRWState` inside a live mapping.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_acquire_write(
    state: *const SlotRWState,
    timeout_ms: i32,
) -> SlotAcquireResult {
    guarded(SlotAcquireResult::Error, || {
        // Safety: forwarded from the caller
        match unsafe { coordinator(state) } {
            Some(coordinator) => coordinator.acquire_write(timeout_ms).into(),
            None => SlotAcquireResult::Error,
        }
    })
}

/// Publish the payload of a held slot.
///
/// # Safety
/// `state` must be null or point to a `SlotRWState` inside a live mapping.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_commit(state: *const SlotRWState) -> SlotAcquireResult {
    guarded(SlotAcquireResult::Error, || {
        // Safety: forwarded from the caller
        match unsafe { coordinator(state) } {
            Some(coordinator) => coordinator.commit().into(),
            None => SlotAcquireResult::Error,
        }
    })
}

/// Publish the payload of a held slot and account it in `header`.
///
/// # Safety
/// `state` and `header` must be null or point into the same live mapping.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_commit_with_header(
    state: *const SlotRWState,
    header: *const SharedMemoryHeader,
) -> SlotAcquireResult {
    guarded(SlotAcquireResult::Error, || {
        // Safety: forwarded from the caller
        match unsafe { (state.as_ref(), header.as_ref()) } {
            (Some(state), Some(header)) => {
                SlotRWCoordinator::with_header(state, header).commit().into()
            }
            _ => SlotAcquireResult::Error,
        }
    })
}

/// Drop the write lock of a slot.
///
/// # Safety
/// `state` must be null or point to a `SlotRWState` inside a live mapping.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_release_write(state: *const SlotRWState) -> SlotAcquireResult {
    guarded(SlotAcquireResult::Error, || {
        // Safety: forwarded from the caller
        match unsafe { coordinator(state) } {
            Some(coordinator) => coordinator.release_write().into(),
            None => SlotAcquireResult::Error,
        }
    })
}

// ─── Reader ─────────────────────────────────────────────────────────

/// Enter the read window of a committed slot without waiting.
///
/// # Safety
/// `state` must be null or point to a `SlotRWState` inside a live mapping;
/// `out_generation` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_acquire_read(
    state: *const SlotRWState,
    out_generation: *mut u64,
) -> SlotAcquireResult {
    // Safety: forwarded from the caller
    unsafe { slot_rw_acquire_read_timeout(state, 0, out_generation) }
}

/// Enter the read window of a committed slot, waiting up to `timeout_ms`.
///
/// # Safety
/// `state` must be null or point to a `SlotRWState` inside a live mapping;
/// `out_generation` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_acquire_read_timeout(
    state: *const SlotRWState,
    timeout_ms: i32,
    out_generation: *mut u64,
) -> SlotAcquireResult {
    guarded(SlotAcquireResult::Error, || {
        // Safety: forwarded from the caller
        let (Some(coordinator), Some(out)) =
            (unsafe { coordinator(state) }, unsafe { out_generation.as_mut() })
        else {
            return SlotAcquireResult::Error;
        };
        match coordinator.acquire_read(timeout_ms) {
            Ok(generation) => {
                *out = generation;
                SlotAcquireResult::Ok
            }
            Err(err) => err.into(),
        }
    })
}

/// Whether the slot still carries `generation`.
///
/// # Safety
/// `state` must be null or point to a `SlotRWState` inside a live mapping.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_validate_read(state: *const SlotRWState, generation: u64) -> bool {
    guarded(false, || {
        // Safety: forwarded from the caller
        let coordinator = unsafe { coordinator(state) };
        coordinator.is_some_and(|coordinator| coordinator.validate_read(generation))
    })
}

/// Leave the read window.
///
/// # Safety
/// `state` must be null or point to a `SlotRWState` inside a live mapping.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_release_read(state: *const SlotRWState) -> SlotAcquireResult {
    guarded(SlotAcquireResult::Error, || {
        // Safety: forwarded from the caller
        match unsafe { coordinator(state) } {
            Some(coordinator) => coordinator.release_read().into(),
            None => SlotAcquireResult::Error,
        }
    })
}

// ─── Metrics ────────────────────────────────────────────────────────

/// Snapshot the metrics of a mapped header.
///
/// # Safety
/// `header` must be null or point to a live header; `out` must be null or
/// writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_get_metrics(
    header: *const SharedMemoryHeader,
    out: *mut DataBlockMetrics,
) -> i32 {
    guarded(FFI_PANIC, || {
        // Safety: forwarded from the caller
        match unsafe { (header.as_ref(), out.as_mut()) } {
            (Some(header), Some(out)) => {
                *out = get_metrics(header);
                FFI_OK
            }
            _ => FFI_INVALID_ARGUMENT,
        }
    })
}

/// Zero the counters of a mapped header.
///
/// # Safety
/// `header` must be null or point to a live header.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_reset_metrics(header: *const SharedMemoryHeader) -> i32 {
    guarded(FFI_PANIC, || {
        // Safety: forwarded from the caller
        match unsafe { header.as_ref() } {
            Some(header) => {
                reset_metrics(header);
                FFI_OK
            }
            None => FFI_INVALID_ARGUMENT,
        }
    })
}

/// Commits since the last reset, 0 for a null header.
///
/// # Safety
/// `header` must be null or point to a live header.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_get_total_slots_written(header: *const SharedMemoryHeader) -> u64 {
    // Safety: forwarded from the caller
    guarded(0, || unsafe { header.as_ref() }.map_or(0, get_total_slots_written))
}

/// Commits since creation, 0 for a null header.
///
/// # Safety
/// `header` must be null or point to a live header.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_get_commit_index(header: *const SharedMemoryHeader) -> u64 {
    // Safety: forwarded from the caller
    guarded(0, || unsafe { header.as_ref() }.map_or(0, get_commit_index))
}

/// Ring capacity, 0 for a null header.
///
/// # Safety
/// `header` must be null or point to a live header.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slot_rw_get_slot_count(header: *const SharedMemoryHeader) -> u64 {
    // Safety: forwarded from the caller
    guarded(0, || unsafe { header.as_ref() }.map_or(0, get_slot_count))
}

// ─── Diagnostics ────────────────────────────────────────────────────

/// Snapshot one slot of segment `name`.
///
/// # Safety
/// `name` must be null or NUL-terminated; `out` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_diagnose_slot(
    name: *const c_char,
    index: u32,
    out: *mut SlotDiagnostic,
) -> i32 {
    guarded(FFI_PANIC, || {
        // Safety: forwarded from the caller
        let (Some(name), Some(out)) = (unsafe { segment_name(name) }, unsafe { out.as_mut() })
        else {
            return FFI_INVALID_ARGUMENT;
        };
        code(open_recovery(name).and_then(|recovery| {
            *out = recovery.diagnose_slot(index as usize)?;
            Ok(())
        }))
    })
}

/// Snapshot up to `capacity` slots of segment `name` into `out`.
///
/// `out_count` receives the number written; fewer than the ring capacity
/// means the output was truncated.
///
/// # Safety
/// `name` must be null or NUL-terminated; `out` must be null or point to
/// `capacity` writable entries; `out_count` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_diagnose_all_slots(
    name: *const c_char,
    out: *mut SlotDiagnostic,
    capacity: usize,
    out_count: *mut usize,
) -> i32 {
    guarded(FFI_PANIC, || {
        // Safety: forwarded from the caller
        let (Some(name), Some(count)) = (unsafe { segment_name(name) }, unsafe { out_count.as_mut() })
        else {
            return FFI_INVALID_ARGUMENT;
        };
        if out.is_null() && capacity > 0 {
            return FFI_INVALID_ARGUMENT;
        }
        let entries: &mut [SlotDiagnostic] = if capacity == 0 {
            &mut []
        } else {
            // Safety: non-null with `capacity` entries per the caller's contract
            unsafe { std::slice::from_raw_parts_mut(out, capacity) }
        };
        code(open_recovery(name).map(|recovery| {
            *count = diagnose_all_slots_into(recovery.segment(), entries, recovery.oracle());
        }))
    })
}

/// Whether `pid` refers to a running process.
#[unsafe(no_mangle)]
pub extern "C" fn datablock_is_process_alive(pid: u64) -> bool {
    guarded(false, || is_process_alive(pid))
}

// ─── Recovery ───────────────────────────────────────────────────────

fn recover(
    name: *const c_char,
    action: impl FnOnce(&DataBlockRecovery) -> RecoveryResult,
) -> RecoveryResult {
    guarded(RecoveryResult::Failed, || {
        // Safety: every caller forwards a pointer under the same contract
        let Some(name) = (unsafe { segment_name(name) }) else {
            return RecoveryResult::Failed;
        };
        match open_recovery(name) {
            Ok(recovery) => action(&recovery),
            Err(err) => {
                error!(segment = name, %err, "cannot open segment for recovery");
                RecoveryResult::Failed
            }
        }
    })
}

/// Reset one slot to FREE.
///
/// # Safety
/// `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_force_reset_slot(
    name: *const c_char,
    index: u32,
    force: bool,
) -> RecoveryResult {
    recover(name, |recovery| recovery.force_reset_slot(index as usize, force))
}

/// Reset every slot to FREE.
///
/// # Safety
/// `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_force_reset_all_slots(
    name: *const c_char,
    force: bool,
) -> RecoveryResult {
    recover(name, |recovery| recovery.force_reset_all_slots(force))
}

/// Zero the reader count of a slot.
///
/// # Safety
/// `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_release_zombie_readers(
    name: *const c_char,
    index: u32,
    force: bool,
) -> RecoveryResult {
    recover(name, |recovery| {
        recovery.release_zombie_readers(index as usize, force)
    })
}

/// Clear a write lock whose holder is dead.
///
/// # Safety
/// `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_release_zombie_writer(
    name: *const c_char,
    index: u32,
) -> RecoveryResult {
    recover(name, |recovery| recovery.release_zombie_writer(index as usize))
}

/// Remove heartbeat entries of dead consumers.
///
/// # Safety
/// `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_cleanup_dead_consumers(name: *const c_char) -> RecoveryResult {
    recover(name, |recovery| recovery.cleanup_dead_consumers())
}

/// Check header and checksums, optionally repairing checksums.
///
/// # Safety
/// `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_validate_integrity(
    name: *const c_char,
    repair: bool,
) -> RecoveryResult {
    recover(name, |recovery| recovery.validate_integrity(repair))
}

/// Snapshot the metrics of segment `name`.
///
/// # Safety
/// `name` must be null or NUL-terminated; `out` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_get_metrics(
    name: *const c_char,
    out: *mut DataBlockMetrics,
) -> i32 {
    guarded(FFI_PANIC, || {
        // Safety: forwarded from the caller
        let (Some(name), Some(out)) = (unsafe { segment_name(name) }, unsafe { out.as_mut() })
        else {
            return FFI_INVALID_ARGUMENT;
        };
        code(open_recovery(name).map(|recovery| {
            *out = get_metrics(recovery.segment().header());
        }))
    })
}

/// Zero the counters of segment `name`.
///
/// # Safety
/// `name` must be null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn datablock_reset_metrics(name: *const c_char) -> i32 {
    guarded(FFI_PANIC, || {
        // Safety: forwarded from the caller
        let Some(name) = (unsafe { segment_name(name) }) else {
            return FFI_INVALID_ARGUMENT;
        };
        code(open_recovery(name).map(|recovery| {
            reset_metrics(recovery.segment().header());
        }))
    })
}
