//! Crash recovery and integrity repair
//!
//! Every operation here may run while producers and consumers are live. It
//! uses the same atomics as the slot protocol and no extra lock; a slot is
//! claimed by swapping the recovery process's PID into `write_lock` before
//! any other field is touched, and the lock is cleared last.
//!
//! Each mutation logs the slot's pre-state at WARN level before acting.

use crate::diagnostics::{SlotDiagnostic, diagnose_all_slots, diagnose_segment_slot, diagnose_slot};
use crate::error::DataBlockResult;
use crate::header::{MetricsBlock, SharedMemoryHeader};
use crate::liveness::{OsProcessLiveness, ProcessLiveness};
use crate::platform::get_current_pid;
use crate::producer::DataBlockProducer;
use crate::segment::DataBlockSegment;
use crate::slot::{SlotRWState, SlotState};
use datablock_common::config::resolve_shm_dir;
use datablock_common::layout::region_checksum;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// C-compatible outcome of a recovery operation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryResult {
    /// Action performed, or nothing was wrong
    Success = 0,
    /// Corruption that cannot be repaired, or a repair that failed
    Failed = 1,
    /// Refused: acting could break a live participant
    Unsafe = 2,
    /// Nothing to recover
    NotStuck = 3,
    /// Slot index outside the ring
    InvalidSlot = 4,
}

impl RecoveryResult {
    /// Upper-case name used by the admin tool.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Unsafe => "UNSAFE",
            Self::NotStuck => "NOT_STUCK",
            Self::InvalidSlot => "INVALID_SLOT",
        }
    }

    /// Whether the segment is in the desired state afterwards.
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Success | Self::NotStuck)
    }
}

/// Recovery and diagnostics over one mapped segment.
///
/// The liveness oracle is injected so tests can stage dead processes.
pub struct DataBlockRecovery<L: ProcessLiveness = OsProcessLiveness> {
    segment: DataBlockSegment,
    oracle: L,
    pid: u64,
}

impl DataBlockRecovery<OsProcessLiveness> {
    /// Open segment `name` in the default shm directory.
    pub fn open(name: &str) -> DataBlockResult<Self> {
        Self::open_in(&resolve_shm_dir(None), name)
    }

    /// Open segment `name` in `dir`.
    ///
    /// The header is not validated here so a damaged segment can still be
    /// inspected; [`validate_integrity`](Self::validate_integrity) reports it.
    pub fn open_in(dir: &Path, name: &str) -> DataBlockResult<Self> {
        let segment = DataBlockSegment::open_unchecked_in(dir, name)?;
        if let Err(err) = segment.check_header() {
            warn!(segment = name, %err, "segment header failed validation");
        }
        Ok(Self::with_liveness(segment, OsProcessLiveness))
    }
}

impl<L: ProcessLiveness> DataBlockRecovery<L> {
    /// Recovery over `segment` using `oracle` for liveness.
    pub fn with_liveness(segment: DataBlockSegment, oracle: L) -> Self {
        Self {
            segment,
            oracle,
            pid: get_current_pid(),
        }
    }

    /// The mapped segment.
    pub fn segment(&self) -> &DataBlockSegment {
        &self.segment
    }

    /// The liveness oracle.
    pub fn oracle(&self) -> &L {
        &self.oracle
    }

    fn header(&self) -> &SharedMemoryHeader {
        self.segment.header()
    }

    /// Snapshot slot `index`.
    pub fn diagnose_slot(&self, index: usize) -> DataBlockResult<SlotDiagnostic> {
        diagnose_segment_slot(&self.segment, index, &self.oracle)
    }

    /// Snapshot every slot.
    pub fn diagnose_all_slots(&self) -> Vec<SlotDiagnostic> {
        diagnose_all_slots(&self.segment, &self.oracle)
    }

    /// Return slot `index` to FREE with no lock and no readers.
    ///
    /// Without `force`, refuses when a live writer holds the slot or readers
    /// are inside it.
    pub fn force_reset_slot(&self, index: usize, force: bool) -> RecoveryResult {
        let Ok(state) = self.segment.slot_state(index) else {
            return RecoveryResult::InvalidSlot;
        };
        let before = diagnose_slot(state, index, &self.oracle);
        let holder_alive = before.is_locked() && !before.is_stuck;

        if !force && (holder_alive || before.reader_count > 0) {
            warn!(
                slot = index,
                write_lock = before.write_lock,
                reader_count = before.reader_count,
                holder_alive,
                "refusing to reset slot in use; pass force to override"
            );
            return RecoveryResult::Unsafe;
        }

        log_pre_state("force reset", &before, force);
        if !self.claim(state, before.write_lock) {
            warn!(slot = index, "slot changed under recovery, reset abandoned");
            return RecoveryResult::Unsafe;
        }

        state.reader_count.store(0, Ordering::SeqCst);
        state.writer_waiting.store(0, Ordering::Relaxed);
        state.set_state(SlotState::Free, Ordering::Release);
        self.unclaim(state);

        if before.is_stuck {
            MetricsBlock::bump(&self.header().metrics.zombie_writers_released);
        }
        self.header().record_recovery_action();
        info!(slot = index, "slot reset to FREE");
        RecoveryResult::Success
    }

    /// [`force_reset_slot`](Self::force_reset_slot) on every slot.
    ///
    /// Returns `Unsafe` if any slot refused, `Success` otherwise.
    pub fn force_reset_all_slots(&self, force: bool) -> RecoveryResult {
        let mut refused = 0usize;
        for index in 0..self.segment.slot_states().len() {
            match self.force_reset_slot(index, force) {
                RecoveryResult::Success => {}
                _ => refused += 1,
            }
        }
        if refused > 0 {
            warn!(refused, "some slots were not reset");
            return RecoveryResult::Unsafe;
        }
        RecoveryResult::Success
    }

    /// Zero the reader count of slot `index`.
    ///
    /// A slot left DRAINING by a dead writer is restored to COMMITTED: the
    /// writer never got past waiting for readers, so the last payload is
    /// intact. With a live writer (and `force`) only the count is cleared and
    /// the waiting writer proceeds on its own.
    pub fn release_zombie_readers(&self, index: usize, force: bool) -> RecoveryResult {
        let Ok(state) = self.segment.slot_state(index) else {
            return RecoveryResult::InvalidSlot;
        };
        let before = diagnose_slot(state, index, &self.oracle);
        if before.reader_count == 0 {
            return RecoveryResult::NotStuck;
        }
        let holder_alive = before.is_locked() && !before.is_stuck;
        if holder_alive && !force {
            warn!(
                slot = index,
                write_lock = before.write_lock,
                reader_count = before.reader_count,
                "refusing to release readers of a slot with a live writer"
            );
            return RecoveryResult::Unsafe;
        }

        log_pre_state("release zombie readers", &before, force);

        if holder_alive {
            let released = state.reader_count.swap(0, Ordering::SeqCst);
            self.account_readers(released);
            info!(slot = index, released, "zombie readers released");
            return RecoveryResult::Success;
        }

        if !self.claim(state, before.write_lock) {
            warn!(slot = index, "slot changed under recovery, release abandoned");
            return RecoveryResult::Unsafe;
        }
        let released = state.reader_count.swap(0, Ordering::SeqCst);
        state.writer_waiting.store(0, Ordering::Relaxed);
        match before.state() {
            Some(SlotState::Draining) => state.set_state(SlotState::Committed, Ordering::Release),
            Some(SlotState::Writing) => state.set_state(release_state(state), Ordering::Release),
            _ => {}
        }
        self.unclaim(state);

        if before.is_stuck {
            MetricsBlock::bump(&self.header().metrics.zombie_writers_released);
        }
        self.account_readers(released);
        info!(slot = index, released, "zombie readers released");
        RecoveryResult::Success
    }

    /// Clear a write lock whose holder is dead and return the slot to FREE.
    ///
    /// A payload the dead writer committed stays in place but is no longer
    /// readable until the next commit.
    pub fn release_zombie_writer(&self, index: usize) -> RecoveryResult {
        let Ok(state) = self.segment.slot_state(index) else {
            return RecoveryResult::InvalidSlot;
        };
        let before = diagnose_slot(state, index, &self.oracle);
        if !before.is_locked() {
            return RecoveryResult::NotStuck;
        }
        if !before.is_stuck {
            warn!(
                slot = index,
                write_lock = before.write_lock,
                held_ms = before.stuck_duration_ms,
                "write lock holder is alive, refusing to release"
            );
            return RecoveryResult::Unsafe;
        }

        log_pre_state("release zombie writer", &before, false);
        if !self.claim(state, before.write_lock) {
            return if state.writer_pid() == 0 {
                RecoveryResult::NotStuck
            } else {
                RecoveryResult::Unsafe
            };
        }
        state.writer_waiting.store(0, Ordering::Relaxed);
        state.set_state(SlotState::Free, Ordering::Release);
        self.unclaim(state);

        MetricsBlock::bump(&self.header().metrics.zombie_writers_released);
        self.header().record_recovery_action();
        info!(slot = index, dead_pid = before.write_lock, "zombie writer released");
        RecoveryResult::Success
    }

    /// Remove heartbeat entries of dead consumers.
    ///
    /// `Success` if at least one entry was removed, `NotStuck` if none.
    pub fn cleanup_dead_consumers(&self) -> RecoveryResult {
        let header = self.header();
        let removed = header.sweep_dead_consumers(&self.oracle);
        if removed == 0 {
            return RecoveryResult::NotStuck;
        }
        header
            .metrics
            .dead_consumers_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        header.record_recovery_action();
        info!(
            removed,
            active = header.active_consumer_count.load(Ordering::Relaxed),
            "dead consumers removed"
        );
        RecoveryResult::Success
    }

    /// Check header integrity and, if enabled, payload checksums.
    ///
    /// Magic, version and layout checksum failures are unrepairable. With
    /// `repair`, checksum mismatches are recomputed through a fresh producer
    /// mapping and only a failed recompute counts against the result. Every
    /// slot is checked even after a failure.
    pub fn validate_integrity(&self, repair: bool) -> RecoveryResult {
        if let Err(err) = self.segment.check_header() {
            error!(segment = self.segment.name(), %err, "segment header is corrupted");
            return RecoveryResult::Failed;
        }
        let header = self.header();
        if !header.checksums_enabled() {
            info!(segment = self.segment.name(), "header valid, checksums disabled");
            return RecoveryResult::Success;
        }

        let mut repairer = Repairer::new(&self.segment, repair);
        let mut result = RecoveryResult::Success;

        if let Some(outcome) = self.check_flexible_zone(&mut repairer) {
            result = outcome;
        }

        if header.commit_index.load(Ordering::Acquire) > 0 {
            for index in 0..self.segment.slot_states().len() {
                if let Some(RecoveryResult::Failed) = self.check_slot(index, &mut repairer) {
                    result = RecoveryResult::Failed;
                }
            }
        }

        if repairer.repaired > 0 {
            header.record_recovery_action();
        }
        info!(
            segment = self.segment.name(),
            repaired = repairer.repaired,
            result = result.name(),
            "integrity validation finished"
        );
        result
    }

    fn check_flexible_zone(&self, repairer: &mut Repairer<'_>) -> Option<RecoveryResult> {
        let header = self.header();
        if header.flexible_zone_size == 0
            || header.flexible_zone_checksum_valid.load(Ordering::Acquire) == 0
        {
            return None;
        }
        let stored = header.flexible_zone_checksum.load(Ordering::Relaxed);
        let computed = match self.segment.flexible_zone_bytes() {
            Ok(bytes) => region_checksum(&bytes),
            Err(err) => {
                error!(%err, "flexible zone unreadable");
                return Some(RecoveryResult::Failed);
            }
        };
        if stored == computed {
            return None;
        }

        MetricsBlock::bump(&header.metrics.checksum_failures);
        error!(stored, computed, "flexible zone checksum mismatch");
        Some(repairer.run("flexible zone", |producer| {
            producer.update_checksum_flexible_zone().map(|_| ())
        }))
    }

    fn check_slot(&self, index: usize, repairer: &mut Repairer<'_>) -> Option<RecoveryResult> {
        let state = self.segment.slot_state(index).ok()?;
        let generation = state.generation();
        let published = |state: &SlotRWState| {
            state.state() == Some(SlotState::Committed) && state.writer_pid() == 0
        };
        // FREE slots hold no published payload, e.g. after a crashed overwrite
        if generation == 0 || !published(state) {
            return None;
        }

        let bytes = self.segment.payload_bytes(index).ok()?;
        let stored = self.segment.slot_checksum(index).ok()?.load();
        if !published(state) || state.generation() != generation {
            // Rewritten while we looked; the next writer stamps a fresh checksum
            return None;
        }
        let computed = region_checksum(&bytes);
        if stored == Some(computed) {
            return None;
        }

        MetricsBlock::bump(&self.header().metrics.checksum_failures);
        error!(
            slot = index,
            generation,
            stored = ?stored,
            computed,
            "slot checksum mismatch"
        );
        Some(repairer.run("slot", |producer| {
            producer.update_checksum_slot(index).map(|_| ())
        }))
    }

    /// Account a successful reader release.
    fn account_readers(&self, released: u32) {
        let header = self.header();
        header
            .metrics
            .zombie_readers_released
            .fetch_add(u64::from(released), Ordering::Relaxed);
        header.record_recovery_action();
    }

    /// Swap the recovery PID into the write lock if it still holds `expected`.
    fn claim(&self, state: &SlotRWState, expected: u64) -> bool {
        state
            .write_lock
            .compare_exchange(expected, self.pid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unclaim(&self, state: &SlotRWState) {
        state.lock_acquired_at_ns.store(0, Ordering::Relaxed);
        state.acquired_generation.store(state.generation(), Ordering::Relaxed);
        state.write_lock.store(0, Ordering::Release);
    }
}

/// Tag a slot should have once its writer is gone: COMMITTED if the tenure
/// committed, FREE otherwise.
fn release_state(state: &SlotRWState) -> SlotState {
    if state.write_generation.load(Ordering::Acquire)
        != state.acquired_generation.load(Ordering::Relaxed)
    {
        SlotState::Committed
    } else {
        SlotState::Free
    }
}

fn log_pre_state(action: &str, before: &SlotDiagnostic, force: bool) {
    warn!(
        action,
        slot = before.slot_index,
        state = before.state_name(),
        write_lock = before.write_lock,
        reader_count = before.reader_count,
        write_generation = before.write_generation,
        writer_waiting = before.writer_waiting,
        is_stuck = before.is_stuck,
        held_ms = before.stuck_duration_ms,
        force,
        "recovery action on slot"
    );
}

/// Lazily opened producer mapping used to recompute checksums.
struct Repairer<'a> {
    segment: &'a DataBlockSegment,
    enabled: bool,
    producer: Option<DataBlockProducer>,
    repaired: usize,
}

impl<'a> Repairer<'a> {
    fn new(segment: &'a DataBlockSegment, enabled: bool) -> Self {
        Self {
            segment,
            enabled,
            producer: None,
            repaired: 0,
        }
    }

    fn run(
        &mut self,
        what: &str,
        recompute: impl FnOnce(&DataBlockProducer) -> DataBlockResult<()>,
    ) -> RecoveryResult {
        if !self.enabled {
            return RecoveryResult::Failed;
        }
        if self.producer.is_none() {
            match self.segment.reopen() {
                Ok(segment) => self.producer = Some(DataBlockProducer::attach(segment)),
                Err(err) => {
                    error!(%err, "cannot map segment for repair");
                    return RecoveryResult::Failed;
                }
            }
        }
        let Some(producer) = self.producer.as_ref() else {
            return RecoveryResult::Failed;
        };
        match recompute(producer) {
            Ok(()) => {
                self.repaired += 1;
                warn!(what, "checksum recomputed");
                RecoveryResult::Success
            }
            Err(err) => {
                error!(what, %err, "checksum repair failed");
                RecoveryResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::SlotRWCoordinator;
    use crate::liveness::testing::FakeLiveness;
    use crate::segment::DataBlockLayout;
    use tempfile::TempDir;

    const DEAD: u64 = 4_000_001;
    const LIVE: u64 = 4_000_002;

    struct Fixture {
        _dir: TempDir,
        producer: DataBlockProducer,
        recovery: DataBlockRecovery<FakeLiveness>,
    }

    fn fixture(checksums: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let name = format!("recovery_test_{}", std::process::id());
        let layout = DataBlockLayout::new(4, 32)
            .flexible_zone_size(64)
            .checksums(checksums);
        let producer = DataBlockProducer::create_in(dir.path(), &name, layout).unwrap();
        let segment = DataBlockSegment::open_in(dir.path(), &name).unwrap();
        let oracle = FakeLiveness::with_alive(&[LIVE, get_current_pid()]);
        Fixture {
            _dir: dir,
            producer,
            recovery: DataBlockRecovery::with_liveness(segment, oracle),
        }
    }

    fn lock_as(fixture: &Fixture, index: usize, pid: u64) {
        fixture
            .producer
            .coordinator(index)
            .unwrap()
            .with_pid(pid)
            .acquire_write(0)
            .unwrap();
    }

    fn metric(fixture: &Fixture, pick: impl Fn(&MetricsBlock) -> &std::sync::atomic::AtomicU64) -> u64 {
        pick(&fixture.producer.segment().header().metrics).load(Ordering::Relaxed)
    }

    #[test]
    fn test_zombie_writer_released() {
        let f = fixture(false);
        lock_as(&f, 1, DEAD);

        assert_eq!(f.recovery.release_zombie_writer(1), RecoveryResult::Success);
        let state = f.recovery.segment().slot_state(1).unwrap();
        assert_eq!(state.writer_pid(), 0);
        assert_eq!(state.state(), Some(SlotState::Free));
        assert_eq!(metric(&f, |m| &m.zombie_writers_released), 1);
        assert_eq!(metric(&f, |m| &m.recovery_actions_count), 1);
        assert!(metric(&f, |m| &m.last_error_timestamp_ns) > 0);

        // Slot is usable again
        f.producer.write_slot(1, b"again", 0).unwrap();
    }

    #[test]
    fn test_live_writer_is_unsafe_to_release() {
        let f = fixture(false);
        lock_as(&f, 0, LIVE);
        assert_eq!(f.recovery.release_zombie_writer(0), RecoveryResult::Unsafe);
        assert_eq!(f.recovery.segment().slot_state(0).unwrap().writer_pid(), LIVE);
        assert_eq!(f.recovery.release_zombie_writer(2), RecoveryResult::NotStuck);
        assert_eq!(f.recovery.release_zombie_writer(4), RecoveryResult::InvalidSlot);
        assert_eq!(metric(&f, |m| &m.recovery_actions_count), 0);
    }

    #[test]
    fn test_zombie_writer_that_committed_leaves_free_slot() {
        let f = fixture(false);
        let dead = f.producer.coordinator(3).unwrap().with_pid(DEAD);
        dead.acquire_write(0).unwrap();
        dead.commit().unwrap();

        assert_eq!(f.recovery.release_zombie_writer(3), RecoveryResult::Success);
        let state = f.recovery.segment().slot_state(3).unwrap();
        assert_eq!(state.state(), Some(SlotState::Free));
        assert_eq!(state.writer_pid(), 0);
        assert_eq!(state.generation(), 1);
        assert_eq!(
            SlotRWCoordinator::new(state).acquire_read(0),
            Err(crate::error::SlotError::NotReady)
        );

        assert_eq!(f.producer.write_slot(3, b"next", 0).unwrap(), 2);
    }

    #[test]
    fn test_force_reset_refuses_live_participants() {
        let f = fixture(false);
        lock_as(&f, 0, LIVE);
        assert_eq!(f.recovery.force_reset_slot(0, false), RecoveryResult::Unsafe);
        assert_eq!(f.recovery.force_reset_slot(0, true), RecoveryResult::Success);

        let state = f.recovery.segment().slot_state(0).unwrap();
        assert_eq!(state.writer_pid(), 0);
        assert_eq!(state.state(), Some(SlotState::Free));
        assert_eq!(f.recovery.force_reset_slot(9, true), RecoveryResult::InvalidSlot);
    }

    #[test]
    fn test_force_reset_with_readers() {
        let f = fixture(false);
        f.producer.write_slot(2, b"x", 0).unwrap();
        f.producer.coordinator(2).unwrap().acquire_read(0).unwrap();

        assert_eq!(f.recovery.force_reset_slot(2, false), RecoveryResult::Unsafe);
        assert_eq!(f.recovery.force_reset_slot(2, true), RecoveryResult::Success);
        let state = f.recovery.segment().slot_state(2).unwrap();
        assert_eq!(state.readers(), 0);
        // Generation survives a reset
        assert_eq!(state.generation(), 1);
    }

    #[test]
    fn test_force_reset_all_reports_refusals() {
        let f = fixture(false);
        assert_eq!(f.recovery.force_reset_all_slots(false), RecoveryResult::Success);
        lock_as(&f, 1, LIVE);
        lock_as(&f, 2, DEAD);
        assert_eq!(f.recovery.force_reset_all_slots(false), RecoveryResult::Unsafe);
        let segment = f.recovery.segment();
        assert_eq!(segment.slot_state(1).unwrap().writer_pid(), LIVE);
        assert_eq!(segment.slot_state(2).unwrap().writer_pid(), 0);
        assert_eq!(f.recovery.force_reset_all_slots(true), RecoveryResult::Success);
    }

    #[test]
    fn test_release_zombie_readers_restores_draining_slot() {
        let f = fixture(false);
        f.producer.write_slot(0, b"keep", 0).unwrap();
        let state = f.recovery.segment().slot_state(0).unwrap();
        // A reader died inside its window, then a writer died while draining
        state.reader_count.store(2, Ordering::SeqCst);
        state.write_lock.store(DEAD, Ordering::SeqCst);
        state.set_state(SlotState::Draining, Ordering::SeqCst);
        state.writer_waiting.store(1, Ordering::SeqCst);

        assert_eq!(f.recovery.release_zombie_readers(0, false), RecoveryResult::Success);
        assert_eq!(state.readers(), 0);
        assert_eq!(state.writer_pid(), 0);
        assert!(!state.is_writer_waiting());
        assert_eq!(state.state(), Some(SlotState::Committed));
        assert_eq!(metric(&f, |m| &m.zombie_readers_released), 2);

        let (_, bytes) = crate::consumer::DataBlockConsumer::from_segment(
            f.recovery.segment().reopen().unwrap(),
        )
        .unwrap()
        .read_slot(0, 0)
        .unwrap();
        assert_eq!(&bytes[..4], b"keep");
    }

    #[test]
    fn test_release_zombie_readers_guards() {
        let f = fixture(false);
        assert_eq!(f.recovery.release_zombie_readers(1, false), RecoveryResult::NotStuck);

        f.producer.write_slot(1, b"x", 0).unwrap();
        let state = f.recovery.segment().slot_state(1).unwrap();
        state.reader_count.store(1, Ordering::SeqCst);
        state.write_lock.store(LIVE, Ordering::SeqCst);
        state.set_state(SlotState::Draining, Ordering::SeqCst);

        assert_eq!(f.recovery.release_zombie_readers(1, false), RecoveryResult::Unsafe);
        assert_eq!(f.recovery.release_zombie_readers(1, true), RecoveryResult::Success);
        // The live writer keeps its lock and finishes draining itself
        assert_eq!(state.readers(), 0);
        assert_eq!(state.writer_pid(), LIVE);
        assert_eq!(state.state(), Some(SlotState::Draining));
    }

    #[test]
    fn test_cleanup_dead_consumers() {
        let f = fixture(false);
        let header = f.recovery.segment().header();
        header.register_consumer(DEAD, 1);
        header.register_consumer(LIVE, 1);

        assert_eq!(f.recovery.cleanup_dead_consumers(), RecoveryResult::Success);
        assert_eq!(header.active_consumer_count.load(Ordering::Relaxed), 1);
        assert_eq!(metric(&f, |m| &m.dead_consumers_removed), 1);
        assert_eq!(f.recovery.cleanup_dead_consumers(), RecoveryResult::NotStuck);
    }

    #[test]
    fn test_integrity_of_healthy_segment() {
        let f = fixture(true);
        assert_eq!(f.recovery.validate_integrity(false), RecoveryResult::Success);
        f.producer.write_slot(0, b"a", 0).unwrap();
        f.producer.write_slot(3, b"b", 0).unwrap();
        f.producer.write_flexible_zone(b"zone").unwrap();
        assert_eq!(f.recovery.validate_integrity(false), RecoveryResult::Success);
        assert_eq!(metric(&f, |m| &m.checksum_failures), 0);
    }

    #[test]
    fn test_integrity_detects_and_repairs_slot_checksum() {
        let f = fixture(true);
        f.producer.write_slot(1, b"payload", 0).unwrap();
        f.producer.write_slot(2, b"other", 0).unwrap();
        let segment = f.recovery.segment();
        segment.slot_checksum(1).unwrap().store(0xDEAD);
        segment.slot_checksum(2).unwrap().invalidate();

        assert_eq!(f.recovery.validate_integrity(false), RecoveryResult::Failed);
        assert_eq!(metric(&f, |m| &m.checksum_failures), 2);

        assert_eq!(f.recovery.validate_integrity(true), RecoveryResult::Success);
        assert_eq!(f.recovery.validate_integrity(false), RecoveryResult::Success);
        assert!(metric(&f, |m| &m.recovery_actions_count) >= 1);
    }

    #[test]
    fn test_integrity_detects_flexible_zone_damage() {
        let f = fixture(true);
        f.producer.write_flexible_zone(b"zone").unwrap();
        f.producer
            .segment()
            .header()
            .flexible_zone_checksum
            .fetch_xor(1, Ordering::Relaxed);

        assert_eq!(f.recovery.validate_integrity(false), RecoveryResult::Failed);
        assert_eq!(f.recovery.validate_integrity(true), RecoveryResult::Success);
        assert_eq!(f.recovery.validate_integrity(false), RecoveryResult::Success);
    }

    #[test]
    fn test_integrity_skips_locked_slots() {
        let f = fixture(true);
        f.producer.write_slot(0, b"x", 0).unwrap();
        lock_as(&f, 0, LIVE);
        f.recovery.segment().slot_checksum(0).unwrap().store(1);
        assert_eq!(f.recovery.validate_integrity(false), RecoveryResult::Success);
    }

    #[test]
    fn test_integrity_without_checksums() {
        let f = fixture(false);
        f.producer.write_slot(0, b"x", 0).unwrap();
        assert_eq!(f.recovery.validate_integrity(true), RecoveryResult::Success);
    }

    #[test]
    fn test_live_coordinator_not_disturbed_by_diagnosis() {
        let f = fixture(false);
        let coord: SlotRWCoordinator<'_> = f.producer.coordinator(0).unwrap();
        coord.acquire_write(0).unwrap();
        let diag = f.recovery.diagnose_slot(0).unwrap();
        assert!(!diag.is_stuck);
        assert_eq!(diag.write_lock, get_current_pid());
        coord.release_write().unwrap();
        assert_eq!(f.recovery.diagnose_all_slots().len(), 4);
    }

    #[test]
    fn test_result_names() {
        assert_eq!(RecoveryResult::NotStuck.name(), "NOT_STUCK");
        assert!(RecoveryResult::NotStuck.is_ok());
        assert!(!RecoveryResult::Unsafe.is_ok());
        assert_eq!(RecoveryResult::InvalidSlot as i32, 4);
    }
}
