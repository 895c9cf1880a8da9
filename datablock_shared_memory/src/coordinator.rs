//! Slot read/write coordination protocol.
//!
//! A writer drives a slot through `acquire_write -> (payload write) -> commit
//! -> release_write`; a reader through `acquire_read -> (payload read) ->
//! validate_read -> release_read`. The only synchronization is atomics on the
//! [`SlotRWState`], so the same state block can be shared by unrelated
//! processes.
//!
//! Writer and reader meet in a Dekker handshake: the writer publishes
//! WRITING and then reads `reader_count`; the reader increments
//! `reader_count` and then re-reads the tag. Both sides use `SeqCst` so at
//! least one of them observes the other.

use crate::error::SlotError;
use crate::header::{MetricsBlock, SharedMemoryHeader};
use crate::platform::{get_current_pid, now_ns};
use crate::slot::{SlotRWState, SlotState};
use datablock_common::consts::{POLL_SLEEP_US, POLL_SPIN_ITERATIONS, POLL_YIELD_ITERATIONS};
use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// C-compatible outcome of an acquire, commit or release call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SlotAcquireResult {
    /// Operation succeeded
    Ok = 0,
    /// Lock never freed or readers never drained in time
    Timeout = 1,
    /// Slot not committed, or readers present on a non-blocking write
    NotReady = 2,
    /// Another writer holds the slot
    Locked = 3,
    /// Protocol error
    Error = 4,
    /// Slot tag inconsistent with the requested transition
    InvalidState = 5,
}

impl From<SlotError> for SlotAcquireResult {
    fn from(err: SlotError) -> Self {
        match err {
            SlotError::Timeout => Self::Timeout,
            SlotError::NotReady => Self::NotReady,
            SlotError::Locked => Self::Locked,
            SlotError::Error => Self::Error,
            SlotError::InvalidState => Self::InvalidState,
        }
    }
}

impl<T> From<Result<T, SlotError>> for SlotAcquireResult {
    fn from(result: Result<T, SlotError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => err.into(),
        }
    }
}

/// Escalating wait used while polling shared state: spin, then yield, then
/// short sleeps.
#[derive(Debug, Default)]
pub struct PollBackoff {
    iteration: u32,
}

impl PollBackoff {
    /// Fresh backoff starting in the spin phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait one step.
    pub fn wait(&mut self) {
        if self.iteration < POLL_SPIN_ITERATIONS {
            std::hint::spin_loop();
        } else if self.iteration < POLL_SPIN_ITERATIONS + POLL_YIELD_ITERATIONS {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(POLL_SLEEP_US));
        }
        self.iteration = self.iteration.saturating_add(1);
    }
}

/// Timeout in the `timeout_ms` convention: 0 non-blocking, negative
/// infinite, positive bounded.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn new(timeout_ms: i32) -> Self {
        Self {
            started: Instant::now(),
            limit: u64::try_from(timeout_ms).ok().map(Duration::from_millis),
        }
    }

    fn expired(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Protocol operations on one slot.
///
/// Borrowing the state and the optional header ties the coordinator to the
/// mapping that contains them. The lock token is the caller's PID.
#[derive(Debug, Clone, Copy)]
pub struct SlotRWCoordinator<'a> {
    state: &'a SlotRWState,
    header: Option<&'a SharedMemoryHeader>,
    pid: u64,
}

impl<'a> SlotRWCoordinator<'a> {
    /// Coordinator without metrics bookkeeping.
    pub fn new(state: &'a SlotRWState) -> Self {
        Self {
            state,
            header: None,
            pid: get_current_pid(),
        }
    }

    /// Coordinator that maintains `commit_index` and the metrics block of
    /// `header`.
    pub fn with_header(state: &'a SlotRWState, header: &'a SharedMemoryHeader) -> Self {
        Self {
            state,
            header: Some(header),
            pid: get_current_pid(),
        }
    }

    /// Use `pid` as the lock token instead of the current process ID.
    pub fn with_pid(mut self, pid: u64) -> Self {
        self.pid = pid;
        self
    }

    /// The slot this coordinator operates on.
    pub fn state(&self) -> &'a SlotRWState {
        self.state
    }

    /// Lock token used by this coordinator.
    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Take the write lock.
    ///
    /// If readers are inside the slot the lock is held in DRAINING until they
    /// leave. On any failure after the lock was taken the previous tag is
    /// restored and the lock released, so a failed call leaves no trace in
    /// the slot. If recovery takes the lock away while draining the call
    /// returns [`SlotError::Error`] and leaves the slot as recovery set it.
    pub fn acquire_write(&self, timeout_ms: i32) -> Result<(), SlotError> {
        let state = self.state;
        if self.pid == 0 {
            return Err(self.fail_acquire(SlotError::Error));
        }

        let deadline = Deadline::new(timeout_ms);
        let mut backoff = PollBackoff::new();
        let mut contended = false;

        while let Err(holder) =
            state
                .write_lock
                .compare_exchange(0, self.pid, Ordering::Acquire, Ordering::Relaxed)
        {
            if !contended {
                contended = true;
                self.bump(|m| &m.write_lock_contention);
                debug!(holder, pid = self.pid, "write lock contended");
            }
            if timeout_ms == 0 {
                return Err(SlotError::Locked);
            }
            if deadline.expired() {
                self.add_blocked(&deadline);
                self.bump(|m| &m.writer_lock_timeout_count);
                return Err(self.fail_timeout(|m| &m.writer_timeout_count));
            }
            backoff.wait();
        }

        let previous = match state.state() {
            Some(tag) if !tag.is_write_held() => tag,
            Some(_) => {
                // Lock was free yet the tag claims a writer; leave it for recovery
                self.unlock();
                return Err(self.fail_acquire(SlotError::InvalidState));
            }
            None => {
                self.unlock();
                return Err(self.fail_acquire(SlotError::Error));
            }
        };

        state.lock_acquired_at_ns.store(now_ns(), Ordering::Relaxed);
        state
            .acquired_generation
            .store(state.write_generation.load(Ordering::Relaxed), Ordering::Relaxed);

        state.set_state(SlotState::Writing, Ordering::SeqCst);
        if state.reader_count.load(Ordering::SeqCst) == 0 {
            if contended {
                self.add_blocked(&deadline);
            }
            return Ok(());
        }

        state.set_state(SlotState::Draining, Ordering::SeqCst);
        state.writer_waiting.store(1, Ordering::SeqCst);
        self.bump(|m| &m.writer_drain_count);

        if timeout_ms == 0 {
            self.abort_write(previous);
            return Err(SlotError::NotReady);
        }

        loop {
            backoff.wait();
            if state.writer_pid() != self.pid {
                return Err(self.lost_lock());
            }
            if state.reader_count.load(Ordering::SeqCst) == 0 {
                // A recovery reset may have retagged the slot; only our own DRAINING is promoted
                let promoted = state
                    .slot_state
                    .compare_exchange(
                        SlotState::Draining as u8,
                        SlotState::Writing as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if !promoted || state.writer_pid() != self.pid {
                    return Err(self.lost_lock());
                }
                state.writer_waiting.store(0, Ordering::Relaxed);
                self.add_blocked(&deadline);
                return Ok(());
            }
            if deadline.expired() {
                self.abort_write(previous);
                self.add_blocked(&deadline);
                self.bump(|m| &m.writer_reader_timeout_count);
                debug!(
                    readers = state.readers(),
                    pid = self.pid,
                    "readers did not drain before timeout"
                );
                return Err(self.fail_timeout(|m| &m.writer_timeout_count));
            }
        }
    }

    /// Publish the payload written during this tenure.
    ///
    /// Returns the new generation. The tag stays WRITING until
    /// [`release_write`](Self::release_write).
    pub fn commit(&self) -> Result<u64, SlotError> {
        let state = self.state;
        if state.writer_pid() != self.pid || state.state() != Some(SlotState::Writing) {
            self.bump(|m| &m.slot_commit_errors);
            self.record(SlotError::InvalidState);
            return Err(SlotError::InvalidState);
        }

        let generation = state.write_generation.fetch_add(1, Ordering::Release) + 1;
        if let Some(header) = self.header {
            header.commit_index.fetch_add(1, Ordering::Release);
            MetricsBlock::bump(&header.metrics.total_slots_written);
        }
        Ok(generation)
    }

    /// Drop the write lock.
    ///
    /// The slot becomes COMMITTED if a commit happened during this tenure and
    /// FREE otherwise.
    pub fn release_write(&self) -> Result<(), SlotError> {
        let state = self.state;
        let holder = state.writer_pid();
        let refused = if holder == 0 {
            Some(SlotError::InvalidState)
        } else if holder != self.pid {
            Some(SlotError::Locked)
        } else {
            None
        };
        if let Some(err) = refused {
            self.bump(|m| &m.slot_release_errors);
            self.record(err);
            return Err(err);
        }

        let committed = state.write_generation.load(Ordering::Relaxed)
            != state.acquired_generation.load(Ordering::Relaxed);
        state.writer_waiting.store(0, Ordering::Relaxed);
        state.set_state(
            if committed {
                SlotState::Committed
            } else {
                SlotState::Free
            },
            Ordering::Release,
        );
        self.unlock();
        Ok(())
    }

    /// Enter the read window of a committed slot.
    ///
    /// Returns the generation the payload belongs to.
    pub fn acquire_read(&self, timeout_ms: i32) -> Result<u64, SlotError> {
        let state = self.state;
        let deadline = Deadline::new(timeout_ms);
        let mut backoff = PollBackoff::new();

        loop {
            match state.state() {
                Some(SlotState::Committed) => {
                    let count = state.reader_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if state.slot_state.load(Ordering::SeqCst) == SlotState::Committed as u8 {
                        if let Some(header) = self.header {
                            header
                                .metrics
                                .reader_peak_count
                                .fetch_max(u64::from(count), Ordering::Relaxed);
                        }
                        return Ok(state.write_generation.load(Ordering::Acquire));
                    }
                    // A writer claimed the slot between our two loads. Recovery may
                    // have zeroed the count meanwhile, so never wrap.
                    let _ = state.reader_count.fetch_update(
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        |count| count.checked_sub(1),
                    );
                    self.bump(|m| &m.reader_race_detected);
                }
                Some(_) => {}
                None => return Err(self.fail_acquire(SlotError::Error)),
            }

            if timeout_ms == 0 {
                self.bump(|m| &m.reader_not_ready_count);
                return Err(SlotError::NotReady);
            }
            if deadline.expired() {
                return Err(self.fail_timeout(|m| &m.reader_timeout_count));
            }
            backoff.wait();
        }
    }

    /// Whether the payload still belongs to `generation`.
    pub fn validate_read(&self, generation: u64) -> bool {
        fence(Ordering::Acquire);
        let valid = self.state.write_generation.load(Ordering::Acquire) == generation;
        if valid {
            self.bump(|m| &m.total_slots_read);
        } else {
            self.bump(|m| &m.reader_validation_failed);
        }
        valid
    }

    /// Leave the read window.
    pub fn release_read(&self) -> Result<(), SlotError> {
        let released = self.state.reader_count.fetch_update(
            Ordering::Release,
            Ordering::Relaxed,
            |count| count.checked_sub(1),
        );
        if released.is_err() {
            self.bump(|m| &m.slot_release_errors);
            self.record(SlotError::InvalidState);
            return Err(SlotError::InvalidState);
        }
        Ok(())
    }

    fn abort_write(&self, previous: SlotState) {
        self.state.writer_waiting.store(0, Ordering::Relaxed);
        self.state.set_state(previous, Ordering::Release);
        self.unlock();
    }

    /// The lock was taken over by recovery while draining. The slot now
    /// belongs to whoever reset it, so nothing is restored.
    fn lost_lock(&self) -> SlotError {
        warn!(
            pid = self.pid,
            holder = self.state.writer_pid(),
            state = ?self.state.state(),
            "write lock lost while draining readers"
        );
        self.fail_acquire(SlotError::Error)
    }

    fn unlock(&self) {
        self.state.lock_acquired_at_ns.store(0, Ordering::Relaxed);
        self.state.write_lock.store(0, Ordering::Release);
    }

    fn metrics(&self) -> Option<&'a MetricsBlock> {
        self.header.map(|header| &header.metrics)
    }

    fn bump(&self, counter: impl FnOnce(&'a MetricsBlock) -> &'a std::sync::atomic::AtomicU64) {
        if let Some(metrics) = self.metrics() {
            MetricsBlock::bump(counter(metrics));
        }
    }

    fn add_blocked(&self, deadline: &Deadline) {
        if let Some(metrics) = self.metrics() {
            metrics
                .writer_blocked_total_ns
                .fetch_add(deadline.elapsed_ns(), Ordering::Relaxed);
        }
    }

    fn record(&self, err: SlotError) {
        if let Some(header) = self.header {
            header.record_error(SlotAcquireResult::from(err) as u64);
        }
    }

    fn fail_acquire(&self, err: SlotError) -> SlotError {
        self.bump(|m| &m.slot_acquire_errors);
        self.record(err);
        err
    }

    fn fail_timeout(
        &self,
        counter: impl FnOnce(&'a MetricsBlock) -> &'a std::sync::atomic::AtomicU64,
    ) -> SlotError {
        self.bump(counter);
        self.record(SlotError::Timeout);
        SlotError::Timeout
    }
}
