//! Process-liveness oracle
//!
//! Recovery and diagnostics never ask the OS directly; they go through a
//! [`ProcessLiveness`] so tests can substitute a fake.

use crate::platform;
use datablock_common::consts::PID_REUSE_TOLERANCE_NS;

/// Answers whether a PID still refers to a running process.
pub trait ProcessLiveness: Send + Sync {
    /// Whether `pid` is alive.
    fn is_alive(&self, pid: u64) -> bool;

    /// Wall-clock start time of `pid`, if the platform can tell.
    fn start_time_ns(&self, _pid: u64) -> Option<u64> {
        None
    }
}

/// Liveness backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessLiveness;

impl ProcessLiveness for OsProcessLiveness {
    fn is_alive(&self, pid: u64) -> bool {
        platform::is_process_alive(pid)
    }

    fn start_time_ns(&self, pid: u64) -> Option<u64> {
        platform::process_start_time_ns(pid)
    }
}

impl<L: ProcessLiveness + ?Sized> ProcessLiveness for &L {
    fn is_alive(&self, pid: u64) -> bool {
        (**self).is_alive(pid)
    }

    fn start_time_ns(&self, pid: u64) -> Option<u64> {
        (**self).start_time_ns(pid)
    }
}

/// Whether the process that took a write lock at `acquired_at_ns` is still
/// running.
///
/// A PID that is alive but whose process started after the lock was taken
/// has been reused by the OS, so the original holder is gone. Without a
/// start time or an acquisition stamp only the PID is checked.
pub fn is_lock_holder_alive<L: ProcessLiveness + ?Sized>(
    oracle: &L,
    pid: u64,
    acquired_at_ns: u64,
) -> bool {
    if pid == 0 || !oracle.is_alive(pid) {
        return false;
    }
    if acquired_at_ns == 0 {
        return true;
    }
    match oracle.start_time_ns(pid) {
        Some(started) => started <= acquired_at_ns.saturating_add(PID_REUSE_TOLERANCE_NS),
        None => true,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ProcessLiveness;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Liveness table driven by the test.
    #[derive(Default)]
    pub struct FakeLiveness {
        alive: Mutex<HashMap<u64, Option<u64>>>,
    }

    impl FakeLiveness {
        pub fn with_alive(pids: &[u64]) -> Self {
            let fake = Self::default();
            for &pid in pids {
                fake.set_alive(pid, None);
            }
            fake
        }

        pub fn set_alive(&self, pid: u64, started_at_ns: Option<u64>) {
            self.alive.lock().unwrap().insert(pid, started_at_ns);
        }

        pub fn kill(&self, pid: u64) {
            self.alive.lock().unwrap().remove(&pid);
        }
    }

    impl ProcessLiveness for FakeLiveness {
        fn is_alive(&self, pid: u64) -> bool {
            self.alive.lock().unwrap().contains_key(&pid)
        }

        fn start_time_ns(&self, pid: u64) -> Option<u64> {
            self.alive.lock().unwrap().get(&pid).copied().flatten()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLiveness;
    use super::*;

    #[test]
    fn test_os_liveness_sees_current_process() {
        let oracle = OsProcessLiveness;
        assert!(oracle.is_alive(platform::get_current_pid()));
        assert!(!oracle.is_alive(0));
    }

    #[test]
    fn test_dead_pid_is_not_holder() {
        let oracle = FakeLiveness::with_alive(&[10]);
        assert!(is_lock_holder_alive(&oracle, 10, 0));
        oracle.kill(10);
        assert!(!is_lock_holder_alive(&oracle, 10, 0));
        assert!(!is_lock_holder_alive(&oracle, 0, 0));
    }

    #[test]
    fn test_reused_pid_is_not_holder() {
        let oracle = FakeLiveness::default();
        let acquired = 100 * 1_000_000_000;
        oracle.set_alive(42, Some(acquired + PID_REUSE_TOLERANCE_NS + 1));
        assert!(!is_lock_holder_alive(&oracle, 42, acquired));

        // Started before the lock was taken: the original holder
        oracle.set_alive(42, Some(acquired - 5));
        assert!(is_lock_holder_alive(&oracle, 42, acquired));

        // Within tolerance of the coarse boot timestamp
        oracle.set_alive(42, Some(acquired + PID_REUSE_TOLERANCE_NS / 2));
        assert!(is_lock_holder_alive(&oracle, 42, acquired));
    }

    #[test]
    fn test_current_process_holds_its_own_locks() {
        let pid = platform::get_current_pid();
        assert!(is_lock_holder_alive(&OsProcessLiveness, pid, platform::now_ns()));
    }
}
