//! Linux-specific shared memory operations

use crate::error::DataBlockResult;
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Create a new backing file of `size` bytes and map it.
///
/// Fails with `AlreadyExists` if the file is present. The kernel zero-fills
/// the extended file, which is the initial state of every slot.
pub fn create_segment_mmap(path: &Path, size: usize) -> DataBlockResult<MmapMut> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)?;

    file.set_len(size as u64)?;

    // Pre-fault pages so the first protocol operation does not take a page fault
    let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
    Ok(mmap)
}

/// Attach to an existing backing file
pub fn attach_segment_mmap(path: &Path) -> DataBlockResult<MmapMut> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u64) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // Null signal tests for existence without delivering anything
    match kill(Pid::from_raw(raw), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Exists, owned by someone else
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u64 {
    getpid().as_raw() as u64
}

/// Wall-clock nanoseconds since the Unix epoch.
///
/// Wall-clock time is used for every shared timestamp because it is the only
/// clock all processes agree on and it is comparable with process start
/// times.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Start time of `pid` as wall-clock nanoseconds since the Unix epoch.
///
/// Returns `None` when the process does not exist or `/proc` is unavailable.
#[cfg(target_os = "linux")]
pub fn process_start_time_ns(pid: u64) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;

    // comm (field 2) may contain spaces and parentheses; fields after the
    // last ')' start at field 3
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let start_ticks: u64 = after_comm.split_whitespace().nth(19)?.parse().ok()?;

    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }

    let boot_secs = boot_time_secs()?;
    let since_boot_ns = start_ticks.checked_mul(1_000_000_000)? / ticks_per_sec as u64;
    boot_secs
        .checked_mul(1_000_000_000)?
        .checked_add(since_boot_ns)
}

/// Start time lookup is unavailable on this platform
#[cfg(not(target_os = "linux"))]
pub fn process_start_time_ns(_pid: u64) -> Option<u64> {
    None
}

/// Kernel boot time from the `btime` line of `/proc/stat`
#[cfg(target_os = "linux")]
fn boot_time_secs() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
}
