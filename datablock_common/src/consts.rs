//! DataBlock shared memory constants.
//!
//! These constants define the fundamental parameters of the DataBlock shared
//! memory layout and slot protocol. They are the single source of truth - all
//! other crates should import from here.

/// Magic number stored at offset 0 of every DataBlock segment: `"DBLKSHM\0"`.
pub const DATABLOCK_MAGIC: u64 = u64::from_le_bytes(*b"DBLKSHM\0");

/// Header layout major version. A mismatch is fatal: the segment cannot be
/// interpreted by this build.
pub const DATABLOCK_VERSION_MAJOR: u16 = 1;

/// Header layout minor version. Minor bumps only append fields.
pub const DATABLOCK_VERSION_MINOR: u16 = 1;

/// Header flag: per-slot and flexible-zone checksums are maintained.
pub const HEADER_FLAG_CHECKSUMS: u32 = 1 << 0;

/// File name prefix for DataBlock segments inside the shm directory.
pub const SHM_PREFIX: &str = "datablock_";

/// Default directory holding the segment backing files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Environment variable overriding [`DEFAULT_SHM_DIR`].
pub const SHM_DIR_ENV: &str = "DATABLOCK_SHM_DIR";

/// Maximum mapped segment size in bytes (1GB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// Default physical page size used to round up the segment size.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Maximum number of ring-buffer slots per segment.
pub const MAX_RING_CAPACITY: u32 = 65_536;

/// Number of entries in the consumer heartbeat table.
pub const MAX_CONSUMER_HEARTBEATS: usize = 8;

/// CPU cache line size in bytes.
///
/// Every shared region starts on a cache-line boundary to prevent false
/// sharing between slots written by different processes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Busy-spin iterations before a polling operation starts yielding.
pub const POLL_SPIN_ITERATIONS: u32 = 64;

/// Yield iterations before a polling operation starts sleeping.
pub const POLL_YIELD_ITERATIONS: u32 = 64;

/// Sleep interval of a polling operation once spinning and yielding are
/// exhausted, in microseconds.
pub const POLL_SLEEP_US: u64 = 50;

/// Tolerance applied when comparing a process start time with a lock
/// acquisition stamp. Covers the one-second granularity of the kernel boot
/// timestamp.
pub const PID_REUSE_TOLERANCE_NS: u64 = 2_000_000_000;
