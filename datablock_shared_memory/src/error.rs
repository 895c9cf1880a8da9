//! Error types for DataBlock shared memory operations

use thiserror::Error;

/// Outcome of a slot protocol operation that did not succeed.
///
/// Every variant is a normal, returnable condition. Contention variants
/// (`Timeout`, `NotReady`, `Locked`) are retriable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// Lock never freed or readers never drained within the timeout
    #[error("slot operation timed out")]
    Timeout,

    /// Slot not committed yet, or readers present on a non-blocking write
    #[error("slot not ready")]
    NotReady,

    /// Another writer holds the slot
    #[error("slot locked by another writer")]
    Locked,

    /// Unrecognized slot tag or unusable caller context
    #[error("slot protocol error")]
    Error,

    /// Slot tag inconsistent with the requested transition
    #[error("slot in unexpected state")]
    InvalidState,
}

/// Errors that can occur while mapping, inspecting or repairing a segment
#[derive(Error, Debug)]
pub enum DataBlockError {
    /// Segment already exists
    #[error("Segment already exists: {name}")]
    AlreadyExists {
        /// Segment name
        name: String,
    },

    /// Segment not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Layout parameters rejected
    #[error("Invalid segment layout: {reason}")]
    InvalidLayout {
        /// Why the layout was rejected
        reason: String,
    },

    /// Slot index outside the ring
    #[error("Invalid slot index {index} (capacity {capacity})")]
    InvalidSlot {
        /// Requested index
        index: usize,
        /// Ring capacity
        capacity: usize,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Header fails magic, version or layout checks
    #[error("Segment corrupted: {reason}")]
    Corrupted {
        /// What failed
        reason: String,
    },

    /// Slot generation changed while the payload was being copied
    #[error("Version conflict on slot {index} - retry recommended")]
    VersionConflict {
        /// Slot index
        index: usize,
    },

    /// Stored checksum does not match the payload
    #[error("Checksum mismatch on slot {index}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Slot index
        index: usize,
        /// Checksum in the table
        stored: u32,
        /// Checksum of the current payload
        computed: u32,
    },

    /// All heartbeat entries are taken
    #[error("Consumer heartbeat table full")]
    HeartbeatTableFull,

    /// Slot protocol refused the operation
    #[error("Slot protocol: {source}")]
    Slot {
        /// Protocol outcome
        #[from]
        source: SlotError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl DataBlockError {
    /// Integer code used by the C entry points.
    ///
    /// `-1` invalid arguments, `-2` internal/open error, `-3` invalid index,
    /// `-4` runtime error. `-5` (unexpected) is produced by the FFI layer
    /// itself when a panic is caught.
    pub fn ffi_code(&self) -> i32 {
        match self {
            DataBlockError::InvalidArgument(_) => -1,
            DataBlockError::AlreadyExists { .. }
            | DataBlockError::NotFound { .. }
            | DataBlockError::InvalidLayout { .. }
            | DataBlockError::Corrupted { .. }
            | DataBlockError::Io { .. }
            | DataBlockError::Nix { .. } => -2,
            DataBlockError::InvalidSlot { .. } => -3,
            DataBlockError::VersionConflict { .. }
            | DataBlockError::ChecksumMismatch { .. }
            | DataBlockError::HeartbeatTableFull
            | DataBlockError::Slot { .. } => -4,
        }
    }
}

/// Result type for DataBlock operations
pub type DataBlockResult<T> = Result<T, DataBlockError>;
