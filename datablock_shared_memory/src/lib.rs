//! # DataBlock Shared Memory Slot Coordination
//!
//! Cross-process coordination for ring buffers of fixed-size slots living in
//! a file-backed shared memory segment. Any number of processes attach to the
//! same segment; each slot carries a 64-byte [`SlotRWState`] that arbitrates
//! one writer against many readers without any kernel locks.
//!
//! ## Segment Layout
//!
//! ```text
//! ┌──────────────────────┐
//! │ SharedMemoryHeader    │  magic, version, layout checksum, commit index,
//! │                       │  consumer heartbeats, metrics block
//! ├──────────────────────┤
//! │ SlotRWState[capacity] │  one cache line per slot
//! ├──────────────────────┤
//! │ checksum table        │  optional, one entry per slot
//! ├──────────────────────┤
//! │ flexible zone         │  optional, producer-owned
//! ├──────────────────────┤
//! │ payload units         │  page-aligned, `logical_unit_size` each
//! └──────────────────────┘
//! ```
//!
//! ## Slot Protocol
//!
//! - **Writers** take `write_lock` with a CAS carrying their PID, publish
//!   `WRITING` (or `DRAINING` over committed data) and wait for readers to
//!   leave before touching the payload.
//! - **Commit** bumps `write_generation`; `release_write` then publishes the
//!   slot as `COMMITTED`.
//! - **Readers** register in `reader_count`, re-check the state, capture the
//!   generation and validate it again after copying.
//!
//! The writer's store of the state and the reader's increment of the count
//! are both sequentially consistent, so a writer never misses a reader that
//! saw a committed slot.
//!
//! ## Usage
//!
//! ```rust
//! use datablock_shared_memory::{DataBlockConsumer, DataBlockLayout, DataBlockProducer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let layout = DataBlockLayout::new(8, 64).checksums(true);
//! let producer = DataBlockProducer::create_in(dir.path(), "doc_sensor", layout)?;
//! producer.write_slot(0, b"temperature: 25.5", 100)?;
//!
//! let consumer = DataBlockConsumer::attach_in(dir.path(), "doc_sensor")?;
//! let (generation, bytes) = consumer.read_slot(0, 100)?;
//! assert_eq!(generation, 1);
//! assert_eq!(&bytes[..17], b"temperature: 25.5");
//! consumer.verify_checksum_slot(0)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Recovery
//!
//! A process that dies inside a write leaves its PID in `write_lock`. The
//! [`DataBlockRecovery`] handle diagnoses such slots and releases them once
//! the holder is confirmed dead:
//!
//! ```rust,no_run
//! use datablock_shared_memory::{DataBlockRecovery, RecoveryResult};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let recovery = DataBlockRecovery::open("sensor_ring")?;
//! for diag in recovery.diagnose_all_slots().iter().filter(|d| d.is_stuck) {
//!     let result = recovery.release_zombie_writer(diag.slot_index as usize);
//!     println!("slot {}: {}", diag.slot_index, result.name());
//! }
//! if recovery.cleanup_dead_consumers() == RecoveryResult::Success {
//!     println!("removed dead consumer heartbeats");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## C ABI
//!
//! The [`ffi`] module exports `slot_rw_*` protocol entry points and
//! `datablock_*` administration entry points. The crate also builds as a
//! `cdylib` for non-Rust participants.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod consumer;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod ffi;
pub mod header;
pub mod liveness;
pub mod metrics;
pub mod platform;
pub mod producer;
pub mod recovery;
pub mod segment;
pub mod slot;

pub use consumer::DataBlockConsumer;
pub use coordinator::{PollBackoff, SlotAcquireResult, SlotRWCoordinator};
pub use diagnostics::{SlotDiagnostic, diagnose_all_slots, diagnose_slot};
pub use error::{DataBlockError, DataBlockResult, SlotError};
pub use header::{ConsumerHeartbeat, MetricsBlock, SharedMemoryHeader};
pub use liveness::{OsProcessLiveness, ProcessLiveness, is_lock_holder_alive};
pub use metrics::{DataBlockMetrics, get_metrics, reset_metrics};
pub use producer::DataBlockProducer;
pub use recovery::{DataBlockRecovery, RecoveryResult};
pub use segment::{DataBlockLayout, DataBlockSegment};
pub use slot::{SlotChecksum, SlotRWState, SlotState};

/// Initialize tracing for tools embedding the library
///
/// Honors `RUST_LOG`. A second call is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
