//! Prelude module for common re-exports.
//!
//! ```rust
//! use datablock_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    AdminConfig, AdminSettings, ConfigError, ConfigLoader, LogLevel, SharedConfig,
    resolve_shm_dir,
};

// ─── Layout Constants ───────────────────────────────────────────────
pub use crate::consts::{
    CACHE_LINE_SIZE, DATABLOCK_MAGIC, DATABLOCK_VERSION_MAJOR, DATABLOCK_VERSION_MINOR,
    DEFAULT_PAGE_SIZE, MAX_CONSUMER_HEARTBEATS, MAX_RING_CAPACITY,
};

// ─── Layout Hashing ─────────────────────────────────────────────────
pub use crate::layout::{LayoutHasher, region_checksum, struct_version_hash};
