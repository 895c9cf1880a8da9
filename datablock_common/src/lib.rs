//! DataBlock Common Library
//!
//! This crate provides shared constants and configuration loading utilities
//! for all DataBlock workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Shared memory layout constants and protocol tunables
//! - [`config`] - Configuration loading traits and types
//! - [`layout`] - Layout hashing helpers for cross-process compatibility checks
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use datablock_common::consts::*;
//! use datablock_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
pub mod layout;
pub mod prelude;
