//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across DataBlock tooling.
//!
//! # Usage
//!
//! ```rust,no_run
//! use datablock_common::config::{AdminConfig, ConfigLoader, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = AdminConfig::load(Path::new("datablock-admin.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{DEFAULT_SHM_DIR, SHM_DIR_ENV};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared across DataBlock applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "datablock-admin"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: "datablock-admin".to_string(),
        }
    }
}

/// Settings for the administrative tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// Directory holding segment backing files. Falls back to
    /// [`resolve_shm_dir`] when absent.
    pub shm_dir: Option<PathBuf>,

    /// Whether `--force` overrides are honored at all.
    pub allow_force: bool,

    /// Write locks held longer than this by a live process are flagged by
    /// `diagnose` even though they are not zombies.
    pub long_held_warn_ms: u64,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            shm_dir: None,
            allow_force: true,
            long_held_warn_ms: 5_000,
        }
    }
}

/// Configuration file consumed by `datablock-admin --config`.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "datablock-admin"
///
/// [admin]
/// allow_force = false
/// long_held_warn_ms = 2000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Common fields.
    #[serde(default)]
    pub shared: SharedConfig,

    /// Tool-specific settings.
    #[serde(default)]
    pub admin: AdminSettings,
}

impl AdminConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        if let Some(dir) = &self.admin.shm_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "admin.shm_dir cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Resolve the directory holding segment backing files.
///
/// Precedence: explicit argument, then the `DATABLOCK_SHM_DIR` environment
/// variable, then `/dev/shm` if it exists, then the system temp directory.
pub fn resolve_shm_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os(SHM_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let default = Path::new(DEFAULT_SHM_DIR);
    if default.is_dir() {
        default.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        for (text, level) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let parsed: TestWrapper = toml::from_str(&format!("level = \"{text}\"")).unwrap();
            assert_eq!(parsed.level, level);
            assert_eq!(level.as_directive(), text);
        }
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = AdminConfig::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = AdminConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_admin_config_defaults_when_sections_missing() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "").unwrap();
        file.flush().unwrap();

        let config = AdminConfig::load(file.path()).unwrap();
        assert!(config.admin.allow_force);
        assert_eq!(config.admin.long_held_warn_ms, 5_000);
        assert!(config.admin.shm_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_admin_config_success() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[shared]
log_level = "debug"
service_name = "ops-console"

[admin]
shm_dir = "/tmp/blocks"
allow_force = false
long_held_warn_ms = 250
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = AdminConfig::load(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.shared.service_name, "ops-console");
        assert_eq!(config.admin.shm_dir, Some(PathBuf::from("/tmp/blocks")));
        assert!(!config.admin.allow_force);
        assert_eq!(config.admin.long_held_warn_ms, 250);
    }

    #[test]
    fn test_admin_config_rejects_empty_shm_dir() {
        let mut config = AdminConfig::default();
        config.admin.shm_dir = Some(PathBuf::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_resolve_shm_dir_prefers_explicit() {
        let dir = Path::new("/some/explicit/dir");
        assert_eq!(resolve_shm_dir(Some(dir)), PathBuf::from(dir));
    }
}
