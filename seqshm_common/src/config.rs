//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for the seqshm daemon and client tools.
//!
//! # Usage
//!
//! ```rust,no_run
//! use seqshm_common::config::{ConfigError, ConfigLoader, DaemonConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = DaemonConfig::load(Path::new("seqshm.toml"))?;
//!     config.validate()?;
//!     println!("Region: {}", config.region.name);
//!     Ok(())
//! }
//! ```

use crate::consts::{DEFAULT_REGION_NAME, SHM_MAX_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
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

/// Common configuration fields shared by every seqshm process.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "seqshm-daemon"
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
            service_name: "seqshm".to_string(),
        }
    }
}

/// Region parameters used by the owning process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Logical name the region is published under.
    #[serde(default = "default_region_name")]
    pub name: String,

    /// Backing-store size in bytes. `None` uses the smallest page-rounded
    /// size the layout fits in.
    #[serde(default)]
    pub size: Option<usize>,

    /// Lock the mapping into physical memory after creation.
    #[serde(default = "default_true")]
    pub pin: bool,

    /// Period of the daemon's status log line.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

fn default_region_name() -> String {
    DEFAULT_REGION_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_status_interval_ms() -> u64 {
    5000
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: default_region_name(),
            size: None,
            pin: true,
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

impl RegionConfig {
    /// Validate region parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "region name cannot be empty".to_string(),
            ));
        }
        if self.name.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "region name '{}' must not contain '/'",
                self.name
            )));
        }
        if let Some(size) = self.size {
            if size == 0 || size > SHM_MAX_SIZE {
                return Err(ConfigError::ValidationError(format!(
                    "region size {size} outside 1..={SHM_MAX_SIZE}"
                )));
            }
        }
        if self.status_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "status_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Busy-wait policy used while the RT bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Target-selected default.
    #[default]
    Platform,
    /// CPU relax hint only.
    Spin,
    /// Yield the thread to the scheduler on every attempt.
    Yield,
    /// Spin with doubling hint counts, then yield.
    Exponential,
}

/// Backoff policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Policy kind.
    #[serde(default)]
    pub kind: BackoffKind,

    /// Upper bound on relax hints per snooze for the exponential policy.
    #[serde(default = "default_spin_limit")]
    pub spin_limit: u32,
}

fn default_spin_limit() -> u32 {
    64
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Platform,
            spin_limit: default_spin_limit(),
        }
    }
}

/// Complete configuration of the owning daemon.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "seqshm-daemon"
///
/// [region]
/// name = "vendor.seqshm"
/// pin = true
///
/// [backoff]
/// kind = "yield"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Common fields.
    #[serde(default)]
    pub shared: SharedConfig,

    /// Region parameters.
    #[serde(default)]
    pub region: RegionConfig,

    /// Reader / non-RT writer backoff policy.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl DaemonConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.region.validate()?;
        if self.backoff.spin_limit == 0 {
            return Err(ConfigError::ValidationError(
                "backoff.spin_limit must be > 0".to_string(),
            ));
        }
        Ok(())
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
