// SPDX-License-Identifier: GPL-3.0-only

//! Runtime configuration
//!
//! Values come from built-in defaults, optionally overridden by a TOML file.
//! The CLI applies its own flags on top of the loaded value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SysError};

/// Environment variable naming an alternative configuration file
pub const CONFIG_ENV: &str = "PARTITION_HANDLER_CONFIG";

/// Configuration file read when neither `--config` nor [`CONFIG_ENV`] is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/partition-handler.toml";

/// Bounded retry used while waiting for udev/devtmpfs to materialize device nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 16,
            delay_ms: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Filesystem type passed to mount(2)
    pub fs_type: String,

    /// Ask the kernel to scan the image for partitions on association
    pub partition_scan: bool,

    /// Mount with MS_RDONLY
    pub read_only: bool,

    /// Filesystem-specific data string (e.g. "errors=remount-ro")
    pub mount_options: Option<String>,

    /// Mount table consulted by every probe
    pub mount_table: PathBuf,

    /// Permission bits for mount point directories created on demand
    pub dir_mode: u32,

    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fs_type: "ext2".to_string(),
            partition_scan: true,
            read_only: false,
            mount_options: None,
            mount_table: PathBuf::from("/proc/self/mounts"),
            dir_mode: 0o755,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(input: &str, origin: &Path) -> Result<Self> {
        let config: Config = toml::from_str(input).map_err(|e| SysError::Config {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate(origin)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SysError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content, path)
    }

    /// Load the effective configuration.
    ///
    /// An explicit path must exist. Without one, [`CONFIG_ENV`] is consulted, then
    /// [`DEFAULT_CONFIG_PATH`] is used only if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            debug!("Loading configuration from {:?}", path);
            return Self::from_file(path);
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
            let path = PathBuf::from(path);
            debug!("Loading configuration from {:?} ({})", path, CONFIG_ENV);
            return Self::from_file(&path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.is_file() {
            debug!("Loading configuration from {:?}", fallback);
            return Self::from_file(fallback);
        }

        Ok(Self::default())
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        let invalid = |reason: &str| SysError::Config {
            path: origin.to_path_buf(),
            reason: reason.to_string(),
        };

        if self.fs_type.trim().is_empty() {
            return Err(invalid("fs_type must not be empty"));
        }
        if self.retry.attempts == 0 {
            return Err(invalid("retry.attempts must be at least 1"));
        }
        if self.dir_mode > 0o7777 {
            return Err(invalid("dir_mode must be a permission mode (at most 0o7777)"));
        }
        Ok(())
    }
}
