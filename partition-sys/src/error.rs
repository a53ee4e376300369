// SPDX-License-Identifier: GPL-3.0-only

use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Error types for loop device and mount operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("this program must be run as root")]
    Privilege,

    #[error("invalid arguments: {0}")]
    Argument(String),

    #[error("failed to resolve absolute path for {path:?}")]
    Resolution {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed to allocate a loop device")]
    Allocation(#[source] Errno),

    #[error("loop device {path:?} did not become ready after {attempts} attempts")]
    DeviceNotReady {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: Errno,
    },

    #[error("failed to configure loop device {device:?} with {image:?}")]
    Association {
        device: PathBuf,
        image: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to mount {device:?} on {mount_point:?}: {reason}")]
    Mount {
        device: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("failed to unmount {mount_point:?}")]
    Unmount {
        mount_point: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("{0:?} is not mounted")]
    NotMounted(PathBuf),

    #[error("{device:?} is busy: {reason}")]
    Busy { device: PathBuf, reason: String },

    #[error("failed to clear loop device {device:?}")]
    Release {
        device: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("invalid configuration {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },
}

impl SysError {
    pub(crate) fn mount_failed(
        device: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Mount {
            device: device.into(),
            mount_point: mount_point.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for loop device and mount operations
pub type Result<T> = std::result::Result<T, SysError>;
