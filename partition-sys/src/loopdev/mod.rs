// SPDX-License-Identifier: GPL-3.0-only

//! Loop device allocation, association and release
//!
//! A [`LoopDevice`] owns an open handle on `/dev/loopN`; the handle is closed
//! when the value is dropped, on success and error paths alike.

mod alloc;
mod associate;
mod ioctl;
mod status;

pub use alloc::{allocate, LOOP_CONTROL};
pub use status::LoopStatus;

use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::RetryPolicy;
use crate::error::{Result, SysError};

#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    file: File,
}

impl LoopDevice {
    /// Open the node of a freshly allocated slot, waiting for udev to create it.
    pub fn open_with_retry(path: impl Into<PathBuf>, policy: &RetryPolicy) -> Result<Self> {
        let path = path.into();
        let file = alloc::retry_open(&path, policy, open_read_write)?;
        Ok(Self { path, file })
    }

    /// Open an existing loop device node without retrying.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open_read_write(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                SysError::NotFound(format!("loop device {} does not exist", path.display()))
            }
            io::ErrorKind::PermissionDenied => {
                SysError::PermissionDenied(format!("cannot open {}", path.display()))
            }
            _ => SysError::Io(e),
        })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind `image` as the backing store of this device.
    pub fn associate(&self, image: &Path, partition_scan: bool) -> Result<()> {
        associate::associate(&self.file, &self.path, image, partition_scan)
    }

    /// Backing file details, or `None` if nothing is bound.
    pub fn status(&self) -> Result<Option<LoopStatus>> {
        status::query(&self.file)
    }

    /// Drop the association with the backing file (LOOP_CLR_FD).
    pub fn clear(&self) -> Result<()> {
        debug!("Clearing loop device {:?}", self.path);
        unsafe { ioctl::loop_clr_fd(self.file.as_raw_fd()) }.map_err(|source| {
            SysError::Release {
                device: self.path.clone(),
                source,
            }
        })?;
        info!("Released loop device {:?}", self.path);
        Ok(())
    }
}

fn open_read_write(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

pub(crate) fn errno_of(error: &io::Error) -> Errno {
    error.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}
