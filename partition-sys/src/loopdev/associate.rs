// SPDX-License-Identifier: GPL-3.0-only

use nix::errno::Errno;
use nix::unistd::{access, AccessFlags};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ioctl::{self, LoopConfig, LoopInfo64, LO_FLAGS_PARTSCAN};
use crate::error::{Result, SysError};

/// Clears the slot on drop unless the association completed.
struct ClearOnDrop<'a> {
    device: &'a File,
    path: &'a Path,
    armed: bool,
}

impl ClearOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!("Rolling back partial association of {:?}", self.path);
        if let Err(e) = unsafe { ioctl::loop_clr_fd(self.device.as_raw_fd()) } {
            // ENXIO: the kernel never took the backing fd.
            if e != Errno::ENXIO {
                warn!("Rollback of {:?} failed: {}", self.path, e);
            }
        }
    }
}

/// Existence and read/write access, checked before any kernel call.
fn check_backing_image(image: &Path) -> Result<()> {
    access(image, AccessFlags::F_OK)
        .map_err(|_| SysError::NotFound(format!("file {} does not exist", image.display())))?;
    access(image, AccessFlags::R_OK | AccessFlags::W_OK).map_err(|_| {
        SysError::PermissionDenied(format!(
            "file {} is not readable and writable",
            image.display()
        ))
    })?;
    Ok(())
}

pub(crate) fn associate(
    device: &File,
    device_path: &Path,
    image: &Path,
    partition_scan: bool,
) -> Result<()> {
    check_backing_image(image)?;

    let failed = |source: Errno| SysError::Association {
        device: device_path.to_path_buf(),
        image: PathBuf::from(image),
        source,
    };

    // Closed on return; the kernel keeps its own reference once configured.
    let backing = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .map_err(|e| failed(super::errno_of(&e)))?;

    let mut info = LoopInfo64::zeroed();
    info.set_file_name(image);
    if partition_scan {
        info.lo_flags |= LO_FLAGS_PARTSCAN;
    }

    let mut config = LoopConfig::zeroed();
    config.fd = backing.as_raw_fd() as u32;
    config.info = info;

    let fd = device.as_raw_fd();

    // LOOP_CONFIGURE binds atomically: on failure nothing of ours is attached,
    // and an EBUSY slot belongs to someone else.
    match unsafe { ioctl::loop_configure(fd, &config) } {
        Ok(_) => {}
        Err(Errno::EINVAL | Errno::ENOTTY) => {
            debug!("LOOP_CONFIGURE unsupported, falling back to LOOP_SET_FD");
            unsafe { ioctl::loop_set_fd(fd, backing.as_raw_fd()) }.map_err(failed)?;

            let guard = ClearOnDrop {
                device,
                path: device_path,
                armed: true,
            };
            unsafe { ioctl::loop_set_status64(fd, &info) }.map_err(failed)?;
            guard.disarm();
        }
        Err(e) => return Err(failed(e)),
    }

    info!(
        "Associated {:?} with {:?} (partition scan: {})",
        image, device_path, partition_scan
    );
    Ok(())
}
