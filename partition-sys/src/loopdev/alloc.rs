// SPDX-License-Identifier: GPL-3.0-only

use nix::errno::Errno;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing::{debug, warn};

use super::{errno_of, ioctl};
use crate::config::RetryPolicy;
use crate::error::{Result, SysError};

pub const LOOP_CONTROL: &str = "/dev/loop-control";

/// Ask the kernel for an unused loop slot.
///
/// The slot is reserved but unconfigured until something is associated with it.
pub fn allocate() -> Result<u32> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)
        .map_err(|e| {
            warn!("Failed to open {}: {}", LOOP_CONTROL, e);
            SysError::Allocation(errno_of(&e))
        })?;

    let index = unsafe { ioctl::loop_ctl_get_free(control.as_raw_fd()) }
        .map_err(SysError::Allocation)?;
    let index = u32::try_from(index).map_err(|_| SysError::Allocation(Errno::ENODEV))?;

    debug!("Kernel reserved loop slot {}", index);
    Ok(index)
}

/// Open `path`, retrying while the node is missing or not yet accessible.
///
/// Between LOOP_CTL_GET_FREE and udev applying ownership, opening `/dev/loopN`
/// can fail with EACCES or ENOENT. Every other error is returned at once.
pub(crate) fn retry_open<T, F>(path: &Path, policy: &RetryPolicy, mut open: F) -> Result<T>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    let mut last = Errno::ENOENT;

    for attempt in 1..=policy.attempts {
        match open(path) {
            Ok(handle) => {
                if attempt > 1 {
                    debug!("Opened {:?} after {} attempts", path, attempt);
                }
                return Ok(handle);
            }
            Err(e) if matches!(errno_of(&e), Errno::EACCES | Errno::ENOENT) => {
                last = errno_of(&e);
                if attempt < policy.attempts {
                    std::thread::sleep(policy.delay());
                }
            }
            Err(e) => return Err(SysError::Io(e)),
        }
    }

    Err(SysError::DeviceNotReady {
        path: path.to_path_buf(),
        attempts: policy.attempts,
        source: last,
    })
}
