// SPDX-License-Identifier: GPL-3.0-only

use nix::errno::Errno;
use std::fs::File;
use std::os::fd::AsRawFd;

use super::ioctl::{self, LoopInfo64, LO_FLAGS_PARTSCAN};
use crate::error::{Result, SysError};

/// What the kernel reports for a bound loop device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub number: u32,
    /// Name recorded at association time, possibly truncated
    pub backing_file: String,
    pub offset: u64,
    pub size_limit: u64,
    pub flags: u32,
}

impl LoopStatus {
    pub fn partition_scan(&self) -> bool {
        self.flags & LO_FLAGS_PARTSCAN != 0
    }
}

impl From<&LoopInfo64> for LoopStatus {
    fn from(info: &LoopInfo64) -> Self {
        Self {
            number: info.lo_number,
            backing_file: info.file_name(),
            offset: info.lo_offset,
            size_limit: info.lo_sizelimit,
            flags: info.lo_flags,
        }
    }
}

pub(crate) fn query(device: &File) -> Result<Option<LoopStatus>> {
    let mut info = LoopInfo64::zeroed();
    match unsafe { ioctl::loop_get_status64(device.as_raw_fd(), &mut info) } {
        Ok(_) => Ok(Some(LoopStatus::from(&info))),
        Err(Errno::ENXIO) => Ok(None),
        Err(e) => Err(SysError::Io(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn converts_kernel_info() {
        let mut info = LoopInfo64::zeroed();
        info.lo_number = 7;
        info.lo_flags = LO_FLAGS_PARTSCAN;
        info.set_file_name(Path::new("/tmp/disk.img"));

        let status = LoopStatus::from(&info);
        assert_eq!(status.number, 7);
        assert_eq!(status.backing_file, "/tmp/disk.img");
        assert!(status.partition_scan());
    }
}
