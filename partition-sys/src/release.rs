// SPDX-License-Identifier: GPL-3.0-only

//! Tearing down a loop device association

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, SysError};
use crate::loopdev::LoopDevice;
use crate::mount::MountManager;
use crate::partition::{base_device, belongs_to, LoopName};
use crate::path::{classify, PathKind};
use crate::probe::{is_loop_device, StateProbe};

/// A completed release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub device: PathBuf,
    /// Mount points unmounted on the way
    pub unmounted: Vec<PathBuf>,
    pub backing_file: Option<String>,
}

pub struct LoopReleaser<'a> {
    probe: &'a StateProbe,
    mounts: &'a MountManager<'a>,
}

impl<'a> LoopReleaser<'a> {
    pub fn new(probe: &'a StateProbe, mounts: &'a MountManager<'a>) -> Self {
        Self { probe, mounts }
    }

    /// Release the loop device named by `path`, a loop device or a mount point.
    ///
    /// Every mount of the device and its partitions is unmounted first; the
    /// association is only cleared once the mount table shows none left.
    pub fn release(&self, path: &Path) -> Result<Released> {
        let device = self.target_device(path)?;
        let base = base_device(&device);
        debug!("Releasing {:?} (base device {:?})", device, base);

        let unmounted = self.unmount_family(&base)?;

        let remaining = self.probe.mounts_of_family(&base)?;
        if let Some(entry) = remaining.first() {
            return Err(SysError::Busy {
                device: base,
                reason: format!(
                    "{} is still mounted at {}",
                    entry.source.display(),
                    entry.target.display()
                ),
            });
        }

        let loop_device = LoopDevice::open(&base)?;
        let backing_file = match loop_device.status() {
            Ok(status) => status.map(|status| status.backing_file),
            Err(e) => {
                warn!("Could not read status of {:?}: {}", base, e);
                None
            }
        };
        loop_device.clear()?;

        info!("Released {:?} (backing file {:?})", base, backing_file);
        Ok(Released {
            device: base,
            unmounted,
            backing_file,
        })
    }

    fn target_device(&self, path: &Path) -> Result<PathBuf> {
        match classify(path)? {
            PathKind::BlockDevice(device) => {
                if LoopName::parse(&device).is_none() {
                    return Err(SysError::Argument(format!(
                        "{} is not a loop device",
                        device.display()
                    )));
                }
                Ok(device)
            }
            PathKind::Directory(mount_point) => {
                let device = self.probe.find_backing_device(&mount_point)?;
                if !is_loop_device(&device) {
                    return Err(SysError::NotFound(format!(
                        "{} is mounted from {}, which is not a loop device",
                        mount_point.display(),
                        device.display()
                    )));
                }
                Ok(device)
            }
            PathKind::RegularFile(file) => Err(SysError::NotFound(format!(
                "no mounted loop device found for {}",
                file.display()
            ))),
        }
    }

    fn unmount_family(&self, base: &Path) -> Result<Vec<PathBuf>> {
        let family = self.probe.mounts_of_family(base)?;

        // umount(2) by path removes the topmost mount, which must be ours.
        for entry in &family {
            if let Some(top) = self.probe.source_at(&entry.target)?
                && !belongs_to(&top, base)
            {
                return Err(SysError::Busy {
                    device: base.to_path_buf(),
                    reason: format!(
                        "{} is covered by {} mounted on top of it",
                        entry.target.display(),
                        top.display()
                    ),
                });
            }
        }

        let mut unmounted = Vec::new();

        // Newest first, so nested mounts go before their parents.
        for entry in family.into_iter().rev() {
            let done = self.mounts.unmount(&entry.target).map_err(|e| SysError::Busy {
                device: entry.source.clone(),
                reason: format!("unmounting {} failed: {e}", entry.target.display()),
            })?;
            unmounted.push(done.mount_point);
        }

        Ok(unmounted)
    }
}
