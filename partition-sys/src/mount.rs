// SPDX-License-Identifier: GPL-3.0-only

//! Mounting and unmounting of loop devices and their partitions

use nix::mount::{mount, umount, MsFlags};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, SysError};
use crate::probe::StateProbe;

/// How devices are mounted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub fs_type: String,
    pub read_only: bool,
    pub data: Option<String>,
    pub dir_mode: u32,
}

impl From<&Config> for MountOptions {
    fn from(config: &Config) -> Self {
        Self {
            fs_type: config.fs_type.clone(),
            read_only: config.read_only,
            data: config.mount_options.clone(),
            dir_mode: config.dir_mode,
        }
    }
}

impl MountOptions {
    fn flags(&self) -> MsFlags {
        if self.read_only {
            MsFlags::MS_RDONLY
        } else {
            MsFlags::empty()
        }
    }
}

/// A completed unmount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmounted {
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

pub struct MountManager<'a> {
    probe: &'a StateProbe,
    options: MountOptions,
}

impl<'a> MountManager<'a> {
    pub fn new(probe: &'a StateProbe, options: MountOptions) -> Self {
        Self { probe, options }
    }

    /// Mount `device` at `mount_point`, creating the directory if needed.
    ///
    /// Refuses when the device is already mounted or the directory already hosts
    /// a mount; the existing mount is left untouched.
    pub fn mount(&self, device: &Path, mount_point: &Path) -> Result<()> {
        if let Some(existing) = self.probe.is_mounted(device)? {
            return Err(SysError::mount_failed(
                device,
                mount_point,
                format!("device is already mounted at {}", existing.display()),
            ));
        }
        if let Some(occupant) = self.probe.source_at(mount_point)? {
            return Err(SysError::mount_failed(
                device,
                mount_point,
                format!("mount point is already in use by {}", occupant.display()),
            ));
        }

        prepare_mount_point(mount_point, self.options.dir_mode).map_err(|e| {
            SysError::mount_failed(
                device,
                mount_point,
                format!("cannot create mount point directory: {e}"),
            )
        })?;

        debug!(
            "Mounting {:?} on {:?} as {} (flags: {:?})",
            device,
            mount_point,
            self.options.fs_type,
            self.options.flags()
        );
        mount(
            Some(device),
            mount_point,
            Some(self.options.fs_type.as_str()),
            self.options.flags(),
            self.options.data.as_deref(),
        )
        .map_err(|errno| {
            SysError::mount_failed(
                device,
                mount_point,
                format!("{errno} (error code {})", errno as i32),
            )
        })?;

        info!("Mounted {:?} on {:?}", device, mount_point);
        Ok(())
    }

    /// Unmount by mount point, or by device if `path` is a mounted source.
    pub fn unmount(&self, path: &Path) -> Result<Unmounted> {
        let unmounted = if let Some(device) = self.probe.source_at(path)? {
            Unmounted {
                device,
                mount_point: path.to_path_buf(),
            }
        } else if let Some(mount_point) = self.probe.is_mounted(path)? {
            // umount(2) acts on whatever is mounted on top at that directory.
            if let Some(top) = self.probe.source_at(&mount_point)?
                && top.as_path() != path
            {
                return Err(SysError::Busy {
                    device: path.to_path_buf(),
                    reason: format!(
                        "{} is covered by {} mounted on top of it",
                        mount_point.display(),
                        top.display()
                    ),
                });
            }
            Unmounted {
                device: path.to_path_buf(),
                mount_point,
            }
        } else {
            return Err(SysError::NotMounted(path.to_path_buf()));
        };

        debug!("Unmounting {:?}", unmounted.mount_point);
        umount(unmounted.mount_point.as_path()).map_err(|source| match source {
            nix::errno::Errno::EINVAL => SysError::NotMounted(unmounted.mount_point.clone()),
            source => SysError::Unmount {
                mount_point: unmounted.mount_point.clone(),
                source,
            },
        })?;

        info!(
            "Unmounted {:?} from {:?}",
            unmounted.device, unmounted.mount_point
        );
        Ok(unmounted)
    }
}

/// Create `mount_point` and its parents; an existing directory is fine.
fn prepare_mount_point(mount_point: &Path, mode: u32) -> std::io::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(mount_point)?;

    if !mount_point.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", mount_point.display()),
        ));
    }
    Ok(())
}
