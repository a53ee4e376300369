// SPDX-License-Identifier: GPL-3.0-only

//! Live state queries
//!
//! Each call reads a fresh mount table snapshot. Nothing is kept between calls
//! because other tool invocations and unrelated processes mutate the same state.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SysError};
use crate::mounts::{MountEntry, MountTable};
use crate::partition::{belongs_to, LoopName};

#[derive(Debug, Clone)]
pub struct StateProbe {
    mount_table: PathBuf,
}

impl StateProbe {
    pub fn new(mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }

    fn snapshot(&self) -> Result<MountTable> {
        MountTable::read(&self.mount_table)
    }

    /// Source of the mount at `mount_point`.
    pub fn find_backing_device(&self, mount_point: &Path) -> Result<PathBuf> {
        debug!("Looking up backing device of {:?}", mount_point);
        self.source_at(mount_point)?.ok_or_else(|| {
            SysError::NotFound(format!(
                "no mounted device found for mount point {}",
                mount_point.display()
            ))
        })
    }

    /// Where `device` is mounted, if anywhere.
    pub fn is_mounted(&self, device: &Path) -> Result<Option<PathBuf>> {
        let mount_point = self
            .snapshot()?
            .find_by_source(device)
            .map(|entry| entry.target.clone());
        debug!("{:?} mounted at {:?}", device, mount_point);
        Ok(mount_point)
    }

    /// Device mounted exactly at `mount_point`, if any.
    pub fn source_at(&self, mount_point: &Path) -> Result<Option<PathBuf>> {
        Ok(self
            .snapshot()?
            .find_by_target(mount_point)
            .map(|entry| entry.source.clone()))
    }

    /// Mounts whose source is `base` or one of its partition sub-devices.
    pub fn mounts_of_family(&self, base: &Path) -> Result<Vec<MountEntry>> {
        Ok(self
            .snapshot()?
            .filter_sources(|source| belongs_to(source, base)))
    }
}

/// True iff `path` stats as a block special file.
pub fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|metadata| metadata.file_type().is_block_device())
        .unwrap_or(false)
}

/// True iff `path` is a block device named like a loop device or loop partition.
pub fn is_loop_device(path: &Path) -> bool {
    LoopName::parse(path).is_some() && is_block_device(path)
}
