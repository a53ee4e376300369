// SPDX-License-Identifier: GPL-3.0-only

//! Path resolution and classification
//!
//! Every user-supplied path is resolved once and classified into a [`PathKind`];
//! the rest of the crate matches on that value instead of re-checking the file type.

use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SysError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    BlockDevice(PathBuf),
    RegularFile(PathBuf),
    Directory(PathBuf),
}

impl PathKind {
    pub fn path(&self) -> &Path {
        match self {
            Self::BlockDevice(path) | Self::RegularFile(path) | Self::Directory(path) => path,
        }
    }
}

/// Produce the absolute form of `path`.
///
/// Relative paths go through realpath(3) against the current directory, so they
/// must exist. Absolute paths are returned unchanged.
pub fn resolve(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let resolved = std::fs::canonicalize(path).map_err(|source| SysError::Resolution {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Resolved {:?} to {:?}", path, resolved);
    Ok(resolved)
}

/// Stat `path` (following symlinks) and classify it.
pub fn classify(path: impl AsRef<Path>) -> Result<PathKind> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => SysError::NotFound(format!("{} does not exist", path.display())),
        ErrorKind::PermissionDenied => {
            SysError::PermissionDenied(format!("cannot stat {}", path.display()))
        }
        _ => SysError::Io(e),
    })?;

    let file_type = metadata.file_type();
    let path = path.to_path_buf();
    if file_type.is_block_device() {
        Ok(PathKind::BlockDevice(path))
    } else if file_type.is_file() {
        Ok(PathKind::RegularFile(path))
    } else if file_type.is_dir() {
        Ok(PathKind::Directory(path))
    } else {
        Err(SysError::Argument(format!(
            "{} is neither a block device, a regular file nor a directory",
            path.display()
        )))
    }
}
