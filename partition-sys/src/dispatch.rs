// SPDX-License-Identifier: GPL-3.0-only

//! Action dispatch
//!
//! An [`Action`] is decided once at the CLI boundary. Paths inside it are
//! resolved and classified here before any component acts on them.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{Config, RetryPolicy};
use crate::error::{Result, SysError};
use crate::loopdev::{allocate, LoopDevice};
use crate::mount::{MountManager, MountOptions};
use crate::partition::{loop_device_path, partition_path, scanned_partitions, LoopName};
use crate::path::{classify, resolve, PathKind};
use crate::probe::StateProbe;
use crate::release::LoopReleaser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add { image: PathBuf },
    Remove { target: PathBuf },
    Mount { source: PathBuf, mount_point: PathBuf },
    Umount { target: PathBuf },
}

/// Result of a successful action, printed on stdout by the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outcome {
    Added {
        device: PathBuf,
        image: PathBuf,
        partitions: Vec<PathBuf>,
    },
    Removed {
        device: PathBuf,
        unmounted: Vec<PathBuf>,
        backing_file: Option<String>,
    },
    Mounted {
        device: PathBuf,
        mount_point: PathBuf,
        /// Loop device allocated for an image source
        allocated: Option<PathBuf>,
    },
    Unmounted {
        device: PathBuf,
        mount_point: PathBuf,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added { device, .. } => write!(f, "{}", device.display()),
            Self::Removed { device, .. } => {
                write!(f, "Successfully removed loop device: {}", device.display())
            }
            Self::Mounted {
                device,
                mount_point,
                allocated,
            } => {
                if let Some(loop_device) = allocated {
                    writeln!(f, "Loop device: {}", loop_device.display())?;
                }
                write!(f, "Mounted {} on {}", device.display(), mount_point.display())
            }
            Self::Unmounted {
                device,
                mount_point,
            } => write!(
                f,
                "Unmounted {} from {}",
                device.display(),
                mount_point.display()
            ),
        }
    }
}

pub struct Dispatcher {
    config: Config,
    probe: StateProbe,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        let probe = StateProbe::new(config.mount_table.clone());
        Self { config, probe }
    }

    pub fn run(&self, action: Action) -> Result<Outcome> {
        debug!("Dispatching {:?}", action);
        let mounts = MountManager::new(&self.probe, MountOptions::from(&self.config));

        match action {
            Action::Add { image } => {
                let image = resolve(&image)?;
                let device = self.add(&image)?;
                let partitions = partition_nodes(&device);
                Ok(Outcome::Added {
                    device,
                    image,
                    partitions,
                })
            }
            Action::Remove { target } => {
                let target = resolve(&target)?;
                let released = LoopReleaser::new(&self.probe, &mounts).release(&target)?;
                Ok(Outcome::Removed {
                    device: released.device,
                    unmounted: released.unmounted,
                    backing_file: released.backing_file,
                })
            }
            Action::Mount {
                source,
                mount_point,
            } => {
                let source = resolve(&source)?;
                let mount_point = resolve(&mount_point)?;
                self.mount(&mounts, &source, &mount_point)
            }
            Action::Umount { target } => {
                let target = resolve(&target)?;
                let unmounted = mounts.unmount(&target)?;
                Ok(Outcome::Unmounted {
                    device: unmounted.device,
                    mount_point: unmounted.mount_point,
                })
            }
        }
    }

    /// Allocate a loop slot and bind `image` to it.
    fn add(&self, image: &Path) -> Result<PathBuf> {
        match classify(image)? {
            PathKind::RegularFile(_) => {}
            other => {
                return Err(SysError::Argument(format!(
                    "{} is not a regular image file",
                    other.path().display()
                )))
            }
        }

        let index = allocate()?;
        let loop_device = LoopDevice::open_with_retry(loop_device_path(index), &self.config.retry)?;
        loop_device.associate(image, self.config.partition_scan)?;

        if let Ok(Some(status)) = loop_device.status() {
            debug!(
                "{:?} reports backing file {:?} (partition scan: {})",
                loop_device.path(),
                status.backing_file,
                status.partition_scan()
            );
        }
        Ok(loop_device.path().to_path_buf())
    }

    fn mount(&self, mounts: &MountManager<'_>, source: &Path, mount_point: &Path) -> Result<Outcome> {
        match classify(source)? {
            PathKind::BlockDevice(device) => {
                let device = mountable_device(&device, &self.config.retry)?;
                mounts.mount(&device, mount_point)?;
                Ok(Outcome::Mounted {
                    device,
                    mount_point: mount_point.to_path_buf(),
                    allocated: None,
                })
            }
            PathKind::RegularFile(image) => {
                let loop_path = self.add(&image)?;
                let mounted = mountable_device(&loop_path, &self.config.retry)
                    .and_then(|device| mounts.mount(&device, mount_point).map(|()| device));

                match mounted {
                    Ok(device) => Ok(Outcome::Mounted {
                        device,
                        mount_point: mount_point.to_path_buf(),
                        allocated: Some(loop_path),
                    }),
                    Err(e) => {
                        // Do not leak the slot allocated for this request.
                        if let Err(cleanup) = LoopDevice::open(&loop_path).and_then(|d| d.clear()) {
                            warn!("Failed to release {:?} after mount error: {}", loop_path, cleanup);
                        }
                        Err(e)
                    }
                }
            }
            PathKind::Directory(dir) => Err(SysError::Argument(format!(
                "{} is a directory; expected a loop device or an image file",
                dir.display()
            ))),
        }
    }
}

/// The device to mount for `device`: its first partition when it is a whole
/// loop device the kernel found partitions on, otherwise the device itself.
fn mountable_device(device: &Path, retry: &RetryPolicy) -> Result<PathBuf> {
    let Some(name) = LoopName::parse(device) else {
        return Ok(device.to_path_buf());
    };
    if name.partition.is_some() {
        return Ok(device.to_path_buf());
    }

    let Some(&first) = scanned_partitions(name).first() else {
        return Ok(device.to_path_buf());
    };

    let partition = partition_path(device, first);
    wait_for_node(&partition, retry)?;
    debug!("Using partition {:?} of {:?}", partition, device);
    Ok(partition)
}

/// Partition nodes the kernel exposed for a freshly associated device
fn partition_nodes(device: &Path) -> Vec<PathBuf> {
    LoopName::parse(device)
        .map(|name| {
            scanned_partitions(name)
                .into_iter()
                .map(|number| partition_path(device, number))
                .collect()
        })
        .unwrap_or_default()
}

fn wait_for_node(path: &Path, retry: &RetryPolicy) -> Result<()> {
    for attempt in 1..=retry.attempts {
        if path.exists() {
            return Ok(());
        }
        if attempt < retry.attempts {
            std::thread::sleep(retry.delay());
        }
    }
    Err(SysError::DeviceNotReady {
        path: path.to_path_buf(),
        attempts: retry.attempts,
        source: nix::errno::Errno::ENOENT,
    })
}
