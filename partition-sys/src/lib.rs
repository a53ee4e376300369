// SPDX-License-Identifier: GPL-3.0-only

//! Loop device and partition lifecycle for raw disk images
//!
//! This crate exposes raw images as mountable block devices:
//! - Allocating loop slots and associating backing images
//! - Resolving user paths against live kernel and mount table state
//! - Mounting and unmounting loop devices and their partitions
//! - Releasing loop devices once nothing is mounted from them
//!
//! Nothing is cached: the kernel loop table and the mount table are re-read
//! immediately before every action. All operations require root.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod loopdev;
pub mod mount;
pub mod mounts;
pub mod partition;
pub mod path;
pub mod probe;
pub mod release;

pub use config::{Config, RetryPolicy};
pub use dispatch::{Action, Dispatcher, Outcome};
pub use error::{Result, SysError};
pub use loopdev::{LoopDevice, LoopStatus};
pub use mount::{MountManager, MountOptions};
pub use path::PathKind;
pub use probe::StateProbe;
pub use release::{LoopReleaser, Released};
