// SPDX-License-Identifier: GPL-3.0-only

//! Loop device and partition sub-device naming

use std::path::{Path, PathBuf};

const DEV_DIR: &str = "/dev";
const SYS_BLOCK_DIR: &str = "/sys/block";

/// A parsed `loopN` or `loopNpM` device name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopName {
    pub index: u32,
    pub partition: Option<u32>,
}

impl LoopName {
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix("loop")?;

        let (index, partition) = match rest.split_once('p') {
            Some((index, partition)) => (index, Some(parse_digits(partition)?)),
            None => (rest, None),
        };

        Some(Self {
            index: parse_digits(index)?,
            partition,
        })
    }

    pub fn base_path(&self) -> PathBuf {
        loop_device_path(self.index)
    }
}

fn parse_digits(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

pub fn loop_device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("{DEV_DIR}/loop{index}"))
}

/// Node path of partition `number` on `base` (`/dev/loop0` + 1 -> `/dev/loop0p1`)
pub fn partition_path(base: &Path, number: u32) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(format!("p{number}"));
    PathBuf::from(path)
}

/// Map a partition sub-device to the device that owns it.
///
/// A trailing `p<digits>` is stripped only when the remaining prefix itself ends
/// in a digit, so `/dev/loop0p1` becomes `/dev/loop0` while a name that merely
/// contains a `p` is returned unchanged.
pub fn base_device(device: &Path) -> PathBuf {
    let Some(text) = device.to_str() else {
        return device.to_path_buf();
    };

    if let Some(pos) = text.rfind('p') {
        let (base, suffix) = (&text[..pos], &text[pos + 1..]);
        let suffix_is_number = !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit());
        let base_ends_in_digit = base.bytes().last().is_some_and(|b| b.is_ascii_digit());
        if suffix_is_number && base_ends_in_digit {
            return PathBuf::from(base);
        }
    }

    device.to_path_buf()
}

/// True if `candidate` is `base` itself or one of its partition sub-devices.
pub fn belongs_to(candidate: &Path, base: &Path) -> bool {
    candidate == base || base_device(candidate) == base
}

/// Partitions the kernel registered for a loop device, lowest number first.
///
/// sysfs lists them synchronously after partition scanning, before udev has
/// necessarily created the `/dev` nodes.
pub fn scanned_partitions(name: LoopName) -> Vec<u32> {
    scanned_partitions_in(Path::new(SYS_BLOCK_DIR), name)
}

fn scanned_partitions_in(sys_block: &Path, name: LoopName) -> Vec<u32> {
    let disk = format!("loop{}", name.index);
    let Ok(entries) = std::fs::read_dir(sys_block.join(&disk)) else {
        return Vec::new();
    };

    let prefix = format!("{disk}p");
    let mut partitions: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let number = file_name.to_str()?.strip_prefix(&prefix)?;
            parse_digits(number)
        })
        .collect();
    partitions.sort_unstable();
    partitions
}
