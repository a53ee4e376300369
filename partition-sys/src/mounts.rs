// SPDX-License-Identifier: GPL-3.0-only

//! Mount table snapshots
//!
//! The kernel's mount table is authoritative. A [`MountTable`] is a snapshot read
//! at call time and dropped with the probe call that read it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, SysError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: String,
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        parse_mount_table(&content)
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn find_by_target(&self, target: &Path) -> Option<&MountEntry> {
        // Later entries shadow earlier ones mounted on the same directory.
        self.entries.iter().rev().find(|entry| entry.target == target)
    }

    pub fn find_by_source(&self, source: &Path) -> Option<&MountEntry> {
        self.entries.iter().find(|entry| entry.source == source)
    }

    pub fn filter_sources<F>(&self, mut predicate: F) -> Vec<MountEntry>
    where
        F: FnMut(&Path) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.source))
            .cloned()
            .collect()
    }
}

/// Parse the `/proc/mounts` format: source, target, type, options, dump, pass.
pub fn parse_mount_table(input: &str) -> Result<MountTable> {
    let mut entries = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(target), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(SysError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid mount table line: {line}"),
            )));
        };
        let options = fields.next().unwrap_or_default();

        entries.push(MountEntry {
            source: PathBuf::from(unescape_mount_field(source)),
            target: PathBuf::from(unescape_mount_field(target)),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
        });
    }

    Ok(MountTable { entries })
}

/// Decode the octal escapes the kernel uses for whitespace (e.g. `\040` -> ` `)
fn unescape_mount_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..=index + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let octal = &value[index + 1..index + 4];
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}
