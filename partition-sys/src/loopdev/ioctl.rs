// SPDX-License-Identifier: GPL-3.0-only

//! Raw loop device ioctls and the structures they exchange with the kernel
//! (see `linux/loop.h`)

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::{ioctl_none_bad, ioctl_read_bad, ioctl_write_int_bad, ioctl_write_ptr_bad};

pub const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

pub const LO_FLAGS_PARTSCAN: u32 = 8;

const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CLR_FD: u32 = 0x4C01;
const LOOP_SET_STATUS64: u32 = 0x4C04;
const LOOP_GET_STATUS64: u32 = 0x4C05;
const LOOP_CONFIGURE: u32 = 0x4C0A;
const LOOP_CTL_GET_FREE: u32 = 0x4C82;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoopInfo64 {
    pub lo_device: u64,
    pub lo_inode: u64,
    pub lo_rdevice: u64,
    pub lo_offset: u64,
    pub lo_sizelimit: u64,
    pub lo_number: u32,
    pub lo_encrypt_type: u32,
    pub lo_encrypt_key_size: u32,
    pub lo_flags: u32,
    pub lo_file_name: [u8; LO_NAME_SIZE],
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [u64; 2],
}

impl LoopInfo64 {
    pub const fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }

    /// Record `path` as the backing file name, truncated so a NUL always fits.
    pub fn set_file_name(&mut self, path: &Path) {
        let bytes = path.as_os_str().as_bytes();
        let len = bytes.len().min(LO_NAME_SIZE - 1);
        self.lo_file_name = [0; LO_NAME_SIZE];
        self.lo_file_name[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn file_name(&self) -> String {
        let end = self
            .lo_file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LO_NAME_SIZE);
        String::from_utf8_lossy(&self.lo_file_name[..end]).into_owned()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub fd: u32,
    pub block_size: u32,
    pub info: LoopInfo64,
    pub reserved: [u64; 8],
}

impl LoopConfig {
    pub const fn zeroed() -> Self {
        Self {
            fd: 0,
            block_size: 0,
            info: LoopInfo64::zeroed(),
            reserved: [0; 8],
        }
    }
}

// LOOP_CTL_GET_FREE returns the index as the syscall result.
ioctl_none_bad!(loop_ctl_get_free, LOOP_CTL_GET_FREE);
ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);
ioctl_read_bad!(loop_get_status64, LOOP_GET_STATUS64, LoopInfo64);
ioctl_write_ptr_bad!(loop_configure, LOOP_CONFIGURE, LoopConfig);
