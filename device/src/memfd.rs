// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Anonymous shared memory backed by `memfd`, used to stand in for the device memory when no real
//! codec device is present.

use std::fs::File;
use std::io;
use std::num::NonZeroU64;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use thiserror::Error;

/// A fixed-size region of memory that can be mapped several times, each mapping seeing the same
/// bytes.
#[derive(Debug)]
pub struct MemFdRegion {
    file: File,
    size: NonZeroU64,
}

#[derive(Debug, Error)]
pub enum MemFdError {
    #[error("memfd region size cannot be zero")]
    ZeroSize,
    #[error("call to memfd_create failed: {0}")]
    Create(#[from] Errno),
    #[error("failed to set size of memfd: {0}")]
    SetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    Seal(io::Error),
}

impl MemFdRegion {
    pub fn new(size: u64) -> Result<Self, MemFdError> {
        let size = NonZeroU64::new(size).ok_or(MemFdError::ZeroSize)?;

        let fd = memfd_create(c"pv-codec-arena", MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        let file: File = fd.into();

        file.set_len(size.into()).map_err(MemFdError::SetSize)?;

        // The device memory never changes size once created.
        //
        // SAFETY: `file` is a valid file.
        if unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL,
            )
        } < 0
        {
            return Err(MemFdError::Seal(io::Error::last_os_error()));
        }

        Ok(Self { file, size })
    }

    pub fn as_file(&self) -> &File {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }
}

impl AsFd for MemFdRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for MemFdRegion {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_region_is_refused() {
        assert!(matches!(MemFdRegion::new(0), Err(MemFdError::ZeroSize)));
    }

    #[test]
    fn region_is_sealed_to_its_size() {
        let region = MemFdRegion::new(0x1000).unwrap();
        assert_eq!(region.size(), 0x1000);
        assert_eq!(region.as_file().metadata().unwrap().len(), 0x1000);
        assert!(region.as_file().set_len(0x2000).is_err());
        assert!(region.as_file().set_len(0x800).is_err());
    }
}
