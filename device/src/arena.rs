// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The memory region shared between the guest and the host codec device.
//!
//! The host owns the allocation policy of this region: the guest only ever sees byte ranges that
//! the host handed out, and addresses them with [`ArenaOffset`]. This module is the only place
//! where an offset is turned into a dereferenceable range, always after a bounds check.

use std::fmt;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman;
use thiserror::Error;

/// Offset of a byte range inside the [`Arena`].
///
/// Offsets are what crosses the guest/host boundary; they are never pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ArenaOffset(u32);

impl ArenaOffset {
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns this offset moved forward by `bias` bytes.
    pub fn checked_add(self, bias: u32) -> Option<Self> {
        self.0.checked_add(bias).map(Self)
    }
}

impl fmt::Display for ArenaOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena size cannot be zero")]
    ZeroSize,
    #[error("mmap of the arena failed: {0}")]
    Map(Errno),
    #[error("range {offset}+{len:#x} is outside of the {size:#x} bytes arena")]
    OutOfBounds {
        offset: ArenaOffset,
        len: usize,
        size: usize,
    },
}

/// A shared read-write mapping of the device memory.
///
/// The mapping is removed when the `Arena` is dropped. Sessions share it through an `Arc`, so it
/// lives as long as any session or buffer still refers to it.
pub struct Arena {
    base: NonNull<u8>,
    len: NonZeroUsize,
}

// SAFETY: the arena is a plain memory mapping. All accesses go through bounds-checked copies, and
// ownership of individual ranges is arbitrated by the host allocator.
unsafe impl Send for Arena {}
// SAFETY: see above.
unsafe impl Sync for Arena {}

impl Arena {
    /// Map `len` bytes of `fd` starting at offset 0, shared and read-write.
    pub fn map<F: AsFd>(fd: F, len: usize) -> Result<Self, ArenaError> {
        let len = NonZeroUsize::new(len).ok_or(ArenaError::ZeroSize)?;

        // SAFETY: we map a fresh range chosen by the kernel, and never unmap it before drop.
        let data = unsafe {
            mman::mmap(
                None,
                len,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(ArenaError::Map)?;

        log::debug!("mapped {:#x} bytes of device memory at {:p}", len, data);

        Ok(Self {
            base: data.cast(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the address of `len` bytes at `offset`, if the range fits in the arena.
    fn range(&self, offset: ArenaOffset, len: usize) -> Result<NonNull<u8>, ArenaError> {
        let start = offset.get() as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.len() => {
                // SAFETY: `start` is within the mapping as checked above.
                Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
            }
            _ => Err(ArenaError::OutOfBounds {
                offset,
                len,
                size: self.len(),
            }),
        }
    }

    /// Copy `buf.len()` bytes at `offset` into `buf`.
    pub fn read(&self, offset: ArenaOffset, buf: &mut [u8]) -> Result<(), ArenaError> {
        let src = self.range(offset, buf.len())?;
        // SAFETY: the source range is inside the mapping and cannot overlap with `buf`, which is
        // guest-private memory.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), buf.as_mut_ptr(), buf.len()) };

        Ok(())
    }

    /// Copy `data` into the arena at `offset`.
    pub fn write(&self, offset: ArenaOffset, data: &[u8]) -> Result<(), ArenaError> {
        let dst = self.range(offset, data.len())?;
        // SAFETY: the destination range is inside the mapping and does not overlap with `data`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };

        Ok(())
    }

    /// Returns a view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own the range (i.e. hold the buffer handle covering it) for the whole
    /// lifetime of the returned slice, so that neither the host nor another guest thread writes
    /// into it meanwhile.
    pub(crate) unsafe fn slice(&self, offset: ArenaOffset, len: usize) -> Result<&[u8], ArenaError> {
        let start = self.range(offset, len)?;
        Ok(std::slice::from_raw_parts(start.as_ptr(), len))
    }

    /// Returns a mutable view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// Same as [`Self::slice`], and no other view of the range may exist.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(
        &self,
        offset: ArenaOffset,
        len: usize,
    ) -> Result<&mut [u8], ArenaError> {
        let start = self.range(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(start.as_ptr(), len))
    }

    /// Returns a reader over `len` bytes at `offset`.
    pub fn reader(&self, offset: ArenaOffset, len: usize) -> Result<ArenaReader<'_>, ArenaError> {
        self.range(offset, len)?;
        Ok(ArenaReader {
            arena: self,
            start: offset,
            len,
            pos: 0,
        })
    }

    /// Returns a reader over everything from `offset` to the end of the arena.
    pub fn reader_to_end(&self, offset: ArenaOffset) -> Result<ArenaReader<'_>, ArenaError> {
        let len = self.len().saturating_sub(offset.get() as usize);
        self.reader(offset, len)
    }

    /// Returns a writer over `len` bytes at `offset`.
    pub fn writer(&self, offset: ArenaOffset, len: usize) -> Result<ArenaWriter<'_>, ArenaError> {
        self.range(offset, len)?;
        Ok(ArenaWriter {
            arena: self,
            start: offset,
            len,
            pos: 0,
        })
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        log::debug!("unmapping device memory at {:p}", self.base);
        // SAFETY: the pointer and length were obtained from `mmap` in `Arena::map`.
        unsafe { mman::munmap(self.base.cast(), self.len.get()) }.unwrap_or_else(|e| {
            log::error!("error while unmapping device memory: {:#}", e);
        });
    }
}

fn out_of_window(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("{} past the arena window", what))
}

/// Sequential reader over a window of the arena.
pub struct ArenaReader<'a> {
    arena: &'a Arena,
    start: ArenaOffset,
    len: usize,
    pos: usize,
}

impl Read for ArenaReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.len - self.pos);
        if count == 0 {
            return Ok(0);
        }

        let offset = self
            .start
            .checked_add(self.pos as u32)
            .ok_or_else(|| out_of_window("read"))?;
        self.arena
            .read(offset, &mut buf[..count])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.pos += count;

        Ok(count)
    }
}

/// Sequential writer over a window of the arena. Seeking is allowed within the window, which is
/// used to backpatch length prefixes.
pub struct ArenaWriter<'a> {
    arena: &'a Arena,
    start: ArenaOffset,
    len: usize,
    pos: usize,
}

impl Write for ArenaWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() > self.len - self.pos {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "{} bytes do not fit in the {} bytes left of the arena window",
                    buf.len(),
                    self.len - self.pos
                ),
            ));
        }

        let offset = self
            .start
            .checked_add(self.pos as u32)
            .ok_or_else(|| out_of_window("write"))?;
        self.arena
            .write(offset, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.pos += buf.len();

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ArenaWriter<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => Some(p as i64),
            SeekFrom::Current(d) => (self.pos as i64).checked_add(d),
            SeekFrom::End(d) => (self.len as i64).checked_add(d),
        };

        match new_pos {
            Some(p) if p >= 0 && p as usize <= self.len => {
                self.pos = p as usize;
                Ok(self.pos as u64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside of the arena window",
            )),
        }
    }
}
