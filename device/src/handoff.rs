// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output buffers handed to the media pipeline.
//!
//! Whenever possible, a decoded picture is given to the pipeline without copying it out of the
//! arena: the [`OutputBuffer`] then aliases the arena range, which goes back to the host when the
//! buffer is released or dropped. When the host signals that the range is the last free block of
//! the arena, keeping it alive downstream could starve every other context, so the picture is
//! copied to the heap and the range returned immediately.

use std::fmt;

use crate::allocator::BufferAllocator;
use crate::allocator::BufferHandle;
use crate::arena::ArenaError;
use crate::arena::ArenaOffset;
use crate::error::Result;
use crate::transport::PendingPicture;
use crate::CodecDevice;

/// Where the pixels of a decoded picture come from.
#[derive(Debug)]
pub enum PictureSource {
    /// The picture has already been copied by a fused decode-and-copy.
    Fused(PendingPicture),
    /// The picture must be requested with a picture-copy operation.
    Copy,
}

enum Backing<D: CodecDevice> {
    Arena {
        /// Always `Some` until the buffer is released.
        handle: Option<BufferHandle>,
        /// Distance from the start of the range to the data.
        bias: u32,
        allocator: BufferAllocator<D>,
    },
    Heap(Vec<u8>),
}

/// A buffer of `len` bytes given to the pipeline, backed either by the arena or by the heap.
pub struct OutputBuffer<D: CodecDevice> {
    backing: Backing<D>,
    len: usize,
}

impl<D: CodecDevice> OutputBuffer<D> {
    /// Wraps a picture left in the arena by the host, copying it to the heap if the host flagged
    /// its range as the last free one.
    pub fn from_picture(
        allocator: &BufferAllocator<D>,
        picture: PendingPicture,
        len: usize,
    ) -> Result<Self> {
        let PendingPicture {
            handle,
            bias,
            is_last,
        } = picture;

        let data_offset = match handle.offset().checked_add(bias) {
            Some(offset) => offset,
            None => {
                let err = ArenaError::OutOfBounds {
                    offset: handle.offset(),
                    len: bias as usize + len,
                    size: allocator.arena().len(),
                };
                allocator.release(handle)?;
                return Err(err.into());
            }
        };

        if is_last {
            log::debug!(
                "picture at {} is in the last free block, copying {} bytes",
                handle.offset(),
                len
            );
            let mut data = vec![0u8; len];
            let copied = allocator.arena().read(data_offset, &mut data);
            allocator.release(handle)?;
            copied?;

            return Ok(Self::heap(data));
        }

        // Check the range once so accesses to the slice cannot fail later.
        if let Err(e) = allocator.arena().reader(data_offset, len) {
            allocator.release(handle)?;
            return Err(e.into());
        }

        Ok(Self::arena(allocator, handle, bias, len))
    }

    /// Takes `handle` out of the ranges the session returns at close: it now lives as long as the
    /// buffer does.
    fn arena(
        allocator: &BufferAllocator<D>,
        handle: BufferHandle,
        bias: u32,
        len: usize,
    ) -> Self {
        allocator.detach(&handle);
        Self {
            backing: Backing::Arena {
                handle: Some(handle),
                bias,
                allocator: allocator.clone(),
            },
            len,
        }
    }

    /// Returns a writable buffer of `len` bytes, in the arena if the host has room for it and on
    /// the heap otherwise.
    pub fn allocate(allocator: &BufferAllocator<D>, len: usize) -> Self {
        let handle = u32::try_from(len)
            .ok()
            .and_then(|size| allocator.try_secure(size));

        match handle {
            Some(handle) => Self::arena(allocator, handle, 0, len),
            None => {
                log::debug!("no room in the arena for {} bytes, using the heap", len);
                Self::heap(vec![0u8; len])
            }
        }
    }

    fn heap(data: Vec<u8>) -> Self {
        Self {
            len: data.len(),
            backing: Backing::Heap(data),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the buffer aliases arena memory.
    pub fn is_arena_backed(&self) -> bool {
        matches!(self.backing, Backing::Arena { .. })
    }

    /// Arena range aliased by this buffer, if any.
    pub fn arena_handle(&self) -> Option<&BufferHandle> {
        match &self.backing {
            Backing::Arena { handle, .. } => handle.as_ref(),
            Backing::Heap(_) => None,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Arena {
                handle: Some(handle),
                bias,
                allocator,
            } => {
                let offset = ArenaOffset::new(handle.offset().get() + *bias);
                // SAFETY: we hold the handle of the range, and its bounds have been checked at
                // creation.
                unsafe { allocator.arena().slice(offset, self.len) }.unwrap_or(&[])
            }
            Backing::Arena { handle: None, .. } => &[],
            Backing::Heap(data) => data.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.backing {
            Backing::Arena {
                handle: Some(handle),
                bias,
                allocator,
            } => {
                let offset = ArenaOffset::new(handle.offset().get() + *bias);
                // SAFETY: we hold the handle of the range and `self` is borrowed mutably, so no
                // other view of it exists.
                unsafe { allocator.arena().slice_mut(offset, len) }.unwrap_or(&mut [])
            }
            Backing::Arena { handle: None, .. } => &mut [],
            Backing::Heap(data) => data.as_mut_slice(),
        }
    }

    fn release_backing(&mut self) -> Result<()> {
        match &mut self.backing {
            Backing::Arena {
                handle, allocator, ..
            } => match handle.take() {
                Some(handle) => allocator.release_detached(handle),
                None => Ok(()),
            },
            Backing::Heap(_) => Ok(()),
        }
    }

    /// Gives the buffer back, returning its arena range to the host if it has one.
    pub fn release(mut self) -> Result<()> {
        self.release_backing()
    }
}

impl<D: CodecDevice> Drop for OutputBuffer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.release_backing() {
            log::error!("failed to release output buffer: {:#}", e);
        }
    }
}

impl<D: CodecDevice> AsRef<[u8]> for OutputBuffer<D> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<D: CodecDevice> AsMut<[u8]> for OutputBuffer<D> {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl<D: CodecDevice> fmt::Debug for OutputBuffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.backing {
            Backing::Arena { handle, bias, .. } => format!("arena({:?}, bias {:#x})", handle, bias),
            Backing::Heap(_) => "heap".to_string(),
        };
        f.debug_struct("OutputBuffer")
            .field("backing", &backing)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::arena::Arena;
    use crate::context::ContextIndex;
    use crate::devices::loopback::LoopbackHost;
    use crate::protocol::ProtocolVersion;
    use crate::protocol::PICTURE_BUFFER_BIAS;

    fn setup(pool_size: u32) -> (LoopbackHost, BufferAllocator<LoopbackHost>) {
        let host = LoopbackHost::with_pool_size(ProtocolVersion::V3, pool_size).unwrap();
        let arena: Arena = host.map_arena(host.arena_size()).unwrap();
        let alloc = BufferAllocator::new(Arc::new(host.clone()), Arc::new(arena));
        (host, alloc)
    }

    fn picture(
        alloc: &BufferAllocator<LoopbackHost>,
        size: u32,
        bias: u32,
        is_last: bool,
    ) -> PendingPicture {
        let handle = alloc
            .secure(ContextIndex::new(1).unwrap(), size + bias)
            .unwrap();
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        alloc
            .arena()
            .write(handle.offset().checked_add(bias).unwrap(), &data)
            .unwrap();
        PendingPicture {
            handle,
            bias,
            is_last,
        }
    }

    #[test]
    fn picture_aliases_the_arena() {
        let (host, alloc) = setup(0x10000);
        let pending = picture(&alloc, 64, PICTURE_BUFFER_BIAS, false);
        let offset = pending.handle.offset();

        let buffer = OutputBuffer::from_picture(&alloc, pending, 64).unwrap();
        assert!(buffer.is_arena_backed());
        assert_eq!(buffer.arena_handle().unwrap().offset(), offset);
        assert_eq!(buffer.as_slice()[..4], [0, 1, 2, 3]);
        assert_eq!(buffer.len(), 64);
        assert_eq!(host.held_blocks(), 1);
        assert_eq!(alloc.held_count(), 0);
        assert_eq!(alloc.release_all(), 0);
        assert_eq!(buffer.as_slice()[..4], [0, 1, 2, 3]);

        // Dropping the buffer returns exactly its range.
        drop(buffer);
        assert_eq!(host.held_blocks(), 0);
        assert_eq!(alloc.held_count(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn last_block_is_copied_and_released() {
        let (host, alloc) = setup(0x10000);
        let pending = picture(&alloc, 32, 0, true);

        let buffer = OutputBuffer::from_picture(&alloc, pending, 32).unwrap();
        assert!(!buffer.is_arena_backed());
        assert_eq!(host.held_blocks(), 0);
        assert_eq!(buffer.as_slice()[31], 31);
        buffer.release().unwrap();
        assert!(host.violations().is_empty());
    }

    #[test]
    fn allocate_falls_back_to_heap() {
        let (host, alloc) = setup(0x1000);

        let mut first = OutputBuffer::allocate(&alloc, 0x1000);
        assert!(first.is_arena_backed());
        first.as_mut_slice().fill(0x11);

        let mut second = OutputBuffer::allocate(&alloc, 16);
        assert!(!second.is_arena_backed());
        second.as_mut_slice().copy_from_slice(&[0x22; 16]);
        assert_eq!(second.as_slice(), &[0x22; 16]);

        assert_eq!(first.as_slice()[0xfff], 0x11);
        first.release().unwrap();
        second.release().unwrap();
        assert_eq!(host.held_blocks(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn out_of_bounds_picture_is_released() {
        let (host, alloc) = setup(0x10000);
        let pending = picture(&alloc, 16, 0, false);

        let len = alloc.arena().len();
        assert!(OutputBuffer::from_picture(&alloc, pending, len).is_err());
        assert_eq!(host.held_blocks(), 0);
    }
}
