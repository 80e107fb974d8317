// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Claiming and returning ranges of the arena.
//!
//! The host owns the free-space bookkeeping of the arena: the guest asks for a range of a given
//! size and gets an offset back, without ever knowing which ranges are free. The only state kept
//! on the guest side is the set of offsets it currently holds, so leftovers can be returned when a
//! session closes and a stale offset is never released twice.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::arena::Arena;
use crate::arena::ArenaOffset;
use crate::arena::ArenaReader;
use crate::arena::ArenaWriter;
use crate::context::ContextIndex;
use crate::error::CodecError;
use crate::error::Result;
use crate::protocol::DeviceCall;
use crate::CodecDevice;

/// A range of the arena held by the guest.
///
/// Handles are neither `Clone` nor `Copy`: giving one back to the host, either by releasing it or
/// by passing it to an operation that consumes it, takes it by value.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct BufferHandle {
    offset: ArenaOffset,
    size: u32,
}

impl BufferHandle {
    pub fn offset(&self) -> ArenaOffset {
        self.offset
    }

    /// Size requested when the handle was secured. 0 if unknown.
    pub fn size(&self) -> u32 {
        self.size
    }
}

pub struct BufferAllocator<D: CodecDevice> {
    device: Arc<D>,
    arena: Arc<Arena>,
    held: Arc<Mutex<BTreeSet<ArenaOffset>>>,
}

impl<D: CodecDevice> Clone for BufferAllocator<D> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            arena: Arc::clone(&self.arena),
            held: Arc::clone(&self.held),
        }
    }
}

impl<D: CodecDevice> BufferAllocator<D> {
    pub fn new(device: Arc<D>, arena: Arc<Arena>) -> Self {
        Self {
            device,
            arena,
            held: Default::default(),
        }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<ArenaOffset>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, offset: ArenaOffset) {
        if !self.held().insert(offset) {
            log::warn!("host handed out offset {} which is already held", offset);
        }
    }

    /// Claims `size` bytes on behalf of `ctx`. A size of 0 requests the smallest block the host
    /// hands out.
    pub fn secure(&self, ctx: ContextIndex, size: u32) -> Result<BufferHandle> {
        let offset = self.device.secure_buffer(ctx.get(), size).map_err(|e| {
            log::error!("failed to secure {} bytes for context {}: {}", size, ctx.get(), e);
            CodecError::AllocationExhausted
        })?;
        self.track(offset);

        Ok(BufferHandle { offset, size })
    }

    /// Claims `size` bytes if the host has room for them.
    pub fn try_secure(&self, size: u32) -> Option<BufferHandle> {
        match self.device.try_secure_buffer(size) {
            Ok(Some(offset)) => {
                self.track(offset);
                Some(BufferHandle { offset, size })
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("try-secure of {} bytes failed: {}", size, e);
                None
            }
        }
    }

    /// Takes ownership of a range the host allocated on our behalf.
    pub(crate) fn adopt(&self, offset: ArenaOffset, size: u32) -> BufferHandle {
        self.track(offset);
        BufferHandle { offset, size }
    }

    /// Forgets `handle` after it has been given to the host by an operation that consumes it.
    pub(crate) fn surrender(&self, handle: BufferHandle) -> ArenaOffset {
        self.held().remove(&handle.offset);
        handle.offset
    }

    /// Stops tracking `handle`, whose new owner gives it back with [`Self::release_detached`].
    /// A session close leaves detached ranges alone.
    pub(crate) fn detach(&self, handle: &BufferHandle) {
        self.held().remove(&handle.offset);
    }

    /// Returns a handle previously passed to [`Self::detach`] to the host.
    pub(crate) fn release_detached(&self, handle: BufferHandle) -> Result<()> {
        self.device.release_buffer(handle.offset).map_err(|e| {
            log::error!("failed to release offset {}: {}", handle.offset, e);
            CodecError::protocol(DeviceCall::ReleaseBuffer, e)
        })
    }

    /// Returns `handle` to the host.
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        if !self.held().remove(&handle.offset) {
            // Already returned by a session close.
            log::warn!("not releasing offset {} twice", handle.offset);
            return Ok(());
        }

        self.device.release_buffer(handle.offset).map_err(|e| {
            log::error!("failed to release offset {}: {}", handle.offset, e);
            CodecError::protocol(DeviceCall::ReleaseBuffer, e)
        })
    }

    /// Returns every range still held to the host. Failures are logged and skipped.
    ///
    /// Returns the number of ranges that have been released.
    pub fn release_all(&self) -> usize {
        let leftovers = std::mem::take(&mut *self.held());
        let mut released = 0;

        for offset in leftovers {
            log::debug!("releasing leftover offset {}", offset);
            match self.device.release_buffer(offset) {
                Ok(()) => released += 1,
                Err(e) => log::error!("failed to release leftover offset {}: {}", offset, e),
            }
        }

        released
    }

    /// Number of ranges currently held by the guest.
    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    /// Returns a reader over the range of `handle`, up to the end of the arena if its size is
    /// unknown.
    pub fn reader(&self, handle: &BufferHandle) -> Result<ArenaReader<'_>> {
        Ok(match handle.size {
            0 => self.arena.reader_to_end(handle.offset)?,
            size => self.arena.reader(handle.offset, size as usize)?,
        })
    }

    /// Returns a writer over the range of `handle`.
    pub fn writer(&self, handle: &BufferHandle) -> Result<ArenaWriter<'_>> {
        Ok(self.arena.writer(handle.offset, handle.size as usize)?)
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use std::io::Read;
    use std::io::Write;

    use super::*;
    use crate::devices::loopback::LoopbackHost;
    use crate::protocol::ProtocolVersion;

    fn allocator(host: LoopbackHost) -> BufferAllocator<LoopbackHost> {
        let arena = Arc::new(host.map_arena(host.arena_size()).unwrap());
        BufferAllocator::new(Arc::new(host), arena)
    }

    fn ctx() -> ContextIndex {
        ContextIndex::new(1).unwrap()
    }

    #[test]
    fn secure_write_read_release() {
        let allocator = allocator(LoopbackHost::new(ProtocolVersion::V3).unwrap());

        let handle = allocator.secure(ctx(), 64).unwrap();
        allocator.writer(&handle).unwrap().write_all(&[0xa5; 64]).unwrap();
        let mut data = Vec::new();
        allocator
            .reader(&handle)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, vec![0xa5; 64]);

        assert_eq!(allocator.held_count(), 1);
        allocator.release(handle).unwrap();
        assert_eq!(allocator.held_count(), 0);
        assert!(allocator.device().violations().is_empty());
    }

    #[test]
    fn exhausted_pool() {
        let host = LoopbackHost::with_pool_size(ProtocolVersion::V3, 0x1000).unwrap();
        let allocator = allocator(host);

        let big = allocator.secure(ctx(), 0x1000).unwrap();
        assert!(matches!(
            allocator.secure(ctx(), 1),
            Err(CodecError::AllocationExhausted)
        ));
        assert!(allocator.try_secure(1).is_none());

        allocator.release(big).unwrap();
        let small = allocator.try_secure(1).unwrap();
        allocator.release(small).unwrap();
        assert!(allocator.device().violations().is_empty());
    }

    #[test]
    fn release_all_returns_leftovers_once() {
        let allocator = allocator(LoopbackHost::new(ProtocolVersion::V2).unwrap());

        let first = allocator.secure(ctx(), 16).unwrap();
        let _second = allocator.secure(ctx(), 0).unwrap();
        assert_eq!(allocator.release_all(), 2);
        assert_eq!(allocator.device().held_blocks(), 0);

        // The handle outlived the close, releasing it again must not reach the host.
        allocator.release(first).unwrap();
        assert!(allocator.device().violations().is_empty());
    }

    #[test]
    fn surrendered_handles_are_not_released() {
        let allocator = allocator(LoopbackHost::new(ProtocolVersion::V2).unwrap());

        let handle = allocator.secure(ctx(), 16).unwrap();
        let offset = allocator.surrender(handle);
        assert_eq!(allocator.held_count(), 0);
        assert_eq!(allocator.release_all(), 0);
        allocator.device().release_buffer(offset).unwrap();
    }

    #[test]
    fn detached_handles_survive_release_all() {
        let allocator = allocator(LoopbackHost::new(ProtocolVersion::V3).unwrap());

        let handle = allocator.secure(ctx(), 16).unwrap();
        allocator.detach(&handle);
        assert_eq!(allocator.release_all(), 0);
        assert_eq!(allocator.device().held_blocks(), 1);

        allocator.release_detached(handle).unwrap();
        assert_eq!(allocator.device().held_blocks(), 0);
        assert!(allocator.device().violations().is_empty());
    }
}
