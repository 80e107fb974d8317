// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate is the guest-side transport of a paravirtualized codec device.
//!
//! A media pipeline running in the guest hands compressed or raw buffers to this crate, which
//! forwards them to a codec engine running on the host and returns the results. The two sides
//! communicate through a fixed-size memory region shared between guest and host (the
//! [`arena::Arena`]) and a small set of blocking device-control calls.
//!
//! # Traits to implement by the device backend
//!
//! Everything that touches the device itself goes through the [`CodecDevice`] trait. The crate
//! provides two implementations:
//!
//! * [`devices::chardev::CharDevice`], which talks to the real device node using `ioctl` and
//!   `write`,
//! * [`devices::loopback::LoopbackHost`] (behind the `loopback` feature), which implements the
//!   host side in-process over a `memfd`. It is mostly useful for testing.
//!
//! # Anatomy of a session
//!
//! A pipeline element opens a [`session::DeviceSession`], which maps the arena (once per process,
//! see [`session::ArenaRegistry`]) and discovers the protocol version spoken by the host. The
//! session then uses the matching [`transport`] strategy to run codec operations, marshaling
//! their parameters with [`marshal`] and claiming arena memory with [`allocator`]. Decoded
//! pictures are handed back as [`handoff::OutputBuffer`]s, which alias arena memory whenever it is
//! safe to do so.

pub mod allocator;
pub mod arena;
pub mod context;
pub mod devices;
pub mod elements;
pub mod error;
pub mod handoff;
pub mod io;
pub mod marshal;
pub mod memfd;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::CodecError;
pub use session::DeviceSession;

use arena::Arena;
use arena::ArenaOffset;
use protocol::CodecOp;
use protocol::IoctlData;

/// A codec operation addressed to the host, as carried by the device-control calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub op: CodecOp,
    pub ctx_index: u32,
    /// Location of the request in the arena, if the operation has one.
    pub offset: Option<ArenaOffset>,
}

impl Command {
    pub fn new(op: CodecOp, ctx_index: u32, offset: Option<ArenaOffset>) -> Self {
        Self {
            op,
            ctx_index,
            offset,
        }
    }

    /// Offset as written on the wire, `-1` meaning "no buffer".
    pub fn mem_offset(&self) -> u32 {
        self.offset.map(ArenaOffset::get).unwrap_or(u32::MAX)
    }

    pub fn ioctl_data(&self, buffer_size: i32) -> IoctlData {
        IoctlData {
            api_index: self.op as u32,
            ctx_index: self.ctx_index,
            mem_offset: self.mem_offset(),
            buffer_size,
        }
    }
}

/// Result of a fused invoke-and-fetch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResult {
    /// Non-negative status returned by the call. `1` means the result buffer is the last free
    /// block of the arena.
    pub status: i32,
    /// Host-allocated result buffer, now owned by the guest.
    pub offset: Option<ArenaOffset>,
}

impl FetchResult {
    pub fn is_last(&self) -> bool {
        self.status == 1
    }
}

/// Output buffer handed to the guest by a put-data-into-buffer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutData {
    pub offset: ArenaOffset,
    /// Whether this buffer is the last free block of the arena, in which case it must not be kept
    /// by downstream consumers.
    pub is_last: bool,
}

/// Device-control interface of the codec device.
///
/// Every method is a blocking call to the host. Errors are `errno` values, like the ones returned
/// by `ioctl(2)`.
///
/// Implementations must be usable from several threads at once: the host arbitrates concurrent
/// calls.
pub trait CodecDevice: Send + Sync {
    /// Map `len` bytes of device memory, starting at offset 0.
    fn map_arena(&self, len: usize) -> Result<Arena, i32>;

    fn version(&self) -> Result<u32, i32>;

    /// Returns the size in bytes of the codec element list.
    fn elements_size(&self) -> Result<u32, i32>;
    /// Fills `buf` with the codec element list.
    fn elements(&self, buf: &mut [u8]) -> Result<(), i32>;

    /// Reserves a new context index on the host.
    fn context_index(&self) -> Result<u32, i32>;

    /// Claims `size` bytes of arena on behalf of context `ctx`. A size of 0 requests the smallest
    /// block the host hands out.
    fn secure_buffer(&self, ctx: u32, size: u32) -> Result<ArenaOffset, i32>;
    /// Like `secure_buffer`, but returns `None` if the host has no room left.
    fn try_secure_buffer(&self, size: u32) -> Result<Option<ArenaOffset>, i32>;
    /// Returns a previously secured range to the host.
    fn release_buffer(&self, offset: ArenaOffset) -> Result<(), i32>;

    /// Protocol v1: writes the command record to the device, which runs it synchronously.
    fn write_command(&self, cmd: &Command) -> Result<(), i32>;
    /// Protocol v2: runs `cmd` and gives its request buffer back to the host's free pool.
    /// Returns the status of the call.
    fn invoke_and_release(&self, cmd: &Command) -> Result<i32, i32>;
    /// Protocol v3: runs `cmd`, consuming its request buffer, and returns the result buffer
    /// allocated by the host. `buffer_size` is the size of the result the guest expects, if it
    /// knows it.
    fn invoke_and_fetch(&self, cmd: &Command, buffer_size: i32) -> Result<FetchResult, i32>;
    /// Protocols v1 and v2: retrieves the output buffer produced by the last operation of `ctx`.
    fn put_data_into_buffer(&self, ctx: u32, size: u32) -> Result<PutData, i32>;

    /// Closes the device, reporting any error that happens while doing so.
    fn close(self) -> Result<(), i32>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_without_buffer_uses_sentinel_offset() {
        let cmd = Command::new(CodecOp::Deinit, 3, None);
        let data = cmd.ioctl_data(-1);

        assert_eq!(
            data,
            IoctlData {
                api_index: 6,
                ctx_index: 3,
                mem_offset: u32::MAX,
                buffer_size: -1,
            }
        );

        let cmd = Command::new(CodecOp::DecodeVideo, 1, Some(ArenaOffset::new(0x2000)));
        assert_eq!(cmd.mem_offset(), 0x2000);
        assert_eq!({ cmd.ioctl_data(0).api_index }, 1);
    }
}
