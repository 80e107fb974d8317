// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The three generations of the wire protocol.
//!
//! All generations run the same codec operations, but differ in how many device calls an
//! operation takes and in where requests and responses are placed:
//!
//! * [`v1::Legacy`] writes a command record to the device, keeps structured fields in a
//!   per-context metadata slot, and fetches outputs with a separate call.
//! * [`v2::Releasing`] fuses the command and the release of the input buffer into a single call.
//! * [`v3::Fetching`] fuses the command and the allocation of the result buffer, and frames
//!   requests in allocator buffers only.
//!
//! The generation is picked once per session from the version reported by the host.

pub mod v1;
pub mod v2;
pub mod v3;

use crate::allocator::BufferAllocator;
use crate::allocator::BufferHandle;
use crate::context::ContextIndex;
use crate::error::CodecError;
use crate::error::Result;
use crate::io::WireType;
use crate::marshal::Reply;
use crate::marshal::Response;
use crate::protocol::CodecOp;
use crate::protocol::ProtocolVersion;
use crate::protocol::VideoDecodeOutput;
use crate::CodecDevice;

/// A picture produced by the host and waiting to be handed to the pipeline.
#[derive(Debug)]
pub struct PendingPicture {
    pub(crate) handle: BufferHandle,
    /// Distance from the start of the buffer to the pixel data.
    pub(crate) bias: u32,
    /// The buffer is the last free block of the arena.
    pub(crate) is_last: bool,
}

impl PendingPicture {
    pub fn is_last(&self) -> bool {
        self.is_last
    }
}

/// Strategy implementing one generation of the wire protocol.
pub trait WireProtocol {
    fn version(&self) -> ProtocolVersion;

    /// Runs `op` on context `ctx` with request `fields` and `payload`, and returns its response.
    fn transact<D, T, F>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        op: CodecOp,
        fields: F,
        payload: &[u8],
    ) -> Result<Response<T::Fields>>
    where
        D: CodecDevice,
        T: Reply,
        F: WireType;

    /// Runs an operation without request nor response, like deinit or flush.
    fn control<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        op: CodecOp,
    ) -> Result<()>;

    /// Asks the host to copy the last decoded picture of `ctx`, `size` bytes long, into a new
    /// buffer.
    fn picture_copy<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        size: u32,
    ) -> Result<PendingPicture>;
}

/// The wire protocol selected for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    V1(v1::Legacy),
    V2(v2::Releasing),
    V3(v3::Fetching),
}

impl Transport {
    pub fn new(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V1 => Transport::V1(v1::Legacy),
            ProtocolVersion::V2 => Transport::V2(v2::Releasing),
            ProtocolVersion::V3 => Transport::V3(v3::Fetching),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Transport::V1(p) => p.version(),
            Transport::V2(p) => p.version(),
            Transport::V3(p) => p.version(),
        }
    }

    pub fn transact<D, T, F>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        op: CodecOp,
        fields: F,
        payload: &[u8],
    ) -> Result<Response<T::Fields>>
    where
        D: CodecDevice,
        T: Reply,
        F: WireType,
    {
        log::debug!("ctx {}: {:?} with {} payload bytes", ctx.get(), op, payload.len());
        match self {
            Transport::V1(p) => p.transact::<D, T, F>(alloc, ctx, op, fields, payload),
            Transport::V2(p) => p.transact::<D, T, F>(alloc, ctx, op, fields, payload),
            Transport::V3(p) => p.transact::<D, T, F>(alloc, ctx, op, fields, payload),
        }
    }

    pub fn control<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        op: CodecOp,
    ) -> Result<()> {
        log::debug!("ctx {}: {:?}", ctx.get(), op);
        match self {
            Transport::V1(p) => p.control(alloc, ctx, op),
            Transport::V2(p) => p.control(alloc, ctx, op),
            Transport::V3(p) => p.control(alloc, ctx, op),
        }
    }

    pub fn picture_copy<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        size: u32,
    ) -> Result<PendingPicture> {
        match self {
            Transport::V1(p) => p.picture_copy(alloc, ctx, size),
            Transport::V2(p) => p.picture_copy(alloc, ctx, size),
            Transport::V3(p) => p.picture_copy(alloc, ctx, size),
        }
    }

    /// Returns the fused decode-and-copy strategy if this transport supports it.
    pub fn fused_decode(&self) -> Option<&v3::Fetching> {
        match self {
            Transport::V3(p) => Some(p),
            _ => None,
        }
    }
}

/// Response of a decode that may have left its picture in a result buffer.
pub type FusedDecode = (Response<VideoDecodeOutput>, Option<PendingPicture>);

/// Converts the status of a device call into an error if it is negative.
pub(crate) fn check_status(call: crate::protocol::DeviceCall, status: i32) -> Result<i32> {
    if status < 0 {
        log::error!("device call {:?} returned status {}", call, status);
        Err(CodecError::protocol(call, status))
    } else {
        Ok(status)
    }
}

/// Payload size as carried in the size fields of the device calls.
pub(crate) fn wire_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge(len))
}

/// Size as carried in the signed size fields of the wire records.
pub(crate) fn signed_wire_size(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| CodecError::TooLarge(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_lengths_are_caller_errors() {
        assert_eq!(wire_size(4096).unwrap(), 4096);
        assert_eq!(signed_wire_size(0).unwrap(), 0);

        let too_big = i32::MAX as usize + 1;
        assert!(matches!(
            signed_wire_size(too_big),
            Err(CodecError::TooLarge(len)) if len == too_big
        ));
        let err = signed_wire_size(usize::MAX).unwrap_err();
        assert_eq!(err.status(), -libc::EMSGSIZE);
    }
}
