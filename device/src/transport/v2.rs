// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Second generation of the protocol.
//!
//! Requests and responses are laid out as in the first generation, but the command and the
//! release of the input buffer are fused into a single invoke-and-release call.

use crate::allocator::BufferAllocator;
use crate::allocator::BufferHandle;
use crate::context::ContextIndex;
use crate::error::CodecError;
use crate::error::Result;
use crate::io::WireType;
use crate::io::WriteWireExt;
use crate::marshal::Reply;
use crate::marshal::Response;
use crate::protocol::CodecOp;
use crate::protocol::DeviceCall;
use crate::protocol::ProtocolVersion;
use crate::protocol::SlotHeader;
use crate::protocol::SLOT_HEADER_SIZE;
use crate::transport::check_status;
use crate::transport::v1;
use crate::transport::PendingPicture;
use crate::transport::WireProtocol;
use crate::CodecDevice;
use crate::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Releasing;

impl Releasing {
    /// Runs `cmd`, handing `input` over to the host.
    ///
    /// The host only takes the input buffer if the call succeeds. Otherwise it is released here.
    fn invoke<D: CodecDevice>(
        alloc: &BufferAllocator<D>,
        cmd: &Command,
        input: Option<BufferHandle>,
    ) -> Result<()> {
        let status = alloc.device().invoke_and_release(cmd).map_err(|e| {
            log::error!("failed to invoke {:?}: {}", cmd, e);
            CodecError::protocol(DeviceCall::InvokeAndRelease, e)
        });

        match (status, input) {
            (Ok(status), input) => {
                if let Some(input) = input {
                    alloc.surrender(input);
                }
                check_status(DeviceCall::InvokeAndRelease, status).map(|_| ())
            }
            (Err(e), Some(input)) => {
                if let Err(release_err) = alloc.release(input) {
                    log::error!("failed to release input buffer: {:#}", release_err);
                }
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }
}

impl WireProtocol for Releasing {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V2
    }

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
        F: WireType,
    {
        let (input, inline) = match op {
            CodecOp::Init => (None, payload),
            _ => (v1::stage_payload(alloc, ctx, payload)?, &[][..]),
        };

        if let Err(e) = v1::write_slot(alloc, ctx, op, input.as_ref(), fields, inline) {
            if let Some(input) = input {
                let _ = alloc.release(input);
            }
            return Err(e);
        }

        let cmd = Command::new(op, ctx.get(), input.as_ref().map(BufferHandle::offset));
        Self::invoke(alloc, &cmd, input)?;

        v1::read_response::<D, T>(alloc, ctx)
    }

    fn control<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        op: CodecOp,
    ) -> Result<()> {
        let mut w = alloc
            .arena()
            .writer(v1::slot_offset(ctx)?, SLOT_HEADER_SIZE as usize)?;
        w.write_obj(SlotHeader {
            api_index: op as i32,
            mem_offset: u32::MAX,
        })?;

        Self::invoke(alloc, &Command::new(op, ctx.get(), None), None)
    }

    fn picture_copy<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        size: u32,
    ) -> Result<PendingPicture> {
        self.control(alloc, ctx, CodecOp::PictureCopy)?;
        v1::fetch_picture(alloc, ctx, size)
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::arena::Arena;
    use crate::devices::loopback::test_utils::init_context;
    use crate::devices::loopback::HostCall;
    use crate::devices::loopback::LoopbackHost;
    use crate::marshal::DecodeAudio;
    use crate::protocol::AudioDecodeInput;
    use crate::protocol::AudioDecodeOutput;

    #[test]
    fn input_is_released_by_the_host() {
        let host = LoopbackHost::new(ProtocolVersion::V2).unwrap();
        let arena: Arena = host.map_arena(host.arena_size()).unwrap();
        let alloc = BufferAllocator::new(Arc::new(host.clone()), Arc::new(arena));
        let ctx = init_context(&Releasing, &alloc, "aac");
        host.take_calls();

        let response = Releasing
            .transact::<_, DecodeAudio, _>(
                &alloc,
                ctx,
                CodecOp::DecodeAudio,
                AudioDecodeInput { inbuf_size: 3 },
                &[1, 2, 3],
            )
            .unwrap();

        match response {
            Response::Ok {
                result,
                fields,
                payload,
            } => {
                assert_eq!(result, 3);
                assert_eq!({ fields.have_data }, 6);
                assert_eq!(payload, vec![1, 1, 2, 2, 3, 3]);
                assert_ne!(fields, AudioDecodeOutput::default());
            }
            Response::Failed(r) => panic!("decode failed with {}", r),
        }

        // No explicit release: the host took the input back itself.
        assert_eq!(
            host.take_calls(),
            vec![
                HostCall::SecureBuffer,
                HostCall::InvokeAndRelease(CodecOp::DecodeAudio),
                HostCall::PutDataIntoBuffer,
                HostCall::ReleaseBuffer,
            ]
        );
        assert_eq!(alloc.held_count(), 0);
        assert_eq!(host.held_blocks(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn uninitialized_context_is_rejected() {
        let host = LoopbackHost::new(ProtocolVersion::V2).unwrap();
        let arena: Arena = host.map_arena(host.arena_size()).unwrap();
        let alloc = BufferAllocator::new(Arc::new(host.clone()), Arc::new(arena));
        let ctx = ContextIndex::new(host.context_index().unwrap()).unwrap();

        // Nothing was initialized on this context: the host reports a codec failure.
        let response = Releasing
            .transact::<_, DecodeAudio, _>(
                &alloc,
                ctx,
                CodecOp::DecodeAudio,
                AudioDecodeInput { inbuf_size: 1 },
                &[1],
            )
            .unwrap();
        assert_eq!(response, Response::Failed(-1));
        assert_eq!(host.held_blocks(), 0);
        assert!(host.violations().is_empty());
    }
}
