// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Third generation of the protocol.
//!
//! There are no metadata slots anymore. A request is framed in a buffer secured for it, and a
//! single invoke-and-fetch call runs it, takes the request buffer back and returns the offset of
//! a result buffer allocated by the host.
//!
//! This generation also offers a fused decode-and-copy operation, whose result buffer holds the
//! response followed by the decoded picture, [`PICTURE_BUFFER_BIAS`] bytes after its start.

use crate::allocator::BufferAllocator;
use crate::allocator::BufferHandle;
use crate::arena::ArenaOffset;
use crate::context::ContextIndex;
use crate::error::CodecError;
use crate::error::Result;
use crate::io::WireType;
use crate::marshal;
use crate::marshal::DecodeVideo;
use crate::marshal::Reply;
use crate::marshal::Response;
use crate::protocol::CodecOp;
use crate::protocol::DeviceCall;
use crate::protocol::ProtocolVersion;
use crate::protocol::VideoDecodeInput;
use crate::protocol::PICTURE_BUFFER_BIAS;
use crate::transport::check_status;
use crate::transport::signed_wire_size;
use crate::transport::wire_size;
use crate::transport::FusedDecode;
use crate::transport::PendingPicture;
use crate::transport::WireProtocol;
use crate::CodecDevice;
use crate::Command;
use crate::FetchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetching;

impl Fetching {
    /// Frames `fields` and `payload` into a buffer secured for them.
    fn stage_request<D, F>(
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        fields: F,
        payload: &[u8],
    ) -> Result<BufferHandle>
    where
        D: CodecDevice,
        F: WireType,
    {
        let size = wire_size(marshal::request_size::<F>(payload.len()))?;
        let input = alloc.secure(ctx, size)?;

        let written = alloc
            .writer(&input)
            .and_then(|mut w| Ok(marshal::encode_request(fields, payload, &mut w)?));
        match written {
            Ok(_) => Ok(input),
            Err(e) => {
                let _ = alloc.release(input);
                Err(e)
            }
        }
    }

    /// Runs `cmd`, handing `input` over to the host, and returns the result of the call.
    fn invoke<D: CodecDevice>(
        alloc: &BufferAllocator<D>,
        op: CodecOp,
        ctx: ContextIndex,
        input: Option<BufferHandle>,
        buffer_size: i32,
    ) -> Result<FetchResult> {
        let cmd = Command::new(op, ctx.get(), input.as_ref().map(BufferHandle::offset));
        let result = alloc
            .device()
            .invoke_and_fetch(&cmd, buffer_size)
            .map_err(|e| {
                log::error!("failed to invoke {:?}: {}", cmd, e);
                CodecError::protocol(DeviceCall::InvokeAndFetch, e)
            });

        match (result, input) {
            (Ok(result), input) => {
                if let Some(input) = input {
                    alloc.surrender(input);
                }
                if let Err(e) = check_status(DeviceCall::InvokeAndFetch, result.status) {
                    if let Some(offset) = result.offset {
                        if let Err(release_err) = alloc.release(alloc.adopt(offset, 0)) {
                            log::error!("failed to release result buffer: {:#}", release_err);
                        }
                    }
                    return Err(e);
                }
                Ok(result)
            }
            (Err(e), Some(input)) => {
                if let Err(release_err) = alloc.release(input) {
                    log::error!("failed to release request buffer: {:#}", release_err);
                }
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    fn result_buffer(result: &FetchResult) -> Result<ArenaOffset> {
        result.offset.ok_or_else(|| {
            log::error!("host returned no result buffer");
            CodecError::protocol(DeviceCall::InvokeAndFetch, libc::ENODATA)
        })
    }

    /// Decodes a video frame and has the host copy the resulting picture, `picture_size` bytes
    /// long, into the same result buffer.
    ///
    /// If a picture was produced, it is returned alongside the response and must be handed to
    /// the pipeline or released.
    pub fn decode_and_copy<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        fields: VideoDecodeInput,
        payload: &[u8],
        picture_size: u32,
    ) -> Result<FusedDecode> {
        let buffer_size = signed_wire_size(picture_size as usize)?;
        let input = Self::stage_request(alloc, ctx, fields, payload)?;
        let result = Self::invoke(
            alloc,
            CodecOp::DecodeVideoAndPictureCopy,
            ctx,
            Some(input),
            buffer_size,
        )?;

        let output = alloc.adopt(
            Self::result_buffer(&result)?,
            PICTURE_BUFFER_BIAS + picture_size,
        );
        let response = alloc
            .reader(&output)
            .and_then(|mut r| Ok(marshal::decode_response::<DecodeVideo, _>(&mut r)?));

        match response {
            Ok(Response::Ok {
                result: len,
                fields,
                payload,
            }) if len >= 0 && fields.got_picture != 0 => {
                let picture = PendingPicture {
                    handle: output,
                    bias: PICTURE_BUFFER_BIAS,
                    is_last: result.is_last(),
                };
                Ok((
                    Response::Ok {
                        result: len,
                        fields,
                        payload,
                    },
                    Some(picture),
                ))
            }
            response => {
                if let Err(e) = alloc.release(output) {
                    log::error!("failed to release result buffer: {:#}", e);
                }
                response.map(|r| (r, None))
            }
        }
    }
}

impl WireProtocol for Fetching {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V3
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
        let input = Self::stage_request(alloc, ctx, fields, payload)?;
        let result = Self::invoke(alloc, op, ctx, Some(input), 0)?;

        let output = alloc.adopt(Self::result_buffer(&result)?, 0);
        let response = alloc
            .reader(&output)
            .and_then(|mut r| Ok(marshal::decode_response::<T, _>(&mut r)?));
        if let Err(e) = alloc.release(output) {
            log::error!("failed to release result buffer: {:#}", e);
        }

        response
    }

    fn control<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        op: CodecOp,
    ) -> Result<()> {
        let result = Self::invoke(alloc, op, ctx, None, -1)?;
        if let Some(offset) = result.offset {
            log::warn!("{:?} unexpectedly returned a result buffer, releasing it", op);
            alloc.release(alloc.adopt(offset, 0))?;
        }

        Ok(())
    }

    fn picture_copy<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        size: u32,
    ) -> Result<PendingPicture> {
        let buffer_size = signed_wire_size(size as usize)?;
        let result = Self::invoke(alloc, CodecOp::PictureCopy, ctx, None, buffer_size)?;

        Ok(PendingPicture {
            handle: alloc.adopt(Self::result_buffer(&result)?, size),
            bias: 0,
            is_last: result.is_last(),
        })
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::arena::Arena;
    use crate::devices::loopback::test_utils::init_context;
    use crate::devices::loopback::HostCall;
    use crate::devices::loopback::LoopbackHost;
    use crate::io::ReadWireExt;
    use crate::marshal::EncodeAudio;
    use crate::protocol::AudioEncodeInput;

    fn setup() -> (LoopbackHost, BufferAllocator<LoopbackHost>) {
        let host = LoopbackHost::new(ProtocolVersion::V3).unwrap();
        let arena: Arena = host.map_arena(host.arena_size()).unwrap();
        let alloc = BufferAllocator::new(Arc::new(host.clone()), Arc::new(arena));
        (host, alloc)
    }

    #[test]
    fn encode_audio_is_a_single_call() {
        let (host, alloc) = setup();
        let ctx = init_context(&Fetching, &alloc, "mp2");
        host.take_calls();

        let samples: Vec<u8> = (0..=255).collect();
        let response = Fetching
            .transact::<_, EncodeAudio, _>(
                &alloc,
                ctx,
                CodecOp::EncodeAudio,
                AudioEncodeInput {
                    inbuf_size: 256,
                    max_size: 4096,
                },
                &samples,
            )
            .unwrap();
        assert_eq!(
            response,
            Response::Ok {
                result: 256,
                fields: (),
                payload: samples.clone(),
            }
        );

        let calls = host.take_calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, HostCall::InvokeAndFetch(_)))
                .count(),
            1
        );
        assert!(!calls
            .iter()
            .any(|c| matches!(c, HostCall::WriteCommand(_) | HostCall::PutDataIntoBuffer)));

        // The request is framed with its total length.
        let request = host.requests().pop().unwrap();
        assert!(request.header.is_none());
        let mut record = Cursor::new(request.record);
        assert_eq!(record.read_obj::<u32>().unwrap(), 8 + 256);
        assert_eq!(request.payload, samples);

        assert_eq!(alloc.held_count(), 0);
        assert_eq!(host.held_blocks(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn fused_decode_keeps_the_picture() {
        let (host, alloc) = setup();
        let ctx = init_context(&Fetching, &alloc, "h264");
        let picture_size = 16 * 16 * 3 / 2;

        let (response, picture) = Fetching
            .decode_and_copy(
                &alloc,
                ctx,
                VideoDecodeInput {
                    inbuf_size: 10,
                    idx: 0,
                    in_offset: 0,
                },
                &[7; 10],
                picture_size,
            )
            .unwrap();
        assert!(matches!(response, Response::Ok { result: 10, .. }));

        let picture = picture.unwrap();
        assert_eq!(picture.bias, PICTURE_BUFFER_BIAS);
        assert!(!picture.is_last());
        assert_eq!(alloc.held_count(), 1);
        alloc.release(picture.handle).unwrap();
        assert_eq!(host.held_blocks(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn fused_decode_without_picture_releases_the_buffer() {
        let (host, alloc) = setup();
        let ctx = init_context(&Fetching, &alloc, "h264");

        let (response, picture) = Fetching
            .decode_and_copy(&alloc, ctx, VideoDecodeInput::default(), &[], 384)
            .unwrap();
        assert!(matches!(response, Response::Ok { result: 0, .. }));
        assert!(picture.is_none());
        assert_eq!(alloc.held_count(), 0);
        assert_eq!(host.held_blocks(), 0);
    }

    #[test]
    fn control_has_no_result_buffer() {
        let (host, alloc) = setup();
        let ctx = init_context(&Fetching, &alloc, "h264");
        host.take_calls();

        Fetching.control(&alloc, ctx, CodecOp::FlushBuffers).unwrap();
        Fetching.control(&alloc, ctx, CodecOp::Deinit).unwrap();
        assert_eq!(
            host.take_calls(),
            vec![
                HostCall::InvokeAndFetch(CodecOp::FlushBuffers),
                HostCall::InvokeAndFetch(CodecOp::Deinit),
            ]
        );
        assert!(host.violations().is_empty());
    }

    /// A host whose fused calls fail after having allocated a result buffer.
    struct FailingHost(LoopbackHost);

    impl CodecDevice for FailingHost {
        fn map_arena(&self, len: usize) -> std::result::Result<Arena, i32> {
            self.0.map_arena(len)
        }
        fn version(&self) -> std::result::Result<u32, i32> {
            self.0.version()
        }
        fn elements_size(&self) -> std::result::Result<u32, i32> {
            self.0.elements_size()
        }
        fn elements(&self, buf: &mut [u8]) -> std::result::Result<(), i32> {
            self.0.elements(buf)
        }
        fn context_index(&self) -> std::result::Result<u32, i32> {
            self.0.context_index()
        }
        fn secure_buffer(&self, ctx: u32, size: u32) -> std::result::Result<ArenaOffset, i32> {
            self.0.secure_buffer(ctx, size)
        }
        fn try_secure_buffer(&self, size: u32) -> std::result::Result<Option<ArenaOffset>, i32> {
            self.0.try_secure_buffer(size)
        }
        fn release_buffer(&self, offset: ArenaOffset) -> std::result::Result<(), i32> {
            self.0.release_buffer(offset)
        }
        fn write_command(&self, cmd: &Command) -> std::result::Result<(), i32> {
            self.0.write_command(cmd)
        }
        fn invoke_and_release(&self, cmd: &Command) -> std::result::Result<i32, i32> {
            self.0.invoke_and_release(cmd)
        }
        fn invoke_and_fetch(
            &self,
            cmd: &Command,
            buffer_size: i32,
        ) -> std::result::Result<FetchResult, i32> {
            self.0.invoke_and_fetch(cmd, buffer_size)?;
            Ok(FetchResult {
                status: -libc::EIO,
                offset: self.0.try_secure_buffer(64)?,
            })
        }
        fn put_data_into_buffer(
            &self,
            ctx: u32,
            size: u32,
        ) -> std::result::Result<crate::PutData, i32> {
            self.0.put_data_into_buffer(ctx, size)
        }
    }

    #[test]
    fn failed_call_releases_its_result_buffer() {
        let host = LoopbackHost::new(ProtocolVersion::V3).unwrap();
        let arena = host.map_arena(host.arena_size()).unwrap();
        let alloc = BufferAllocator::new(Arc::new(FailingHost(host.clone())), Arc::new(arena));
        let ctx = ContextIndex::new(host.context_index().unwrap()).unwrap();

        let result = Fetching.control(&alloc, ctx, CodecOp::FlushBuffers);
        assert!(matches!(
            result,
            Err(CodecError::Protocol {
                call: DeviceCall::InvokeAndFetch,
                ..
            })
        ));
        assert_eq!(alloc.held_count(), 0);
        assert_eq!(host.held_blocks(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn oversized_picture_is_refused_before_any_call() {
        let (host, alloc) = setup();
        let ctx = init_context(&Fetching, &alloc, "h264");
        host.take_calls();

        let result = Fetching.decode_and_copy(
            &alloc,
            ctx,
            VideoDecodeInput::default(),
            &[1; 8],
            u32::MAX,
        );
        assert!(matches!(result, Err(CodecError::TooLarge(_))));
        assert!(host.take_calls().is_empty());
        assert_eq!(host.held_blocks(), 0);
    }
}
