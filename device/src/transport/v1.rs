// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! First generation of the protocol.
//!
//! Each context owns a 256-byte metadata slot at the start of the arena. A command is carried by
//! writing a header (operation and input buffer offset) followed by the length-prefixed request
//! fields into the slot, then writing a command record to the device. The host writes the result
//! and the response fields back into the slot, after the header, and queues any output payload
//! for retrieval with a put-data-into-buffer call. The guest releases every buffer it used.

use std::io::Read;

use crate::allocator::BufferAllocator;
use crate::allocator::BufferHandle;
use crate::arena::ArenaOffset;
use crate::context::ContextIndex;
use crate::error::CodecError;
use crate::error::Result;
use crate::io::WireType;
use crate::io::WriteWireExt;
use crate::marshal;
use crate::marshal::Reply;
use crate::marshal::Response;
use crate::protocol::CodecOp;
use crate::protocol::DeviceCall;
use crate::protocol::ProtocolVersion;
use crate::protocol::SlotHeader;
use crate::protocol::METADATA_SLOT_SIZE;
use crate::protocol::SLOT_HEADER_SIZE;
use crate::transport::wire_size;
use crate::transport::PendingPicture;
use crate::transport::WireProtocol;
use crate::CodecDevice;
use crate::Command;

/// Offset of the metadata slot of `ctx`.
pub(crate) fn slot_offset(ctx: ContextIndex) -> Result<ArenaOffset> {
    ctx.metadata_offset().ok_or_else(|| {
        log::error!("context {} has no metadata slot", ctx.get());
        CodecError::NoMetadataSlot(ctx.get())
    })
}

/// Offset of the request/response record inside the metadata slot of `ctx`.
pub(crate) fn record_offset(ctx: ContextIndex) -> Result<ArenaOffset> {
    slot_offset(ctx)?
        .checked_add(SLOT_HEADER_SIZE)
        .ok_or(CodecError::NoMetadataSlot(ctx.get()))
}

/// Room left in a metadata slot after its header.
pub(crate) const RECORD_CAPACITY: usize = (METADATA_SLOT_SIZE - SLOT_HEADER_SIZE) as usize;

/// Writes the slot header and request record of `op` into the metadata slot of `ctx`.
pub(crate) fn write_slot<D, F>(
    alloc: &BufferAllocator<D>,
    ctx: ContextIndex,
    op: CodecOp,
    input: Option<&BufferHandle>,
    fields: F,
    inline: &[u8],
) -> Result<()>
where
    D: CodecDevice,
    F: WireType,
{
    let record_size = marshal::request_size::<F>(inline.len());
    if record_size > RECORD_CAPACITY {
        return Err(CodecError::SlotOverflow(record_size));
    }

    let mut w = alloc
        .arena()
        .writer(slot_offset(ctx)?, METADATA_SLOT_SIZE as usize)?;
    w.write_obj(SlotHeader {
        api_index: op as i32,
        mem_offset: input.map(|h| h.offset().get()).unwrap_or(u32::MAX),
    })?;
    marshal::encode_request(fields, inline, &mut w)?;

    Ok(())
}

/// Secures an input buffer for `payload` and copies it there. Empty payloads get no buffer.
pub(crate) fn stage_payload<D: CodecDevice>(
    alloc: &BufferAllocator<D>,
    ctx: ContextIndex,
    payload: &[u8],
) -> Result<Option<BufferHandle>> {
    if payload.is_empty() {
        return Ok(None);
    }

    let handle = alloc.secure(ctx, wire_size(payload.len())?)?;
    if let Err(e) = alloc.arena().write(handle.offset(), payload) {
        let _ = alloc.release(handle);
        return Err(e.into());
    }

    Ok(Some(handle))
}

/// Reads the response of `ctx` from its metadata slot, fetching the output payload from the host
/// if there is one. Used by both v1 and v2.
pub(crate) fn read_response<D, T>(
    alloc: &BufferAllocator<D>,
    ctx: ContextIndex,
) -> Result<Response<T::Fields>>
where
    D: CodecDevice,
    T: Reply,
{
    let arena = alloc.arena();
    // The slot only holds the result and the fields, the payload comes in a separate buffer.
    let head_len = std::mem::size_of::<i32>() + std::mem::size_of::<T::Fields>();
    let record = record_offset(ctx)?;
    let mut slot = arena.reader(record, head_len)?;

    if !T::CARRIES_PAYLOAD {
        return Ok(marshal::decode_response::<T, _>(&mut slot)?);
    }

    let mut result = [0u8; 4];
    arena.read(record, &mut result)?;
    if i32::from_le_bytes(result) < 0 {
        return Ok(marshal::decode_response::<T, _>(&mut slot)?);
    }

    let data = alloc
        .device()
        .put_data_into_buffer(ctx.get(), 0)
        .map_err(|e| {
            log::error!("failed to fetch output of context {}: {}", ctx.get(), e);
            CodecError::protocol(DeviceCall::PutDataIntoBuffer, e)
        })?;
    let output = alloc.adopt(data.offset, 0);

    let response = alloc
        .reader(&output)
        .map_err(CodecError::from)
        .and_then(|out| Ok(marshal::decode_response::<T, _>(&mut slot.chain(out))?));
    if let Err(e) = alloc.release(output) {
        log::error!("failed to release output buffer: {:#}", e);
    }

    response
}

/// Fetches the output buffer queued by a picture copy.
pub(crate) fn fetch_picture<D: CodecDevice>(
    alloc: &BufferAllocator<D>,
    ctx: ContextIndex,
    size: u32,
) -> Result<PendingPicture> {
    let data = alloc
        .device()
        .put_data_into_buffer(ctx.get(), size)
        .map_err(|e| {
            log::error!("failed to fetch picture of context {}: {}", ctx.get(), e);
            CodecError::protocol(DeviceCall::PutDataIntoBuffer, e)
        })?;

    Ok(PendingPicture {
        handle: alloc.adopt(data.offset, size),
        bias: 0,
        is_last: data.is_last,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Legacy;

impl Legacy {
    fn write_command<D: CodecDevice>(alloc: &BufferAllocator<D>, cmd: &Command) {
        if let Err(e) = alloc.device().write_command(cmd) {
            log::error!("failed to write command {:?}: {}", cmd, e);
        }
    }
}

impl WireProtocol for Legacy {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
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
        // Init carries its extradata inline in the slot.
        let (input, inline) = match op {
            CodecOp::Init => (None, payload),
            _ => (stage_payload(alloc, ctx, payload)?, &[][..]),
        };

        if let Err(e) = write_slot(alloc, ctx, op, input.as_ref(), fields, inline) {
            if let Some(input) = input {
                let _ = alloc.release(input);
            }
            return Err(e);
        }

        let cmd = Command::new(op, ctx.get(), input.as_ref().map(BufferHandle::offset));
        Self::write_command(alloc, &cmd);

        if let Some(input) = input {
            alloc.release(input)?;
        }

        read_response::<D, T>(alloc, ctx)
    }

    fn control<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        op: CodecOp,
    ) -> Result<()> {
        let mut w = alloc
            .arena()
            .writer(slot_offset(ctx)?, SLOT_HEADER_SIZE as usize)?;
        w.write_obj(SlotHeader {
            api_index: op as i32,
            mem_offset: u32::MAX,
        })?;
        Self::write_command(alloc, &Command::new(op, ctx.get(), None));

        Ok(())
    }

    fn picture_copy<D: CodecDevice>(
        &self,
        alloc: &BufferAllocator<D>,
        ctx: ContextIndex,
        size: u32,
    ) -> Result<PendingPicture> {
        self.control(alloc, ctx, CodecOp::PictureCopy)?;
        fetch_picture(alloc, ctx, size)
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
    use crate::marshal::DecodeVideo;
    use crate::marshal::EncodeAudio;
    use crate::marshal::InitVideo;
    use crate::protocol::AudioEncodeInput;
    use crate::protocol::InitInput;
    use crate::protocol::VideoDecodeInput;

    fn setup() -> (LoopbackHost, BufferAllocator<LoopbackHost>) {
        let host = LoopbackHost::new(ProtocolVersion::V1).unwrap();
        let arena: Arena = host.map_arena(host.arena_size()).unwrap();
        let alloc = BufferAllocator::new(Arc::new(host.clone()), Arc::new(arena));
        (host, alloc)
    }

    #[test]
    fn decode_video_layout() {
        let (host, alloc) = setup();
        let ctx = init_context(&Legacy, &alloc, "h264");
        assert_eq!(ctx.get(), 1);
        host.take_calls();

        let payload = vec![0x5a; 128];
        let fields = VideoDecodeInput {
            inbuf_size: 128,
            idx: 0,
            in_offset: 0,
        };
        let response = Legacy
            .transact::<_, DecodeVideo, _>(&alloc, ctx, CodecOp::DecodeVideo, fields, &payload)
            .unwrap();
        assert!(matches!(response, Response::Ok { result: 128, .. }));

        // The slot of context 1 starts at offset 0.
        let request = host.requests().pop().unwrap();
        let header = request.header.unwrap();
        assert_eq!({ header.api_index }, CodecOp::DecodeVideo as i32);
        let input_offset = ArenaOffset::new(header.mem_offset);
        assert_eq!(request.input, Some(input_offset));

        let mut record = Cursor::new(request.record);
        assert_eq!(record.read_obj::<u32>().unwrap(), 16);
        assert_eq!(record.read_obj::<VideoDecodeInput>().unwrap(), fields);
        assert_eq!(request.payload, payload);

        assert_eq!(
            host.take_calls(),
            vec![
                HostCall::SecureBuffer,
                HostCall::WriteCommand(CodecOp::DecodeVideo),
                HostCall::ReleaseBuffer,
            ]
        );
        assert_eq!(alloc.held_count(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn payload_comes_back_through_put_data() {
        let (host, alloc) = setup();
        let ctx = init_context(&Legacy, &alloc, "mp2");

        let response = Legacy
            .transact::<_, EncodeAudio, _>(
                &alloc,
                ctx,
                CodecOp::EncodeAudio,
                AudioEncodeInput {
                    inbuf_size: 4,
                    max_size: 4096,
                },
                &[1, 2, 3, 4],
            )
            .unwrap();
        assert_eq!(
            response,
            Response::Ok {
                result: 4,
                fields: (),
                payload: vec![1, 2, 3, 4],
            }
        );
        assert!(host.take_calls().contains(&HostCall::PutDataIntoBuffer));
        assert_eq!(host.held_blocks(), 0);
        assert!(host.violations().is_empty());
    }

    #[test]
    fn oversized_init_record_is_refused() {
        let (host, alloc) = setup();
        let ctx = ContextIndex::new(host.context_index().unwrap()).unwrap();
        host.take_calls();

        let result = Legacy.transact::<_, InitVideo, _>(
            &alloc,
            ctx,
            CodecOp::Init,
            InitInput::default(),
            &[0u8; 200],
        );
        assert!(matches!(result, Err(CodecError::SlotOverflow(_))));
        assert!(host.take_calls().is_empty());
    }

    #[test]
    fn index_past_the_slots_is_refused() {
        let (host, alloc) = setup();
        let ctx = ContextIndex::new(u32::MAX).unwrap();
        host.take_calls();

        let result = Legacy.transact::<_, InitVideo, _>(
            &alloc,
            ctx,
            CodecOp::Init,
            InitInput::default(),
            &[],
        );
        assert!(matches!(result, Err(CodecError::NoMetadataSlot(index)) if index == u32::MAX));
        assert!(matches!(
            Legacy.control(&alloc, ctx, CodecOp::FlushBuffers),
            Err(CodecError::NoMetadataSlot(_))
        ));
        assert!(host.take_calls().is_empty());
    }
}
