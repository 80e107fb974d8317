// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-process implementation of the host side of the codec device.
//!
//! [`LoopbackHost`] owns a sealed `memfd` standing in for the device memory, maps its own view of
//! it, and implements the allocation policy and command handling of all three protocol
//! generations on top of it. Its codec engine is deterministic and trivial: decoders produce a
//! test pattern, the video encoder inverts its input and the audio codecs duplicate or truncate
//! their samples.
//!
//! Every call is recorded, as well as every request the host parsed and every guest behavior that
//! a real host would consider a violation of the protocol (releasing a range twice, pointing at
//! memory that was never handed out, ...). Tests use these records to check what went on the
//! wire.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::bail;
use anyhow::Context;

use crate::arena::Arena;
use crate::arena::ArenaError;
use crate::arena::ArenaOffset;
use crate::context::CodecKind;
use crate::context::ContextIndex;
use crate::context::MediaKind;
use crate::context::PixelFormat;
use crate::context::SampleFormat;
use crate::elements;
use crate::elements::CodecDescriptor;
use crate::io::ReadWireExt;
use crate::io::WireType;
use crate::io::WriteWireExt;
use crate::marshal;
use crate::marshal::Reply;
use crate::marshal::Response;
use crate::memfd::MemFdRegion;
use crate::protocol::AudioData;
use crate::protocol::AudioDecodeInput;
use crate::protocol::AudioDecodeOutput;
use crate::protocol::AudioEncodeInput;
use crate::protocol::AudioInitOutput;
use crate::protocol::CodecElement;
use crate::protocol::CodecOp;
use crate::protocol::InitInput;
use crate::protocol::ProtocolVersion;
use crate::protocol::SlotHeader;
use crate::protocol::VideoData;
use crate::protocol::VideoDecodeInput;
use crate::protocol::VideoDecodeOutput;
use crate::protocol::VideoEncodeInput;
use crate::protocol::VideoEncodeOutput;
use crate::protocol::ARENA_SIZE;
use crate::protocol::METADATA_SLOT_SIZE;
use crate::protocol::PICTURE_BUFFER_BIAS;
use crate::protocol::SLOT_HEADER_SIZE;
use crate::transport::v1;
use crate::CodecDevice;
use crate::Command;
use crate::FetchResult;
use crate::PutData;

/// Number of contexts the host can run at the same time, one metadata slot each.
pub const MAX_CONTEXTS: u32 = 128;

/// Allocation granularity of the buffer pool.
pub const BLOCK_SIZE: u32 = 256;

/// Metadata slots occupy the start of the arena, the buffer pool comes right after.
const SLOT_REGION_SIZE: u32 = MAX_CONTEXTS * METADATA_SLOT_SIZE;

/// Frames between two key frames produced by the video encoder.
const KEY_FRAME_INTERVAL: u32 = 12;

/// Samples per frame reported by audio codecs.
const AUDIO_FRAME_SIZE: i32 = 1152;

const DEFAULT_PICTURE_DIMENSION: i32 = 16;

/// A call received by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    GetVersion,
    GetElementsSize,
    GetElements,
    GetContextIndex,
    SecureBuffer,
    TrySecureBuffer,
    ReleaseBuffer,
    WriteCommand(CodecOp),
    InvokeAndRelease(CodecOp),
    InvokeAndFetch(CodecOp),
    PutDataIntoBuffer,
}

/// A request parsed by the host.
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub op: CodecOp,
    pub ctx: u32,
    /// Slot header of the request, for protocols that use metadata slots.
    pub header: Option<SlotHeader>,
    /// The request record, starting with its length prefix.
    pub record: Vec<u8>,
    /// Buffer the request pointed at, if any.
    pub input: Option<ArenaOffset>,
    /// Payload the operation ran on, wherever it came from.
    pub payload: Vec<u8>,
}

/// Parameters of a [`LoopbackHost`].
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Protocol version reported to the guest. Unknown versions are accepted, so opening can be
    /// tested against them.
    pub version: u32,
    /// Size of the device memory.
    pub arena_size: usize,
    /// Number of bytes available to the buffer pool.
    pub pool_size: u32,
    /// Codecs offered to the guest.
    pub codecs: Vec<CodecDescriptor>,
}

fn codec(
    name: &str,
    long_name: &str,
    kind: CodecKind,
    media: MediaKind,
    format: i32,
) -> CodecDescriptor {
    CodecDescriptor {
        name: name.into(),
        long_name: long_name.into(),
        kind,
        media,
        formats: vec![format],
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V3 as u32,
            arena_size: ARENA_SIZE,
            pool_size: ARENA_SIZE as u32 - SLOT_REGION_SIZE,
            codecs: vec![
                codec(
                    "h264",
                    "H.264 / AVC",
                    CodecKind::Decoder,
                    MediaKind::Video,
                    PixelFormat::Yuv420p as i32,
                ),
                codec(
                    "mpeg4",
                    "MPEG-4 part 2",
                    CodecKind::Encoder,
                    MediaKind::Video,
                    PixelFormat::Yuv420p as i32,
                ),
                codec(
                    "aac",
                    "AAC (Advanced Audio Coding)",
                    CodecKind::Decoder,
                    MediaKind::Audio,
                    SampleFormat::S16 as i32,
                ),
                codec(
                    "mp2",
                    "MP2 (MPEG audio layer 2)",
                    CodecKind::Encoder,
                    MediaKind::Audio,
                    SampleFormat::S16 as i32,
                ),
            ],
        }
    }
}

struct Block {
    /// Rounded up to the pool granularity.
    size: u32,
    /// Size asked by the guest.
    requested: u32,
}

/// First-fit allocator over `[start, end)`.
struct Pool {
    start: u32,
    end: u32,
    blocks: BTreeMap<u32, Block>,
}

impl Pool {
    fn free_space(&self) -> u32 {
        let used: u32 = self.blocks.values().map(|b| b.size).sum();
        (self.end - self.start) - used
    }

    /// Allocates a block for `requested` bytes. The returned flag is set if what is left of the
    /// pool could not hold another block of the same size.
    fn allocate(&mut self, requested: u32) -> Option<(ArenaOffset, bool)> {
        let size = requested.max(1).checked_next_multiple_of(BLOCK_SIZE)?;

        let mut cursor = self.start;
        let mut found = None;
        for (&offset, block) in &self.blocks {
            if offset - cursor >= size {
                found = Some(cursor);
                break;
            }
            cursor = offset + block.size;
        }
        let offset = match found {
            Some(offset) => offset,
            None if self.end - cursor >= size => cursor,
            None => return None,
        };

        self.blocks.insert(offset, Block { size, requested });
        let is_last = self.free_space() < size;

        Some((ArenaOffset::new(offset), is_last))
    }

    fn release(&mut self, offset: ArenaOffset) -> bool {
        self.blocks.remove(&offset.get()).is_some()
    }

    fn requested(&self, offset: ArenaOffset) -> Option<u32> {
        self.blocks.get(&offset.get()).map(|b| b.requested)
    }
}

/// A codec instance running on the host.
struct HostCodec {
    descriptor: CodecDescriptor,
    video: VideoData,
    audio: AudioData,
    frames: u32,
    last_picture: Option<Vec<u8>>,
}

/// Response of an operation, ready to be placed in the arena.
struct Outcome {
    /// Result and fields.
    head: Vec<u8>,
    /// Payload following the fields.
    output: Vec<u8>,
    /// Whether the guest expects the payload to be delivered, even if empty.
    has_output: bool,
    /// Payload the operation consumed.
    input: Vec<u8>,
    /// Picture produced by a decode.
    picture: Option<Vec<u8>>,
}

impl Outcome {
    fn new<T: Reply>(
        response: Response<T::Fields>,
        input: Vec<u8>,
        picture: Option<Vec<u8>>,
    ) -> anyhow::Result<Self> {
        let (head_only, output, has_output) = match response {
            Response::Ok {
                result,
                fields,
                payload,
            } => (
                Response::Ok {
                    result,
                    fields,
                    payload: Vec::new(),
                },
                payload,
                T::CARRIES_PAYLOAD,
            ),
            failed => (failed, Vec::new(), false),
        };

        let mut head = Vec::new();
        marshal::encode_response::<T, _>(&head_only, &mut head).context("encoding response")?;

        Ok(Self {
            head,
            output,
            has_output,
            input,
            picture,
        })
    }
}

fn parse<T: WireType>(record: &[u8]) -> anyhow::Result<(T, Vec<u8>)> {
    marshal::decode_request::<T, _>(&mut Cursor::new(record))
        .with_context(|| format!("malformed request of {} bytes", record.len()))
}

/// The trivial codec engine.
struct Engine {
    codecs: Vec<CodecDescriptor>,
    /// Reserved context indices, with the codec running on them once initialized.
    contexts: BTreeMap<u32, Option<HostCodec>>,
    /// Outputs waiting for a put-data-into-buffer call.
    outputs: BTreeMap<u32, VecDeque<Vec<u8>>>,
}

impl Engine {
    fn reserve_context(&mut self) -> Option<u32> {
        let index = (1..=MAX_CONTEXTS).find(|i| !self.contexts.contains_key(i))?;
        self.contexts.insert(index, None);
        Some(index)
    }

    fn codec(&mut self, ctx: u32, kind: CodecKind, media: MediaKind) -> Option<&mut HostCodec> {
        self.contexts
            .get_mut(&ctx)?
            .as_mut()
            .filter(|c| c.descriptor.kind == kind && c.descriptor.media == media)
    }

    fn last_picture(&self, ctx: u32) -> Option<Vec<u8>> {
        self.contexts
            .get(&ctx)?
            .as_ref()?
            .last_picture
            .clone()
    }

    fn execute(
        &mut self,
        ctx: u32,
        op: CodecOp,
        record: &[u8],
        external: Option<Vec<u8>>,
    ) -> anyhow::Result<Outcome> {
        match op {
            CodecOp::Init => {
                let (fields, inline) = parse::<InitInput>(record)?;
                self.init(ctx, fields, external.unwrap_or(inline))
            }
            CodecOp::DecodeVideo | CodecOp::DecodeVideoAndPictureCopy => {
                let (_, inline) = parse::<VideoDecodeInput>(record)?;
                let payload = external.unwrap_or(inline);
                let (response, picture) = self.decode_video(ctx, &payload);
                Outcome::new::<marshal::DecodeVideo>(response, payload, picture)
            }
            CodecOp::EncodeVideo => {
                let (_, inline) = parse::<VideoEncodeInput>(record)?;
                let payload = external.unwrap_or(inline);
                let response = self.encode_video(ctx, &payload);
                Outcome::new::<marshal::EncodeVideo>(response, payload, None)
            }
            CodecOp::DecodeAudio => {
                let (_, inline) = parse::<AudioDecodeInput>(record)?;
                let payload = external.unwrap_or(inline);
                let response = self.decode_audio(ctx, &payload);
                Outcome::new::<marshal::DecodeAudio>(response, payload, None)
            }
            CodecOp::EncodeAudio => {
                let (fields, inline) = parse::<AudioEncodeInput>(record)?;
                let payload = external.unwrap_or(inline);
                let response = self.encode_audio(ctx, fields, &payload);
                Outcome::new::<marshal::EncodeAudio>(response, payload, None)
            }
            CodecOp::PictureCopy | CodecOp::Deinit | CodecOp::FlushBuffers => {
                bail!("{:?} carries no request", op)
            }
        }
    }

    fn init(&mut self, ctx: u32, fields: InitInput, extradata: Vec<u8>) -> anyhow::Result<Outcome> {
        let name = elements::c_string(&fields.name);
        let codec_type = fields.codec_type;
        let descriptor = self
            .codecs
            .iter()
            .find(|d| d.name == name && d.kind as i32 == codec_type)
            .cloned();

        let (descriptor, slot) = match (descriptor, self.contexts.get_mut(&ctx)) {
            (Some(descriptor), Some(slot)) => (descriptor, slot),
            (descriptor, _) => {
                log::warn!(
                    "cannot init {} (type {}) on context {}: {}",
                    name,
                    codec_type,
                    ctx,
                    if descriptor.is_none() {
                        "unknown codec"
                    } else {
                        "context not reserved"
                    }
                );
                return Outcome::new::<marshal::InitVideo>(Response::Failed(-1), extradata, None);
            }
        };

        let mut audio = fields.audio;
        let media = descriptor.media;
        if media == MediaKind::Audio {
            if audio.sample_fmt == -1 {
                audio.sample_fmt = SampleFormat::S16 as i32;
            }
            let bytes = SampleFormat::n(audio.sample_fmt)
                .map(SampleFormat::bytes_per_sample)
                .unwrap_or(2);
            audio.bits_per_sample_fmt = (bytes * 8) as i32;
            audio.frame_size = AUDIO_FRAME_SIZE;
        }

        log::debug!("context {}: running {}", ctx, descriptor.name);
        *slot = Some(HostCodec {
            descriptor,
            video: fields.video,
            audio,
            frames: 0,
            last_picture: None,
        });

        match media {
            MediaKind::Video => Outcome::new::<marshal::InitVideo>(
                Response::Ok {
                    result: 0,
                    fields: (),
                    payload: Vec::new(),
                },
                extradata,
                None,
            ),
            MediaKind::Audio => Outcome::new::<marshal::InitAudio>(
                Response::Ok {
                    result: 0,
                    fields: AudioInitOutput {
                        sample_fmt: audio.sample_fmt,
                        frame_size: audio.frame_size,
                        bits_per_sample_fmt: audio.bits_per_sample_fmt,
                    },
                    payload: Vec::new(),
                },
                extradata,
                None,
            ),
        }
    }

    fn decode_video(
        &mut self,
        ctx: u32,
        payload: &[u8],
    ) -> (Response<VideoDecodeOutput>, Option<Vec<u8>>) {
        let Some(codec) = self.codec(ctx, CodecKind::Decoder, MediaKind::Video) else {
            return (Response::Failed(-1), None);
        };

        if payload.is_empty() {
            return (
                Response::Ok {
                    result: 0,
                    fields: VideoDecodeOutput {
                        got_picture: 0,
                        video: codec.video,
                    },
                    payload: Vec::new(),
                },
                None,
            );
        }

        let video = &mut codec.video;
        if video.width <= 0 || video.height <= 0 {
            video.width = DEFAULT_PICTURE_DIMENSION;
            video.height = DEFAULT_PICTURE_DIMENSION;
        }
        if video.pix_fmt == -1 {
            video.pix_fmt = PixelFormat::Yuv420p as i32;
        }
        let size = PixelFormat::n(video.pix_fmt)
            .and_then(|f| f.picture_size(video.width as u32, video.height as u32));
        let Some(size) = size else {
            log::warn!("context {}: cannot size pictures of format {}", ctx, { video.pix_fmt });
            return (Response::Failed(-1), None);
        };

        let frame = codec.frames;
        let picture: Vec<u8> = (0..size)
            .map(|i| (i as u32).wrapping_add(frame) as u8 ^ payload[i % payload.len()])
            .collect();
        codec.frames += 1;
        codec.last_picture = Some(picture.clone());

        (
            Response::Ok {
                result: payload.len() as i32,
                fields: VideoDecodeOutput {
                    got_picture: 1,
                    video: codec.video,
                },
                payload: Vec::new(),
            },
            Some(picture),
        )
    }

    fn encode_video(&mut self, ctx: u32, payload: &[u8]) -> Response<VideoEncodeOutput> {
        let Some(codec) = self.codec(ctx, CodecKind::Encoder, MediaKind::Video) else {
            return Response::Failed(-1);
        };

        let key_frame = codec.frames % KEY_FRAME_INTERVAL == 0;
        codec.frames += 1;

        Response::Ok {
            result: payload.len() as i32,
            fields: VideoEncodeOutput {
                coded_frame: 1,
                key_frame: key_frame as i32,
            },
            payload: payload.iter().map(|b| b ^ 0xff).collect(),
        }
    }

    fn decode_audio(&mut self, ctx: u32, payload: &[u8]) -> Response<AudioDecodeOutput> {
        let Some(codec) = self.codec(ctx, CodecKind::Decoder, MediaKind::Audio) else {
            return Response::Failed(-1);
        };

        let samples: Vec<u8> = payload.iter().flat_map(|b| [*b, *b]).collect();
        codec.frames += 1;

        Response::Ok {
            result: payload.len() as i32,
            fields: AudioDecodeOutput {
                have_data: samples.len() as i32,
                sample_rate: codec.audio.sample_rate,
                channels: codec.audio.channels,
                channel_layout: codec.audio.channel_layout,
            },
            payload: samples,
        }
    }

    fn encode_audio(
        &mut self,
        ctx: u32,
        fields: AudioEncodeInput,
        payload: &[u8],
    ) -> Response<()> {
        let Some(codec) = self.codec(ctx, CodecKind::Encoder, MediaKind::Audio) else {
            return Response::Failed(-1);
        };

        let len = payload.len().min(fields.max_size.max(0) as usize);
        codec.frames += 1;

        Response::Ok {
            result: len as i32,
            fields: (),
            payload: payload[..len].to_vec(),
        }
    }

    /// Runs an operation without request nor response.
    fn control(&mut self, ctx: u32, op: CodecOp) {
        match op {
            CodecOp::Deinit => {
                if self.contexts.remove(&ctx).is_none() {
                    log::warn!("deinit of unknown context {}", ctx);
                }
                self.outputs.remove(&ctx);
            }
            CodecOp::FlushBuffers => {
                if let Some(queue) = self.outputs.get_mut(&ctx) {
                    queue.clear();
                }
            }
            _ => log::warn!("{:?} is not a control operation", op),
        }
    }

    fn queue_output(&mut self, ctx: u32, data: Vec<u8>) {
        self.outputs.entry(ctx).or_default().push_back(data);
    }
}

struct HostState {
    config: LoopbackConfig,
    region: MemFdRegion,
    /// The host's own mapping of the device memory.
    view: Arena,
    pool: Pool,
    engine: Engine,
    calls: Vec<HostCall>,
    requests: Vec<HostRequest>,
    violations: Vec<String>,
    map_count: usize,
}

fn invalid(e: anyhow::Error) -> i32 {
    log::error!("loopback host: {:#}", e);
    libc::EINVAL
}

impl HostState {
    fn violation(&mut self, message: String) -> i32 {
        log::error!("protocol violation: {}", message);
        self.violations.push(message);
        libc::EFAULT
    }

    fn require(&self, version: ProtocolVersion) -> Result<(), i32> {
        if self.config.version == version as u32 {
            Ok(())
        } else {
            Err(libc::ENOTTY)
        }
    }

    fn context(&self, ctx: u32) -> Result<ContextIndex, i32> {
        match ContextIndex::new(ctx) {
            Some(index) if ctx <= MAX_CONTEXTS => Ok(index),
            _ => Err(libc::EINVAL),
        }
    }

    fn allocate(&mut self, size: u32) -> Result<(ArenaOffset, bool), i32> {
        self.pool.allocate(size).ok_or_else(|| {
            log::debug!("no room left for {} bytes", size);
            libc::ENOMEM
        })
    }

    /// Returns the bytes the guest asked for when securing the block at `offset`.
    fn block_bytes(&mut self, offset: ArenaOffset) -> Result<Vec<u8>, i32> {
        let Some(len) = self.pool.requested(offset) else {
            return Err(self.violation(format!("access to unallocated offset {}", offset)));
        };

        let mut data = vec![0u8; len as usize];
        self.view
            .read(offset, &mut data)
            .map_err(|e| invalid(e.into()))?;

        Ok(data)
    }

    fn write(&self, offset: ArenaOffset, data: &[u8]) -> Result<(), i32> {
        self.view.write(offset, data).map_err(|e| invalid(e.into()))
    }

    fn read_header(&self, ctx: ContextIndex) -> anyhow::Result<SlotHeader> {
        let mut r = self
            .view
            .reader(v1::slot_offset(ctx)?, SLOT_HEADER_SIZE as usize)?;
        Ok(r.read_obj::<SlotHeader>()?)
    }

    fn slot_record(&self, ctx: ContextIndex) -> anyhow::Result<Vec<u8>> {
        let offset = v1::record_offset(ctx)?;
        let body_len = self.view.reader(offset, 4)?.read_obj::<u32>()? as usize;
        let len = 4 + body_len;
        if len > v1::RECORD_CAPACITY {
            bail!("record of {} bytes overflows the slot of context {}", len, ctx.get());
        }

        let mut record = vec![0u8; len];
        self.view.read(offset, &mut record)?;
        Ok(record)
    }

    /// Runs a command whose request sits in the metadata slot of its context. Returns the input
    /// buffer the command used.
    fn run_slot_command(&mut self, cmd: &Command) -> Result<Option<ArenaOffset>, i32> {
        let ctx = self.context(cmd.ctx_index)?;
        let header = self.read_header(ctx).map_err(invalid)?;
        if header.api_index != cmd.op as i32 {
            log::warn!(
                "context {}: slot header says {} but command is {:?}",
                ctx.get(),
                { header.api_index },
                cmd.op
            );
        }
        let input = match header.mem_offset {
            u32::MAX => None,
            offset => Some(ArenaOffset::new(offset)),
        };

        match cmd.op {
            CodecOp::PictureCopy => {
                let picture = self.engine.last_picture(ctx.get()).ok_or(libc::ENODATA)?;
                self.engine.queue_output(ctx.get(), picture);
                return Ok(input);
            }
            CodecOp::Deinit | CodecOp::FlushBuffers => {
                self.engine.control(ctx.get(), cmd.op);
                return Ok(input);
            }
            CodecOp::DecodeVideoAndPictureCopy => {
                log::error!("{:?} needs protocol v3", cmd.op);
                return Err(libc::EINVAL);
            }
            _ => (),
        }

        let record = self.slot_record(ctx).map_err(invalid)?;
        let external = match input {
            Some(offset) => Some(self.block_bytes(offset)?),
            None => None,
        };
        let outcome = self
            .engine
            .execute(ctx.get(), cmd.op, &record, external)
            .map_err(invalid)?;

        let head_offset = v1::record_offset(ctx).map_err(|e| invalid(e.into()))?;
        self.write(head_offset, &outcome.head)?;
        if outcome.has_output {
            self.engine.queue_output(ctx.get(), outcome.output);
        }
        self.requests.push(HostRequest {
            op: cmd.op,
            ctx: ctx.get(),
            header: Some(header),
            record,
            input,
            payload: outcome.input,
        });

        Ok(input)
    }

    /// Runs a command framed in a request buffer, and places its response in a new result
    /// buffer.
    fn run_fetch_command(&mut self, cmd: &Command, buffer_size: i32) -> Result<FetchResult, i32> {
        let ctx = self.context(cmd.ctx_index)?;

        match cmd.op {
            CodecOp::Deinit | CodecOp::FlushBuffers => {
                if let Some(offset) = cmd.offset {
                    if !self.pool.release(offset) {
                        let message = format!("{:?} with unallocated offset {}", cmd.op, offset);
                        return Err(self.violation(message));
                    }
                }
                self.engine.control(ctx.get(), cmd.op);
                return Ok(FetchResult {
                    status: 0,
                    offset: None,
                });
            }
            CodecOp::PictureCopy => {
                let picture = self.engine.last_picture(ctx.get()).ok_or(libc::ENODATA)?;
                let size = match u32::try_from(buffer_size) {
                    Ok(size) if size > 0 => size,
                    _ => picture.len() as u32,
                };
                let (offset, is_last) = self.allocate(size)?;
                let len = picture.len().min(size as usize);
                self.write(offset, &picture[..len])?;
                return Ok(FetchResult {
                    status: is_last as i32,
                    offset: Some(offset),
                });
            }
            _ => (),
        }

        let input = cmd.offset.ok_or_else(|| {
            log::error!("{:?} without a request buffer", cmd.op);
            libc::EINVAL
        })?;
        let record = self.block_bytes(input)?;
        let outcome = self
            .engine
            .execute(ctx.get(), cmd.op, &record, None)
            .map_err(invalid)?;

        let fused = cmd.op == CodecOp::DecodeVideoAndPictureCopy;
        let picture_size = buffer_size.max(0) as u32;
        let size = if fused {
            PICTURE_BUFFER_BIAS + picture_size
        } else {
            (outcome.head.len() + outcome.output.len()) as u32
        };

        // The request buffer is only consumed once the result buffer exists.
        let (offset, is_last) = self.allocate(size)?;
        self.write(offset, &outcome.head)?;
        if let Some(after_head) = offset.checked_add(outcome.head.len() as u32) {
            self.write(after_head, &outcome.output)?;
        }
        if let (true, Some(picture)) = (fused, &outcome.picture) {
            let len = picture.len().min(picture_size as usize);
            if let Some(picture_offset) = offset.checked_add(PICTURE_BUFFER_BIAS) {
                self.write(picture_offset, &picture[..len])?;
            }
        }

        self.pool.release(input);
        self.requests.push(HostRequest {
            op: cmd.op,
            ctx: ctx.get(),
            header: None,
            record,
            input: Some(input),
            payload: outcome.input,
        });

        Ok(FetchResult {
            status: is_last as i32,
            offset: Some(offset),
        })
    }
}

/// Host side of the codec device, running in-process.
///
/// Clones share the same device: several sessions opened on clones of one host see the same
/// memory and the same contexts.
#[derive(Clone)]
pub struct LoopbackHost {
    state: Arc<Mutex<HostState>>,
}

impl LoopbackHost {
    pub fn with_config(config: LoopbackConfig) -> anyhow::Result<Self> {
        let region =
            MemFdRegion::new(config.arena_size as u64).context("creating device memory")?;
        let view = Arena::map(&region, config.arena_size).context("mapping device memory")?;

        let start = SLOT_REGION_SIZE;
        let end = (start as u64 + config.pool_size as u64).min(config.arena_size as u64) as u32;
        if end <= start {
            bail!(
                "device memory of {:#x} bytes leaves no room for the buffer pool",
                config.arena_size
            );
        }

        let engine = Engine {
            codecs: config.codecs.clone(),
            contexts: BTreeMap::new(),
            outputs: BTreeMap::new(),
        };

        Ok(Self {
            state: Arc::new(Mutex::new(HostState {
                config,
                region,
                view,
                pool: Pool {
                    start,
                    end,
                    blocks: BTreeMap::new(),
                },
                engine,
                calls: Vec::new(),
                requests: Vec::new(),
                violations: Vec::new(),
                map_count: 0,
            })),
        })
    }

    pub fn new(version: ProtocolVersion) -> anyhow::Result<Self> {
        Self::with_config(LoopbackConfig {
            version: version as u32,
            ..Default::default()
        })
    }

    /// Creates a host whose buffer pool is limited to `pool_size` bytes.
    pub fn with_pool_size(version: ProtocolVersion, pool_size: u32) -> anyhow::Result<Self> {
        Self::with_config(LoopbackConfig {
            version: version as u32,
            pool_size,
            ..Default::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: HostCall) -> MutexGuard<'_, HostState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    pub fn arena_size(&self) -> usize {
        self.lock().config.arena_size
    }

    pub fn codecs(&self) -> Vec<CodecDescriptor> {
        self.lock().config.codecs.clone()
    }

    /// Number of times the device memory has been mapped by the guest.
    pub fn map_count(&self) -> usize {
        self.lock().map_count
    }

    /// Returns the calls received since the last call to this method.
    pub fn take_calls(&self) -> Vec<HostCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn requests(&self) -> Vec<HostRequest> {
        self.lock().requests.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    /// Number of pool blocks currently handed out.
    pub fn held_blocks(&self) -> usize {
        self.lock().pool.blocks.len()
    }

    /// The last picture decoded on context `ctx`.
    pub fn last_picture(&self, ctx: u32) -> Option<Vec<u8>> {
        self.lock().engine.last_picture(ctx)
    }
}

impl CodecDevice for LoopbackHost {
    fn map_arena(&self, len: usize) -> Result<Arena, i32> {
        let mut state = self.lock();
        if len > state.config.arena_size {
            log::error!(
                "cannot map {:#x} bytes of a {:#x} bytes device memory",
                len,
                state.config.arena_size
            );
            return Err(libc::EINVAL);
        }

        let arena = Arena::map(&state.region, len).map_err(|e| match e {
            ArenaError::Map(errno) => errno as i32,
            _ => libc::EINVAL,
        })?;
        state.map_count += 1;

        Ok(arena)
    }

    fn version(&self) -> Result<u32, i32> {
        Ok(self.record(HostCall::GetVersion).config.version)
    }

    fn elements_size(&self) -> Result<u32, i32> {
        let state = self.record(HostCall::GetElementsSize);
        Ok((state.engine.codecs.len() * std::mem::size_of::<CodecElement>()) as u32)
    }

    fn elements(&self, buf: &mut [u8]) -> Result<(), i32> {
        let state = self.record(HostCall::GetElements);
        let mut w = buf;
        for codec in &state.engine.codecs {
            w.write_obj(codec.to_element()).map_err(|e| {
                log::error!("element buffer too small: {}", e);
                libc::EINVAL
            })?;
        }

        Ok(())
    }

    fn context_index(&self) -> Result<u32, i32> {
        let mut state = self.record(HostCall::GetContextIndex);
        state.engine.reserve_context().ok_or(libc::ENOSPC)
    }

    fn secure_buffer(&self, ctx: u32, size: u32) -> Result<ArenaOffset, i32> {
        let mut state = self.record(HostCall::SecureBuffer);
        let (offset, _) = state.allocate(size)?;
        log::trace!("context {}: secured {} bytes at {}", ctx, size, offset);

        Ok(offset)
    }

    fn try_secure_buffer(&self, size: u32) -> Result<Option<ArenaOffset>, i32> {
        let mut state = self.record(HostCall::TrySecureBuffer);
        Ok(state.pool.allocate(size).map(|(offset, _)| offset))
    }

    fn release_buffer(&self, offset: ArenaOffset) -> Result<(), i32> {
        let mut state = self.record(HostCall::ReleaseBuffer);
        if state.pool.release(offset) {
            Ok(())
        } else {
            Err(state.violation(format!("release of unallocated offset {}", offset)))
        }
    }

    fn write_command(&self, cmd: &Command) -> Result<(), i32> {
        let mut state = self.record(HostCall::WriteCommand(cmd.op));
        state.require(ProtocolVersion::V1)?;
        state.run_slot_command(cmd).map(|_| ())
    }

    fn invoke_and_release(&self, cmd: &Command) -> Result<i32, i32> {
        let mut state = self.record(HostCall::InvokeAndRelease(cmd.op));
        state.require(ProtocolVersion::V2)?;

        if let Some(input) = state.run_slot_command(cmd)? {
            state.pool.release(input);
        }

        Ok(0)
    }

    fn invoke_and_fetch(&self, cmd: &Command, buffer_size: i32) -> Result<FetchResult, i32> {
        let mut state = self.record(HostCall::InvokeAndFetch(cmd.op));
        state.require(ProtocolVersion::V3)?;
        state.run_fetch_command(cmd, buffer_size)
    }

    fn put_data_into_buffer(&self, ctx: u32, size: u32) -> Result<PutData, i32> {
        let mut state = self.record(HostCall::PutDataIntoBuffer);
        let data = state
            .engine
            .outputs
            .get_mut(&ctx)
            .and_then(VecDeque::pop_front)
            .ok_or(libc::ENODATA)?;

        let block_size = size.max(data.len() as u32);
        let (offset, is_last) = match state.allocate(block_size) {
            Ok(block) => block,
            Err(e) => {
                state.engine.outputs.entry(ctx).or_default().push_front(data);
                return Err(e);
            }
        };
        state.write(offset, &data)?;

        Ok(PutData { offset, is_last })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::context::CodecContext;
    use crate::transport::WireProtocol;

    /// Reserves a context and initializes codec `name` on it.
    pub fn init_context<P: WireProtocol>(
        protocol: &P,
        alloc: &BufferAllocator<LoopbackHost>,
        name: &str,
    ) -> ContextIndex {
        let host = alloc.device();
        let ctx = ContextIndex::new(host.context_index().unwrap()).unwrap();
        let descriptor = host
            .codecs()
            .into_iter()
            .find(|d| d.name == name)
            .unwrap();
        let context = CodecContext::new(descriptor);

        let succeeded = match context.media_kind() {
            MediaKind::Video => matches!(
                protocol
                    .transact::<_, marshal::InitVideo, _>(
                        alloc,
                        ctx,
                        CodecOp::Init,
                        context.init_input().unwrap(),
                        &[],
                    )
                    .unwrap(),
                Response::Ok { .. }
            ),
            MediaKind::Audio => matches!(
                protocol
                    .transact::<_, marshal::InitAudio, _>(
                        alloc,
                        ctx,
                        CodecOp::Init,
                        context.init_input().unwrap(),
                        &[],
                    )
                    .unwrap(),
                Response::Ok { .. }
            ),
        };
        assert!(succeeded, "init of {} failed", name);

        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: u32) -> Pool {
        Pool {
            start: 0x1000,
            end: 0x1000 + size,
            blocks: BTreeMap::new(),
        }
    }

    #[test]
    fn pool_is_first_fit() {
        let mut pool = pool(4 * BLOCK_SIZE);

        let (a, _) = pool.allocate(1).unwrap();
        let (b, _) = pool.allocate(BLOCK_SIZE + 1).unwrap();
        assert_eq!(a.get(), 0x1000);
        assert_eq!(b.get(), 0x1000 + BLOCK_SIZE);
        assert_eq!(pool.requested(b), Some(BLOCK_SIZE + 1));

        // The hole left by `a` is reused before the end of the pool.
        assert!(pool.release(a));
        let (c, _) = pool.allocate(0).unwrap();
        assert_eq!(c, a);
        assert!(!pool.release(ArenaOffset::new(0x1001)));
    }

    #[test]
    fn last_block_is_flagged() {
        let mut pool = pool(4 * BLOCK_SIZE);

        let (_, is_last) = pool.allocate(2 * BLOCK_SIZE).unwrap();
        assert!(!is_last);
        // One more block of the same size still fits after this one.
        let (_, is_last) = pool.allocate(BLOCK_SIZE).unwrap();
        assert!(!is_last);
        let (_, is_last) = pool.allocate(BLOCK_SIZE).unwrap();
        assert!(is_last);
        assert!(pool.allocate(1).is_none());
        assert_eq!(pool.free_space(), 0);
    }

    #[test]
    fn release_of_unknown_offset_is_a_violation() {
        let host = LoopbackHost::new(ProtocolVersion::V3).unwrap();

        assert_eq!(host.release_buffer(ArenaOffset::new(0x1234)), Err(libc::EFAULT));
        let offset = host.secure_buffer(1, 10).unwrap();
        host.release_buffer(offset).unwrap();
        assert_eq!(host.release_buffer(offset), Err(libc::EFAULT));
        assert_eq!(host.violations().len(), 2);
    }

    #[test]
    fn request_in_unallocated_memory_is_a_violation() {
        let host = LoopbackHost::new(ProtocolVersion::V3).unwrap();
        let ctx = host.context_index().unwrap();

        let cmd = Command::new(CodecOp::EncodeAudio, ctx, Some(ArenaOffset::new(0x10000)));
        assert_eq!(host.invoke_and_fetch(&cmd, 0).err(), Some(libc::EFAULT));
        assert_eq!(host.violations().len(), 1);
    }

    #[test]
    fn calls_of_other_generations_are_refused() {
        let host = LoopbackHost::new(ProtocolVersion::V2).unwrap();
        let cmd = Command::new(CodecOp::FlushBuffers, 1, None);

        assert_eq!(host.write_command(&cmd), Err(libc::ENOTTY));
        assert_eq!(host.invoke_and_fetch(&cmd, -1).err(), Some(libc::ENOTTY));
        assert_eq!(
            host.take_calls(),
            vec![
                HostCall::WriteCommand(CodecOp::FlushBuffers),
                HostCall::InvokeAndFetch(CodecOp::FlushBuffers),
            ]
        );
    }

    #[test]
    fn context_indices_are_reused() {
        let host = LoopbackHost::new(ProtocolVersion::V3).unwrap();

        assert_eq!(host.context_index(), Ok(1));
        assert_eq!(host.context_index(), Ok(2));
        let cmd = Command::new(CodecOp::Deinit, 1, None);
        host.invoke_and_fetch(&cmd, -1).unwrap();
        assert_eq!(host.context_index(), Ok(1));
    }

    #[test]
    fn elements_advertise_every_codec() {
        let host = LoopbackHost::new(ProtocolVersion::V1).unwrap();

        let descriptors = elements::query_elements(&host).unwrap();
        assert_eq!(descriptors, LoopbackConfig::default().codecs);
        assert_eq!(
            host.take_calls(),
            vec![HostCall::GetElementsSize, HostCall::GetElements]
        );
    }
}
