// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sessions with the codec device, and the process-wide arena mapping they share.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::allocator::BufferAllocator;
use crate::arena::Arena;
use crate::context::CodecContext;
use crate::context::ContextIndex;
use crate::context::MediaKind;
use crate::devices::chardev::CharDevice;
use crate::elements;
use crate::elements::CodecDescriptor;
use crate::error::CodecError;
use crate::error::Result;
use crate::handoff::OutputBuffer;
use crate::handoff::PictureSource;
use crate::marshal;
use crate::marshal::Response;
use crate::protocol::AudioDecodeInput;
use crate::protocol::AudioEncodeInput;
use crate::protocol::CodecOp;
use crate::protocol::DeviceCall;
use crate::protocol::ProtocolVersion;
use crate::protocol::VideoData;
use crate::protocol::VideoDecodeInput;
use crate::protocol::VideoEncodeInput;
use crate::protocol::ARENA_SIZE;
use crate::protocol::CODEC_DEVICE_PATH;
use crate::transport::signed_wire_size;
use crate::transport::wire_size;
use crate::transport::PendingPicture;
use crate::transport::Transport;
use crate::CodecDevice;

#[derive(Default)]
struct RegistryState {
    arena: Option<Arc<Arena>>,
    open_count: usize,
}

/// Keeps track of the arena mapping of a process.
///
/// The arena is mapped by the first session to open, shared by all the following ones, and
/// unmapped once the last session has closed and the last buffer aliasing it has been dropped.
pub struct ArenaRegistry {
    state: Mutex<RegistryState>,
}

/// The registry used by [`DeviceSession::open`].
pub static ARENA_REGISTRY: ArenaRegistry = ArenaRegistry::new();

impl ArenaRegistry {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                arena: None,
                open_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new opener, mapping the arena with `map` if this is the first one.
    pub fn acquire<F>(&'static self, map: F) -> Result<ArenaLease>
    where
        F: FnOnce(usize) -> std::result::Result<Arena, i32>,
    {
        let mut state = self.lock();

        let arena = match &state.arena {
            Some(arena) => Arc::clone(arena),
            None => {
                let arena = map(ARENA_SIZE).map_err(|e| {
                    log::error!("failed to map the device memory: {}", e);
                    CodecError::DeviceUnavailable(format!("cannot map device memory: errno {}", e))
                })?;
                let arena = Arc::new(arena);
                state.arena = Some(Arc::clone(&arena));
                arena
            }
        };
        state.open_count += 1;
        log::debug!("arena acquired, {} openers", state.open_count);

        Ok(ArenaLease {
            registry: self,
            arena,
        })
    }

    fn release(&self) {
        let mut state = self.lock();

        match state.open_count {
            0 => log::error!("arena released more times than acquired"),
            1 => {
                state.open_count = 0;
                // The mapping goes away with the last reference to it.
                state.arena = None;
                log::debug!("last opener gone, dropping arena");
            }
            _ => {
                state.open_count -= 1;
                log::debug!("arena released, {} openers left", state.open_count);
            }
        }
    }

    /// Runs `f` while holding the registry lock, serializing it against other openers.
    pub(crate) fn serialize<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn is_mapped(&self) -> bool {
        self.lock().arena.is_some()
    }

    /// Returns the current arena mapping, if any.
    pub fn current(&self) -> Option<Arc<Arena>> {
        self.lock().arena.clone()
    }
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that an opener is registered. Unregisters it when dropped.
pub struct ArenaLease {
    registry: &'static ArenaRegistry,
    arena: Arc<Arena>,
}

impl ArenaLease {
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }
}

impl Drop for ArenaLease {
    fn drop(&mut self) {
        self.registry.release();
    }
}

/// Outcome of a video decode.
#[derive(Debug)]
pub struct DecodedVideo {
    /// Number of input bytes consumed by the decoder.
    pub len: i32,
    /// Where to get the decoded picture from, if one was produced.
    pub picture: Option<PictureSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAudio {
    pub len: i32,
    pub samples: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVideo {
    pub data: Vec<u8>,
    pub coded_frame: bool,
    pub key_frame: bool,
}

/// An open session with the codec device.
pub struct DeviceSession<D: CodecDevice = CharDevice> {
    device: Arc<D>,
    allocator: BufferAllocator<D>,
    lease: ArenaLease,
    transport: Transport,
    media_kind: MediaKind,
}

impl DeviceSession<CharDevice> {
    /// Opens the codec device node and maps the process arena if needed.
    pub fn open(media_kind: MediaKind) -> Result<Self> {
        let device = CharDevice::open(CODEC_DEVICE_PATH).map_err(|e| {
            log::error!("failed to open {}: {:#}", CODEC_DEVICE_PATH, e);
            CodecError::DeviceUnavailable(format!("cannot open {}: {}", CODEC_DEVICE_PATH, e))
        })?;

        Self::open_with(&ARENA_REGISTRY, device, media_kind)
    }
}

fn rejected<F>(op: CodecOp, response: Response<F>) -> Result<(i32, F, Vec<u8>)> {
    match response {
        Response::Ok {
            result,
            fields,
            payload,
        } => Ok((result, fields, payload)),
        Response::Failed(result) => {
            log::warn!("host codec rejected {:?}: {}", op, result);
            Err(CodecError::Rejected { op, result })
        }
    }
}

impl<D: CodecDevice> DeviceSession<D> {
    /// Opens a session on `device`, sharing the arena mapping tracked by `registry`.
    ///
    /// Fails if the host speaks an unknown protocol version, in which case the registration with
    /// `registry` is undone.
    pub fn open_with(
        registry: &'static ArenaRegistry,
        device: D,
        media_kind: MediaKind,
    ) -> Result<Self> {
        let device = Arc::new(device);
        let lease = registry.acquire(|len| device.map_arena(len))?;

        let raw_version = device
            .version()
            .map_err(|e| CodecError::protocol(DeviceCall::GetVersion, e))?;
        let version = ProtocolVersion::n(raw_version).ok_or_else(|| {
            log::error!("host speaks unsupported protocol version {}", raw_version);
            CodecError::UnsupportedVersion(raw_version)
        })?;
        log::info!("opened codec device, protocol version {}", raw_version);

        let allocator = BufferAllocator::new(Arc::clone(&device), Arc::clone(lease.arena()));

        Ok(Self {
            device,
            allocator,
            lease,
            transport: Transport::new(version),
            media_kind,
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.transport.version()
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub fn allocator(&self) -> &BufferAllocator<D> {
        &self.allocator
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Returns the codecs offered by the host.
    pub fn elements(&self) -> Result<Vec<CodecDescriptor>> {
        elements::query_elements(&*self.device)
    }

    fn index(ctx: &CodecContext) -> Result<ContextIndex> {
        ctx.index().ok_or(CodecError::NotInitialized)
    }

    /// Creates the codec instance of `ctx` on the host.
    pub fn init(&self, ctx: &mut CodecContext) -> Result<()> {
        if ctx.is_initialized() {
            log::warn!("context {:?} is already initialized", ctx.index());
        }

        // Context creation is serialized with the other openers of the device.
        self.lease.registry.serialize(|| {
            let raw_index = self
                .device
                .context_index()
                .map_err(|e| CodecError::protocol(DeviceCall::GetContextIndex, e))?;
            let index = ContextIndex::new(raw_index)
                .ok_or_else(|| CodecError::protocol(DeviceCall::GetContextIndex, libc::EINVAL))?;

            let fields = ctx.init_input()?;
            match ctx.media_kind() {
                MediaKind::Video => {
                    let response = self.transport.transact::<D, marshal::InitVideo, _>(
                        &self.allocator,
                        index,
                        CodecOp::Init,
                        fields,
                        &ctx.extradata,
                    )?;
                    rejected(CodecOp::Init, response)?;
                }
                MediaKind::Audio => {
                    let response = self.transport.transact::<D, marshal::InitAudio, _>(
                        &self.allocator,
                        index,
                        CodecOp::Init,
                        fields,
                        &ctx.extradata,
                    )?;
                    let (_, output, _) = rejected(CodecOp::Init, response)?;
                    ctx.audio.sample_fmt = output.sample_fmt;
                    ctx.audio.frame_size = output.frame_size;
                    ctx.audio.bits_per_sample_fmt = output.bits_per_sample_fmt;
                }
            }

            log::debug!("initialized {} as context {}", ctx.descriptor.name, index.get());
            ctx.set_index(index);

            Ok(())
        })
    }

    /// Destroys the codec instance of `ctx` on the host.
    pub fn deinit(&self, ctx: &mut CodecContext) -> Result<()> {
        let index = ctx.take_index().ok_or(CodecError::NotInitialized)?;
        self.transport
            .control(&self.allocator, index, CodecOp::Deinit)
    }

    /// Drops the frames buffered by the codec instance of `ctx`.
    pub fn flush(&self, ctx: &CodecContext) -> Result<()> {
        self.transport
            .control(&self.allocator, Self::index(ctx)?, CodecOp::FlushBuffers)
    }

    /// Decodes `input`, updating the video format of `ctx` with the one reported by the host.
    ///
    /// When a picture is produced, the returned [`PictureSource`] must be passed to
    /// [`Self::produce_output_buffer`].
    pub fn decode_video(
        &self,
        ctx: &mut CodecContext,
        input: &[u8],
        idx: i32,
        in_offset: i64,
    ) -> Result<DecodedVideo> {
        let index = Self::index(ctx)?;
        let fields = VideoDecodeInput {
            inbuf_size: signed_wire_size(input.len())?,
            idx,
            in_offset,
        };

        let fused = match (self.transport.fused_decode(), ctx.picture_size()) {
            (Some(fetching), Some(picture_size)) => Some((fetching, picture_size)),
            _ => None,
        };

        let (response, pending) = match fused {
            Some((fetching, picture_size)) => {
                let picture_size = wire_size(picture_size)?;
                fetching.decode_and_copy(&self.allocator, index, fields, input, picture_size)?
            }
            None => (
                self.transport.transact::<D, marshal::DecodeVideo, _>(
                    &self.allocator,
                    index,
                    CodecOp::DecodeVideo,
                    fields,
                    input,
                )?,
                None,
            ),
        };

        let op = match fused {
            Some(_) => CodecOp::DecodeVideoAndPictureCopy,
            None => CodecOp::DecodeVideo,
        };
        let (len, output, _) = rejected(op, response)?;
        Self::update_video(&mut ctx.video, &output.video);

        let picture = match (output.got_picture != 0, pending) {
            (true, Some(pending)) => Some(PictureSource::Fused(pending)),
            (true, None) => Some(PictureSource::Copy),
            (false, Some(pending)) => {
                // Cannot happen with a well-behaved host, but do not leak the buffer.
                self.allocator.release(pending.handle)?;
                None
            }
            (false, None) => None,
        };

        Ok(DecodedVideo { len, picture })
    }

    fn update_video(video: &mut VideoData, reported: &VideoData) {
        video.width = reported.width;
        video.height = reported.height;
        video.pix_fmt = reported.pix_fmt;
        if reported.fps_d != 0 {
            video.fps_n = reported.fps_n;
            video.fps_d = reported.fps_d;
        }
        if reported.par_d != 0 {
            video.par_n = reported.par_n;
            video.par_d = reported.par_d;
        }
    }

    /// Returns the decoded picture of `ctx`, `size` bytes long, as a buffer for the pipeline.
    pub fn produce_output_buffer(
        &self,
        ctx: &CodecContext,
        size: usize,
        source: PictureSource,
    ) -> Result<OutputBuffer<D>> {
        let pending: PendingPicture = match source {
            PictureSource::Fused(pending) => pending,
            PictureSource::Copy => {
                self.transport
                    .picture_copy(&self.allocator, Self::index(ctx)?, wire_size(size)?)?
            }
        };

        OutputBuffer::from_picture(&self.allocator, pending, size)
    }

    /// Returns a buffer of `size` bytes for the pipeline to fill, in the arena if possible.
    pub fn alloc_output_buffer(&self, size: usize) -> OutputBuffer<D> {
        OutputBuffer::allocate(&self.allocator, size)
    }

    pub fn decode_audio(&self, ctx: &mut CodecContext, input: &[u8]) -> Result<DecodedAudio> {
        let index = Self::index(ctx)?;
        let response = self.transport.transact::<D, marshal::DecodeAudio, _>(
            &self.allocator,
            index,
            CodecOp::DecodeAudio,
            AudioDecodeInput {
                inbuf_size: signed_wire_size(input.len())?,
            },
            input,
        )?;

        let (len, output, samples) = rejected(CodecOp::DecodeAudio, response)?;
        if output.have_data > 0 {
            ctx.audio.sample_rate = output.sample_rate;
            ctx.audio.channels = output.channels;
            ctx.audio.channel_layout = output.channel_layout;
        }

        Ok(DecodedAudio { len, samples })
    }

    pub fn encode_video(
        &self,
        ctx: &CodecContext,
        input: &[u8],
        in_timestamp: i64,
    ) -> Result<EncodedVideo> {
        let response = self.transport.transact::<D, marshal::EncodeVideo, _>(
            &self.allocator,
            Self::index(ctx)?,
            CodecOp::EncodeVideo,
            VideoEncodeInput {
                inbuf_size: signed_wire_size(input.len())?,
                in_timestamp,
            },
            input,
        )?;

        let (_, output, data) = rejected(CodecOp::EncodeVideo, response)?;

        Ok(EncodedVideo {
            data,
            coded_frame: output.coded_frame != 0,
            key_frame: output.key_frame != 0,
        })
    }

    /// Encodes `input`, producing at most `max_size` bytes.
    pub fn encode_audio(&self, ctx: &CodecContext, input: &[u8], max_size: i32) -> Result<Vec<u8>> {
        let response = self.transport.transact::<D, marshal::EncodeAudio, _>(
            &self.allocator,
            Self::index(ctx)?,
            CodecOp::EncodeAudio,
            AudioEncodeInput {
                inbuf_size: signed_wire_size(input.len())?,
                max_size,
            },
            input,
        )?;

        let (_, _, data) = rejected(CodecOp::EncodeAudio, response)?;

        Ok(data)
    }

    /// Closes the session.
    ///
    /// Arena ranges still held by the session are returned to the host. Output buffers handed to
    /// the pipeline keep their range until they are dropped, and the device is closed once no
    /// buffer refers to it anymore.
    pub fn close(self) -> Result<()> {
        let DeviceSession {
            device,
            allocator,
            lease,
            ..
        } = self;

        let leftovers = allocator.release_all();
        if leftovers > 0 {
            log::warn!("released {} buffers left over at close", leftovers);
        }
        drop(allocator);
        drop(lease);

        match Arc::try_unwrap(device) {
            Ok(device) => device.close().map_err(|e| {
                log::error!("failed to close codec device: {}", e);
                CodecError::DeviceUnavailable(format!("close failed: errno {}", e))
            }),
            Err(_) => {
                log::warn!("codec device still referenced by live buffers, closing it with them");
                Ok(())
            }
        }
    }
}
