// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest-side state of a codec instance running on the host.

use std::num::NonZeroU32;

use enumn::N;

use crate::arena::ArenaOffset;
use crate::elements::CodecDescriptor;
use crate::error::Result;
use crate::protocol::AudioData;
use crate::protocol::InitInput;
use crate::protocol::VideoData;
use crate::protocol::CODEC_NAME_LEN;
use crate::protocol::METADATA_SLOT_SIZE;
use crate::transport::signed_wire_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(i32)]
pub enum MediaKind {
    Video = 0,
    Audio = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(i32)]
pub enum CodecKind {
    Decoder = 0,
    Encoder = 1,
}

/// Host-assigned index of a codec context. Indices start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextIndex(NonZeroU32);

impl ContextIndex {
    pub fn new(index: u32) -> Option<Self> {
        NonZeroU32::new(index).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Offset of the metadata slot reserved for this context by protocols v1 and v2, `None` if
    /// it cannot be expressed as an arena offset.
    pub fn metadata_offset(self) -> Option<ArenaOffset> {
        (self.get() - 1)
            .checked_mul(METADATA_SLOT_SIZE)
            .map(ArenaOffset::new)
    }
}

/// Raw pixel formats, numbered the way the host codec engine numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(i32)]
pub enum PixelFormat {
    Yuv420p = 0,
    Yuyv422 = 1,
    Rgb24 = 2,
    Bgr24 = 3,
    Yuv422p = 4,
    Yuv444p = 5,
    Yuv410p = 6,
    Yuv411p = 7,
    Gray8 = 8,
    Yuvj420p = 12,
    Yuvj422p = 13,
    Yuvj444p = 14,
    Uyvy422 = 17,
    Nv12 = 25,
    Nv21 = 26,
    Argb = 27,
    Rgba = 28,
    Abgr = 29,
    Bgra = 30,
}

impl PixelFormat {
    /// Size in bytes of a tightly packed `width`x`height` picture in this format.
    pub fn picture_size(self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        let luma = w.checked_mul(h)?;
        // Chroma planes round their dimensions up.
        let half = |v: usize| (v + 1) / 2;
        let quarter = |v: usize| (v + 3) / 4;

        let size = match self {
            PixelFormat::Yuv420p | PixelFormat::Yuvj420p | PixelFormat::Nv12 | PixelFormat::Nv21 => {
                luma + 2 * half(w) * half(h)
            }
            PixelFormat::Yuv422p | PixelFormat::Yuvj422p => luma + 2 * half(w) * h,
            PixelFormat::Yuv444p | PixelFormat::Yuvj444p => luma * 3,
            PixelFormat::Yuv410p => luma + 2 * quarter(w) * quarter(h),
            PixelFormat::Yuv411p => luma + 2 * quarter(w) * h,
            PixelFormat::Yuyv422 | PixelFormat::Uyvy422 => luma * 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => luma * 3,
            PixelFormat::Argb | PixelFormat::Rgba | PixelFormat::Abgr | PixelFormat::Bgra => {
                luma * 4
            }
            PixelFormat::Gray8 => luma,
        };

        Some(size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(i32)]
pub enum SampleFormat {
    U8 = 0,
    S16 = 1,
    S32 = 2,
    Flt = 3,
    Dbl = 4,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::Flt => 4,
            SampleFormat::Dbl => 8,
        }
    }
}

/// A codec instance, as seen from the guest.
///
/// The context is created uninitialized from the descriptor of the codec to use. It gets its
/// host-assigned index when it is initialized by [`crate::DeviceSession::init`], and loses it on
/// deinit.
#[derive(Debug, Clone)]
pub struct CodecContext {
    pub descriptor: CodecDescriptor,
    index: Option<ContextIndex>,
    pub video: VideoData,
    pub audio: AudioData,
    pub bit_rate: i32,
    pub codec_tag: i32,
    pub extradata: Vec<u8>,
}

impl CodecContext {
    pub fn new(descriptor: CodecDescriptor) -> Self {
        Self {
            descriptor,
            index: None,
            video: VideoData {
                pix_fmt: -1,
                ..Default::default()
            },
            audio: AudioData {
                sample_fmt: -1,
                ..Default::default()
            },
            bit_rate: 0,
            codec_tag: 0,
            extradata: Vec::new(),
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        self.descriptor.media
    }

    pub fn index(&self) -> Option<ContextIndex> {
        self.index
    }

    pub fn is_initialized(&self) -> bool {
        self.index.is_some()
    }

    pub(crate) fn set_index(&mut self, index: ContextIndex) {
        self.index = Some(index);
    }

    pub(crate) fn take_index(&mut self) -> Option<ContextIndex> {
        self.index.take()
    }

    /// Pixel format of the decoded pictures, if the host reported a known one.
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self.video.pix_fmt {
            -1 => None,
            fmt => PixelFormat::n(fmt),
        }
    }

    /// Size of a decoded picture, if it can be computed from the current video format.
    pub fn picture_size(&self) -> Option<usize> {
        let width = u32::try_from(self.video.width).ok().filter(|w| *w > 0)?;
        let height = u32::try_from(self.video.height).ok().filter(|h| *h > 0)?;
        self.pixel_format()?.picture_size(width, height)
    }

    pub fn sample_format(&self) -> Option<SampleFormat> {
        SampleFormat::n(self.audio.sample_fmt)
    }

    /// Builds the fields of the init request for this context.
    pub(crate) fn init_input(&self) -> Result<InitInput> {
        let mut name = [0u8; CODEC_NAME_LEN];
        let src = self.descriptor.name.as_bytes();
        // Keep the trailing NUL.
        let len = src.len().min(CODEC_NAME_LEN - 1);
        name[..len].copy_from_slice(&src[..len]);

        Ok(InitInput {
            codec_type: self.descriptor.kind as i32,
            name,
            video: self.video,
            audio: self.audio,
            bit_rate: self.bit_rate,
            codec_tag: self.codec_tag,
            extradata_size: signed_wire_size(self.extradata.len())?,
        })
    }
}
