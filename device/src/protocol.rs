// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-layout records exchanged with the host codec device.
//!
//! Everything in this module is part of a bit-exact shared-memory ABI: records are packed, use
//! fixed-width integers, and are transmitted in little-endian order through [`crate::io`].

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Path of the codec device node.
pub const CODEC_DEVICE_PATH: &str = "/dev/brillcodec";

/// Size of the memory region shared with the host.
pub const ARENA_SIZE: usize = 32 * 1024 * 1024;

/// Size of the per-context metadata slot used by protocol generations 1 and 2.
pub const METADATA_SLOT_SIZE: u32 = 256;

/// Size of the header at the start of a metadata slot.
pub const SLOT_HEADER_SIZE: u32 = std::mem::size_of::<SlotHeader>() as u32;

/// Distance between the start of a fused decode-and-copy result buffer and its pixel data.
pub const PICTURE_BUFFER_BIAS: u32 = 0x100;

/// Magic number of the device-control calls.
pub const CODEC_IOCTL_MAGIC: u8 = b'B';

/// Length of the codec name field in wire records.
pub const CODEC_NAME_LEN: usize = 32;
/// Length of the codec long name field in wire records.
pub const CODEC_LONG_NAME_LEN: usize = 64;
/// Number of format entries advertised per codec element.
pub const CODEC_MAX_FORMATS: usize = 4;

/// Protocol generation spoken by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

/// Operations understood by the host codec engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CodecOp {
    Init = 0,
    DecodeVideo = 1,
    EncodeVideo = 2,
    DecodeAudio = 3,
    EncodeAudio = 4,
    PictureCopy = 5,
    Deinit = 6,
    FlushBuffers = 7,
    /// Protocol v3 only.
    DecodeVideoAndPictureCopy = 8,
}

/// Device-control call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum DeviceCall {
    GetVersion = 0,
    GetElementsSize = 1,
    GetElements = 2,
    GetContextIndex = 3,
    SecureBuffer = 4,
    TrySecureBuffer = 5,
    ReleaseBuffer = 6,
    InvokeAndFetch = 7,
    PutDataIntoBuffer = 8,
    InvokeAndRelease = 9,
    /// Not an ioctl: the v1 command record written to the device.
    WriteCommand = 0x100,
}

/// Argument of every device-control call.
///
/// Scalar queries (version, context index, elements size) and the release call carry their
/// single value in the first word.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct IoctlData {
    pub api_index: u32,
    pub ctx_index: u32,
    pub mem_offset: u32,
    pub buffer_size: i32,
}

impl IoctlData {
    pub fn scalar(value: u32) -> Self {
        Self {
            api_index: value,
            ..Default::default()
        }
    }

    pub fn first_word(&self) -> u32 {
        self.api_index
    }
}

/// Command record written to the device by protocol v1.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct CommandRecord {
    pub api_index: i32,
    pub ctx_index: i32,
    pub mem_offset: u32,
}

/// Header at the start of a context's metadata slot.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct SlotHeader {
    pub api_index: i32,
    pub mem_offset: u32,
}

/// Video format shared between guest and host.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct VideoData {
    pub width: i32,
    pub height: i32,
    pub fps_n: i32,
    pub fps_d: i32,
    pub par_n: i32,
    pub par_d: i32,
    /// `-1` while unknown.
    pub pix_fmt: i32,
    pub bpp: i32,
    pub ticks_per_frame: i32,
}

/// Audio format shared between guest and host.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct AudioData {
    pub channels: i32,
    pub sample_rate: i32,
    pub block_align: i32,
    pub depth: i32,
    pub sample_fmt: i32,
    pub frame_size: i32,
    pub bits_per_sample_fmt: i32,
    pub reserved: i32,
    pub channel_layout: i64,
}

/// Codec descriptor as advertised by the host.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct CodecElement {
    pub codec_type: i32,
    pub media_type: i32,
    pub name: [u8; CODEC_NAME_LEN],
    pub longname: [u8; CODEC_LONG_NAME_LEN],
    /// Pixel formats for video codecs, sample formats for audio ones. `-1` terminates the list.
    pub formats: [i32; CODEC_MAX_FORMATS],
}

/// Fields of an init request. Followed by `extradata_size` bytes of extradata.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct InitInput {
    pub codec_type: i32,
    pub name: [u8; CODEC_NAME_LEN],
    pub video: VideoData,
    pub audio: AudioData,
    pub bit_rate: i32,
    pub codec_tag: i32,
    pub extradata_size: i32,
}

/// Fields returned by a successful audio init.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct AudioInitOutput {
    pub sample_fmt: i32,
    pub frame_size: i32,
    pub bits_per_sample_fmt: i32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct VideoDecodeInput {
    pub inbuf_size: i32,
    pub idx: i32,
    pub in_offset: i64,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct VideoDecodeOutput {
    pub got_picture: i32,
    pub video: VideoData,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct VideoEncodeInput {
    pub inbuf_size: i32,
    pub in_timestamp: i64,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct VideoEncodeOutput {
    pub coded_frame: i32,
    pub key_frame: i32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct AudioDecodeInput {
    pub inbuf_size: i32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct AudioDecodeOutput {
    /// Number of decoded sample bytes following the fields.
    pub have_data: i32,
    pub sample_rate: i32,
    pub channels: i32,
    pub channel_layout: i64,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct AudioEncodeInput {
    pub inbuf_size: i32,
    pub max_size: i32,
}
