// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Since the wire format uses little-endian, a guest using the same ordering does not need to
//! perform any swapping - hence the definitions here are no-ops.

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::io::LeWrapper;
use crate::protocol::AudioData;
use crate::protocol::AudioDecodeInput;
use crate::protocol::AudioDecodeOutput;
use crate::protocol::AudioEncodeInput;
use crate::protocol::AudioInitOutput;
use crate::protocol::CodecElement;
use crate::protocol::CommandRecord;
use crate::protocol::InitInput;
use crate::protocol::IoctlData;
use crate::protocol::SlotHeader;
use crate::protocol::VideoData;
use crate::protocol::VideoDecodeInput;
use crate::protocol::VideoDecodeOutput;
use crate::protocol::VideoEncodeInput;
use crate::protocol::VideoEncodeOutput;

/// Trait for types that can be sent as part of the codec protocol.
pub trait WireType: AsBytes + FromBytes + Sized {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(self)
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0
    }
}

impl WireType for () {}
impl WireType for u32 {}
impl WireType for i32 {}
impl WireType for i64 {}

impl WireType for IoctlData {}
impl WireType for CommandRecord {}
impl WireType for SlotHeader {}
impl WireType for CodecElement {}
impl WireType for VideoData {}
impl WireType for AudioData {}
impl WireType for InitInput {}
impl WireType for AudioInitOutput {}
impl WireType for VideoDecodeInput {}
impl WireType for VideoDecodeOutput {}
impl WireType for VideoEncodeInput {}
impl WireType for VideoEncodeOutput {}
impl WireType for AudioDecodeInput {}
impl WireType for AudioDecodeOutput {}
impl WireType for AudioEncodeInput {}
