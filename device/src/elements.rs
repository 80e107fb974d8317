// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Discovery of the codecs offered by the host.

use std::io::Cursor;

use crate::context::CodecKind;
use crate::context::MediaKind;
use crate::error::CodecError;
use crate::error::Result;
use crate::io::ReadWireExt;
use crate::protocol::CodecElement;
use crate::protocol::DeviceCall;
use crate::protocol::CODEC_LONG_NAME_LEN;
use crate::protocol::CODEC_MAX_FORMATS;
use crate::protocol::CODEC_NAME_LEN;
use crate::CodecDevice;

const ELEMENT_SIZE: usize = std::mem::size_of::<CodecElement>();

/// A codec supported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    pub name: String,
    pub long_name: String,
    pub kind: CodecKind,
    pub media: MediaKind,
    /// Pixel formats for video codecs, sample formats for audio codecs.
    pub formats: Vec<i32>,
}

pub(crate) fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn fill_c_string<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = s.len().min(N - 1);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

impl CodecDescriptor {
    /// Parses an element advertised by the host. Returns `None` if the element uses a codec or
    /// media type this crate does not know about.
    pub fn from_element(element: &CodecElement) -> Option<Self> {
        let (codec_type, media_type) = (element.codec_type, element.media_type);
        let kind = CodecKind::n(codec_type)?;
        let media = MediaKind::n(media_type)?;
        let formats = element.formats;

        Some(Self {
            name: c_string(&element.name),
            long_name: c_string(&element.longname),
            kind,
            media,
            formats: formats.iter().copied().take_while(|f| *f != -1).collect(),
        })
    }

    /// Builds the wire element advertising this codec. Names and formats that do not fit are
    /// truncated.
    pub fn to_element(&self) -> CodecElement {
        let mut formats = [-1i32; CODEC_MAX_FORMATS];
        for (dst, src) in formats.iter_mut().zip(self.formats.iter()) {
            *dst = *src;
        }

        CodecElement {
            codec_type: self.kind as i32,
            media_type: self.media as i32,
            name: fill_c_string::<CODEC_NAME_LEN>(&self.name),
            longname: fill_c_string::<CODEC_LONG_NAME_LEN>(&self.long_name),
            formats,
        }
    }
}

/// Retrieves the list of codecs supported by the host.
pub fn query_elements<D: CodecDevice + ?Sized>(device: &D) -> Result<Vec<CodecDescriptor>> {
    let size = device
        .elements_size()
        .map_err(|e| CodecError::protocol(DeviceCall::GetElementsSize, e))? as usize;
    if size % ELEMENT_SIZE != 0 {
        log::warn!(
            "codec element list size {} is not a multiple of {}, ignoring trailing bytes",
            size,
            ELEMENT_SIZE
        );
    }

    let mut buf = vec![0u8; size];
    device
        .elements(&mut buf)
        .map_err(|e| CodecError::protocol(DeviceCall::GetElements, e))?;

    let mut cursor = Cursor::new(buf);
    let mut descriptors = Vec::with_capacity(size / ELEMENT_SIZE);
    for _ in 0..size / ELEMENT_SIZE {
        let element = cursor.read_obj::<CodecElement>()?;
        match CodecDescriptor::from_element(&element) {
            Some(descriptor) => descriptors.push(descriptor),
            None => {
                let (codec_type, media_type) = (element.codec_type, element.media_type);
                log::warn!(
                    "ignoring codec {:?} with unknown type {}/{}",
                    c_string(&element.name),
                    codec_type,
                    media_type
                );
            }
        }
    }

    log::debug!("host offers {} codecs", descriptors.len());

    Ok(descriptors)
}
