// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serialization of codec requests and responses.
//!
//! A request is a 4-byte length prefix, the fixed-layout fields of the operation, and an optional
//! raw payload (bitstream, picture or samples). The prefix holds the number of bytes that follow
//! it.
//!
//! A response starts with the 4-byte result of the operation. A negative result is the whole
//! response. Otherwise it is followed by the fields of the operation and a payload, whose length
//! depends on the operation (see [`Reply`]).

use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use crate::io::ReadWireExt;
use crate::io::WireType;
use crate::io::WriteWireExt;
use crate::protocol::AudioDecodeOutput;
use crate::protocol::AudioInitOutput;
use crate::protocol::VideoDecodeOutput;
use crate::protocol::VideoEncodeOutput;
use crate::protocol::ARENA_SIZE;

const PREFIX_SIZE: usize = std::mem::size_of::<u32>();

/// Returns the number of bytes `encode_request` writes for `fields` and `payload_len` bytes of
/// payload.
pub fn request_size<T: WireType>(payload_len: usize) -> usize {
    PREFIX_SIZE + std::mem::size_of::<T>() + payload_len
}

/// Writes a request made of `fields` and `payload` at the current position of `w`.
///
/// Returns the number of bytes written, length prefix included.
pub fn encode_request<T, W>(fields: T, payload: &[u8], w: &mut W) -> io::Result<usize>
where
    T: WireType,
    W: Write + Seek,
{
    let start = w.stream_position()?;

    // Placeholder for the length, patched once everything else is written.
    w.write_obj(0u32)?;
    w.write_obj(fields)?;
    if !payload.is_empty() {
        w.write_all(payload)?;
    }

    let end = w.stream_position()?;
    let body_len = u32::try_from(end - start - PREFIX_SIZE as u64)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "request too large"))?;
    w.seek(SeekFrom::Start(start))?;
    w.write_obj(body_len)?;
    w.seek(SeekFrom::Start(end))?;

    Ok((end - start) as usize)
}

/// Reads a request written by [`encode_request`] and returns its fields and payload.
pub fn decode_request<T, R>(r: &mut R) -> io::Result<(T, Vec<u8>)>
where
    T: WireType,
    R: Read,
{
    let body_len = r.read_obj::<u32>()? as usize;
    let payload_len = body_len
        .checked_sub(std::mem::size_of::<T>())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request of {} bytes is shorter than its fields", body_len),
            )
        })?;
    if payload_len > ARENA_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request payload of {} bytes is larger than the arena", payload_len),
        ));
    }

    let fields = r.read_obj::<T>()?;
    let payload = r.read_payload(payload_len)?;

    Ok((fields, payload))
}

/// Response layout of an operation.
pub trait Reply {
    /// Fields following a non-negative result.
    type Fields: WireType + Copy;
    /// Whether a successful response may carry a payload.
    const CARRIES_PAYLOAD: bool;

    /// Length of the payload following the fields.
    fn payload_len(result: i32, fields: &Self::Fields) -> usize;
}

/// Init of a video codec: the result alone.
pub enum InitVideo {}
/// Init of an audio codec: the result and the negotiated sample format.
pub enum InitAudio {}
/// Video decode: the consumed length, the got-picture flag and the picture format.
pub enum DecodeVideo {}
/// Video encode: the encoded length, frame flags, and the encoded bytes.
pub enum EncodeVideo {}
/// Audio decode: the consumed length, the sample format, and the decoded samples.
pub enum DecodeAudio {}
/// Audio encode: the encoded length and the encoded bytes.
pub enum EncodeAudio {}

impl Reply for InitVideo {
    type Fields = ();
    const CARRIES_PAYLOAD: bool = false;

    fn payload_len(_: i32, _: &()) -> usize {
        0
    }
}

impl Reply for InitAudio {
    type Fields = AudioInitOutput;
    const CARRIES_PAYLOAD: bool = false;

    fn payload_len(_: i32, _: &AudioInitOutput) -> usize {
        0
    }
}

impl Reply for DecodeVideo {
    type Fields = VideoDecodeOutput;
    const CARRIES_PAYLOAD: bool = false;

    fn payload_len(_: i32, _: &VideoDecodeOutput) -> usize {
        0
    }
}

impl Reply for EncodeVideo {
    type Fields = VideoEncodeOutput;
    const CARRIES_PAYLOAD: bool = true;

    fn payload_len(result: i32, _: &VideoEncodeOutput) -> usize {
        result.max(0) as usize
    }
}

impl Reply for DecodeAudio {
    type Fields = AudioDecodeOutput;
    const CARRIES_PAYLOAD: bool = true;

    fn payload_len(_: i32, fields: &AudioDecodeOutput) -> usize {
        fields.have_data.max(0) as usize
    }
}

impl Reply for EncodeAudio {
    type Fields = ();
    const CARRIES_PAYLOAD: bool = true;

    fn payload_len(result: i32, _: &()) -> usize {
        result.max(0) as usize
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response<F> {
    /// The host rejected the operation with this negative result.
    Failed(i32),
    Ok {
        result: i32,
        fields: F,
        payload: Vec<u8>,
    },
}

/// Reads the response of an operation with reply layout `T`.
pub fn decode_response<T, R>(r: &mut R) -> io::Result<Response<T::Fields>>
where
    T: Reply,
    R: Read,
{
    let result = r.read_obj::<i32>()?;
    if result < 0 {
        return Ok(Response::Failed(result));
    }

    let fields = r.read_obj::<T::Fields>()?;
    let payload_len = T::payload_len(result, &fields);
    if payload_len > ARENA_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("response payload of {} bytes is larger than the arena", payload_len),
        ));
    }
    let payload = r.read_payload(payload_len)?;

    Ok(Response::Ok {
        result,
        fields,
        payload,
    })
}

/// Writes `response` into `w`, as the host does.
///
/// The payload is written as-is: it is up to the caller to make it match what
/// [`Reply::payload_len`] expects, or to leave it empty and write it somewhere else.
pub fn encode_response<T, W>(response: &Response<T::Fields>, w: &mut W) -> io::Result<usize>
where
    T: Reply,
    W: Write,
{
    match response {
        Response::Failed(result) => {
            w.write_obj(*result)?;
            Ok(PREFIX_SIZE)
        }
        Response::Ok {
            result,
            fields,
            payload,
        } => {
            w.write_obj(*result)?;
            w.write_obj(*fields)?;
            w.write_all(payload)?;
            Ok(PREFIX_SIZE + std::mem::size_of::<T::Fields>() + payload.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::protocol::AudioDecodeInput;
    use crate::protocol::AudioEncodeInput;
    use crate::protocol::InitInput;
    use crate::protocol::VideoData;
    use crate::protocol::VideoDecodeInput;
    use crate::protocol::VideoEncodeInput;

    fn request_round_trip<T>(fields: T, payload: &[u8])
    where
        T: WireType + Copy + PartialEq + std::fmt::Debug,
    {
        let mut cursor = Cursor::new(Vec::new());
        let written = encode_request(fields, payload, &mut cursor).unwrap();
        assert_eq!(written, request_size::<T>(payload.len()));

        let buf = cursor.into_inner();
        assert_eq!(buf.len(), written);
        let prefix = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(prefix, written - 4);

        let (decoded, decoded_payload) = decode_request::<T, _>(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, fields);
        assert_eq!(decoded_payload, payload);
    }

    fn response_round_trip<T>(response: Response<T::Fields>)
    where
        T: Reply,
        T::Fields: PartialEq + std::fmt::Debug,
    {
        let mut buf = Vec::new();
        encode_response::<T, _>(&response, &mut buf).unwrap();
        let decoded = decode_response::<T, _>(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn init_round_trip() {
        let fields = InitInput {
            codec_type: 0,
            video: VideoData {
                width: 640,
                height: 480,
                pix_fmt: -1,
                ..Default::default()
            },
            extradata_size: 5,
            ..Default::default()
        };
        request_round_trip(fields, &[]);
        request_round_trip(fields, b"extra");

        response_round_trip::<InitVideo>(Response::Ok {
            result: 0,
            fields: (),
            payload: vec![],
        });
        response_round_trip::<InitAudio>(Response::Ok {
            result: 0,
            fields: AudioInitOutput {
                sample_fmt: 1,
                frame_size: 1152,
                bits_per_sample_fmt: 16,
            },
            payload: vec![],
        });
        response_round_trip::<InitAudio>(Response::Failed(-1));
    }

    #[test]
    fn decode_video_round_trip() {
        let fields = VideoDecodeInput {
            inbuf_size: 3,
            idx: 2,
            in_offset: -1,
        };
        request_round_trip(fields, &[]);
        request_round_trip(fields, &[0, 0, 1]);

        response_round_trip::<DecodeVideo>(Response::Ok {
            result: 3,
            fields: VideoDecodeOutput {
                got_picture: 1,
                video: VideoData {
                    width: 16,
                    height: 16,
                    pix_fmt: 0,
                    ..Default::default()
                },
            },
            payload: vec![],
        });
    }

    #[test]
    fn encode_video_round_trip() {
        let fields = VideoEncodeInput {
            inbuf_size: 4,
            in_timestamp: 33_000_000,
        };
        request_round_trip(fields, &[]);
        request_round_trip(fields, &[9, 8, 7, 6]);

        response_round_trip::<EncodeVideo>(Response::Ok {
            result: 0,
            fields: VideoEncodeOutput::default(),
            payload: vec![],
        });
        response_round_trip::<EncodeVideo>(Response::Ok {
            result: 2,
            fields: VideoEncodeOutput {
                coded_frame: 1,
                key_frame: 1,
            },
            payload: vec![0xf6, 0xf7],
        });
    }

    #[test]
    fn audio_round_trip() {
        request_round_trip(AudioDecodeInput { inbuf_size: 0 }, &[]);
        request_round_trip(AudioDecodeInput { inbuf_size: 2 }, &[1, 2]);
        request_round_trip(
            AudioEncodeInput {
                inbuf_size: 2,
                max_size: 4096,
            },
            &[3, 4],
        );

        response_round_trip::<DecodeAudio>(Response::Ok {
            result: 2,
            fields: AudioDecodeOutput {
                have_data: 4,
                sample_rate: 44100,
                channels: 2,
                channel_layout: 3,
            },
            payload: vec![1, 1, 2, 2],
        });
        response_round_trip::<DecodeAudio>(Response::Ok {
            result: 0,
            fields: AudioDecodeOutput::default(),
            payload: vec![],
        });
        response_round_trip::<EncodeAudio>(Response::Ok {
            result: 3,
            fields: (),
            payload: vec![5, 6, 7],
        });
        response_round_trip::<EncodeAudio>(Response::Failed(-22));
    }

    #[test]
    fn negative_result_stops_decoding() {
        // Garbage after a negative result must not be interpreted.
        let mut buf = (-1i32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff; 3]);

        assert_eq!(
            decode_response::<EncodeAudio, _>(&mut Cursor::new(buf)).unwrap(),
            Response::Failed(-1)
        );
    }

    #[test]
    fn encode_request_at_an_offset() {
        let mut cursor = Cursor::new(vec![0xee; 8]);
        cursor.seek(SeekFrom::Start(8)).unwrap();
        encode_request(AudioDecodeInput { inbuf_size: 1 }, &[0x42], &mut cursor).unwrap();

        let buf = cursor.into_inner();
        assert_eq!(&buf[..8], &[0xee; 8]);
        assert_eq!(&buf[8..], &[5, 0, 0, 0, 1, 0, 0, 0, 0x42]);
    }

    #[test]
    fn truncated_messages_are_errors() {
        let mut buf = Vec::new();
        encode_request(VideoEncodeInput::default(), &[1, 2, 3], &mut Cursor::new(&mut buf))
            .unwrap();
        buf.truncate(buf.len() - 1);
        assert!(decode_request::<VideoEncodeInput, _>(&mut Cursor::new(buf)).is_err());

        // A length prefix smaller than the fields.
        let buf = vec![2, 0, 0, 0, 0, 0];
        assert!(decode_request::<AudioEncodeInput, _>(&mut Cursor::new(buf)).is_err());

        // The result claims more payload than present.
        let buf = [4i32.to_le_bytes().to_vec(), vec![0; 3]].concat();
        assert!(decode_response::<EncodeAudio, _>(&mut Cursor::new(buf)).is_err());
    }
}
