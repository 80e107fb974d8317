// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;

use thiserror::Error;

use crate::arena::ArenaError;
use crate::protocol::CodecOp;
use crate::protocol::DeviceCall;

/// Errors surfaced to the media pipeline.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec device is unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("no room left in the device memory")]
    AllocationExhausted,
    #[error("device call {call:?} failed with status {status}")]
    Protocol { call: DeviceCall, status: i32 },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("host codec rejected {op:?} with result {result}")]
    Rejected { op: CodecOp, result: i32 },
    #[error("invalid device memory access: {0}")]
    Arena(#[from] ArenaError),
    #[error("malformed wire record: {0}")]
    Marshal(#[from] io::Error),
    #[error("{0} bytes of fields do not fit in a metadata slot")]
    SlotOverflow(usize),
    #[error("codec context is not initialized")]
    NotInitialized,
    #[error("{0} bytes do not fit in a device call")]
    TooLarge(usize),
    #[error("context {0} has no metadata slot in the arena")]
    NoMetadataSlot(u32),
}

impl CodecError {
    /// Returns the negative errno-style status matching this error, as expected by the pipeline.
    pub fn status(&self) -> i32 {
        -match self {
            CodecError::DeviceUnavailable(_) => libc::ENODEV,
            CodecError::AllocationExhausted => libc::ENOMEM,
            CodecError::Protocol { status, .. } => match status.checked_abs() {
                Some(s) if s > 0 => s,
                _ => libc::EIO,
            },
            CodecError::UnsupportedVersion(_) => libc::EPROTONOSUPPORT,
            CodecError::Rejected { .. } => libc::EINVAL,
            CodecError::Arena(_) => libc::EFAULT,
            CodecError::Marshal(_) => libc::EPROTO,
            CodecError::SlotOverflow(_) => libc::EOVERFLOW,
            CodecError::NotInitialized => libc::EBADF,
            CodecError::TooLarge(_) => libc::EMSGSIZE,
            CodecError::NoMetadataSlot(_) => libc::ERANGE,
        }
    }

    /// Builds the error for a device call that returned errno `status`.
    pub(crate) fn protocol(call: DeviceCall, status: i32) -> Self {
        CodecError::Protocol { call, status }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_negative() {
        let errors = [
            CodecError::DeviceUnavailable("gone".into()),
            CodecError::AllocationExhausted,
            CodecError::protocol(DeviceCall::SecureBuffer, libc::EAGAIN),
            CodecError::protocol(DeviceCall::InvokeAndFetch, i32::MIN),
            CodecError::UnsupportedVersion(4),
            CodecError::Rejected {
                op: CodecOp::Init,
                result: -1,
            },
            CodecError::SlotOverflow(300),
            CodecError::NotInitialized,
            CodecError::TooLarge(usize::MAX),
            CodecError::NoMetadataSlot(u32::MAX),
        ];

        for e in errors {
            assert!(e.status() < 0, "{:?}", e);
        }
        assert_eq!(
            CodecError::protocol(DeviceCall::SecureBuffer, libc::EAGAIN).status(),
            -libc::EAGAIN
        );
    }
}
