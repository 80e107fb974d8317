// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Traits for reading records from and writing records to shared memory.
//!
//! The host expects all records in little-endian order, but there is no guarantee that the guest
//! uses the same endianness. The [`WireType`] trait needs to be implemented for all types
//! transiting through the arena in order to ensure they are converted from/to the correct
//! representation if needed.
//!
//! Records can be read and written from any type implementing [`std::io::Read`] or
//! [`std::io::Write`] respectively, which includes the arena cursors of [`crate::arena`]. The
//! [`ReadWireExt`] and [`WriteWireExt`] sealed extension traits wrap records into [`LeWrapper`] so
//! transiting data is always little-endian.

use std::io::Result as IoResult;

use zerocopy::AsBytes;
use zerocopy::FromZeroes;

#[cfg(target_endian = "big")]
std::compile_error!("Big-endian guests are not supported yet");

mod le;
pub use le::*;

/// Seals for [`ReadWireExt`] and [`WriteWireExt`] so no new implementations can be created outside
/// of this crate.
mod private {
    pub trait RSealed {}
    impl<R> RSealed for R where R: std::io::Read {}

    pub trait WSealed {}
    impl<W> WSealed for W where W: std::io::Write {}
}

/// Extension trait for reading records, converting them from little-endian to the native
/// endianness of the system.
pub trait ReadWireExt: private::RSealed {
    fn read_obj<T: WireType>(&mut self) -> IoResult<T>;

    /// Read exactly `len` raw bytes.
    fn read_payload(&mut self, len: usize) -> IoResult<Vec<u8>>;
}

impl<R> ReadWireExt for R
where
    R: std::io::Read,
{
    fn read_obj<T: WireType>(&mut self) -> IoResult<T> {
        let mut obj = T::new_zeroed();
        self.read_exact(obj.as_bytes_mut())?;

        Ok(LeWrapper(obj).into_native())
    }

    fn read_payload(&mut self, len: usize) -> IoResult<Vec<u8>> {
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload)?;

        Ok(payload)
    }
}

/// Extension trait for writing records after converting them to little-endian representation.
pub trait WriteWireExt: private::WSealed {
    fn write_obj<T: WireType>(&mut self, obj: T) -> IoResult<()>;
}

impl<W> WriteWireExt for W
where
    W: std::io::Write,
{
    fn write_obj<T: WireType>(&mut self, obj: T) -> IoResult<()> {
        self.write_all(obj.to_le().as_bytes())
    }
}

/// Private wrapper for all types that transit through shared memory. Wrapped objects are
/// guaranteed to use little-endian representation.
///
/// [`Self::into_native`] can be used to retrieve the object in its native ordering.
#[repr(transparent)]
pub struct LeWrapper<T: WireType>(T);

impl<T: WireType> LeWrapper<T> {
    /// Convert the wrapped object back to native ordering and return it.
    pub fn into_native(self) -> T {
        T::from_le(self)
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}
