// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The codec device node of the guest kernel.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::IntoRawFd;
use std::path::Path;

use crate::arena::Arena;
use crate::arena::ArenaError;
use crate::arena::ArenaOffset;
use crate::io::WriteWireExt;
use crate::protocol::CommandRecord;
use crate::protocol::DeviceCall;
use crate::protocol::IoctlData;
use crate::protocol::CODEC_IOCTL_MAGIC;
use crate::CodecDevice;
use crate::Command;
use crate::FetchResult;
use crate::PutData;

fn last_errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Request code of device call `call`.
fn request_code(call: DeviceCall) -> nix::sys::ioctl::ioctl_num_type {
    nix::request_code_readwrite!(
        CODEC_IOCTL_MAGIC,
        call as u32,
        std::mem::size_of::<IoctlData>()
    )
}

/// The codec device, opened read-write.
#[derive(Debug)]
pub struct CharDevice {
    file: File,
}

impl CharDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self { file })
    }

    /// Issues `call` with `arg` as argument, returning the non-negative result of the call.
    ///
    /// # Safety
    ///
    /// `arg` must point to memory valid for reads and writes of the size the device expects for
    /// `call`.
    unsafe fn ioctl_raw(&self, call: DeviceCall, arg: *mut libc::c_void) -> Result<i32, i32> {
        // The request argument type differs between libc flavors.
        let ret = libc::ioctl(self.file.as_raw_fd(), request_code(call) as _, arg);
        if ret < 0 {
            let errno = last_errno();
            log::debug!("device call {:?} failed: {}", call, errno);
            Err(errno)
        } else {
            Ok(ret)
        }
    }

    fn ioctl(&self, call: DeviceCall, data: &mut IoctlData) -> Result<i32, i32> {
        // SAFETY: `data` is a valid `IoctlData`, which is what every call but `GetElements`
        // expects.
        unsafe { self.ioctl_raw(call, data as *mut IoctlData as *mut libc::c_void) }
    }

    /// Issues a query whose answer comes back in the first word of the argument.
    fn query(&self, call: DeviceCall) -> Result<u32, i32> {
        let mut data = IoctlData::default();
        self.ioctl(call, &mut data)?;

        Ok(data.first_word())
    }
}

impl CodecDevice for CharDevice {
    fn map_arena(&self, len: usize) -> Result<Arena, i32> {
        Arena::map(&self.file, len).map_err(|e| match e {
            ArenaError::Map(errno) => errno as i32,
            _ => libc::EINVAL,
        })
    }

    fn version(&self) -> Result<u32, i32> {
        self.query(DeviceCall::GetVersion)
    }

    fn elements_size(&self) -> Result<u32, i32> {
        self.query(DeviceCall::GetElementsSize)
    }

    fn elements(&self, buf: &mut [u8]) -> Result<(), i32> {
        let size = self.elements_size()?;
        if buf.len() < size as usize {
            return Err(libc::EINVAL);
        }

        // SAFETY: `buf` can hold the whole element list.
        unsafe { self.ioctl_raw(DeviceCall::GetElements, buf.as_mut_ptr().cast()) }.map(|_| ())
    }

    fn context_index(&self) -> Result<u32, i32> {
        self.query(DeviceCall::GetContextIndex)
    }

    fn secure_buffer(&self, ctx: u32, size: u32) -> Result<ArenaOffset, i32> {
        let mut data = IoctlData {
            ctx_index: ctx,
            buffer_size: size as i32,
            ..Default::default()
        };
        self.ioctl(DeviceCall::SecureBuffer, &mut data)?;

        Ok(ArenaOffset::new(data.mem_offset))
    }

    fn try_secure_buffer(&self, size: u32) -> Result<Option<ArenaOffset>, i32> {
        let mut data = IoctlData {
            buffer_size: size as i32,
            ..Default::default()
        };
        match self.ioctl(DeviceCall::TrySecureBuffer, &mut data) {
            Ok(_) => Ok(Some(ArenaOffset::new(data.mem_offset))),
            Err(libc::ENOMEM) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn release_buffer(&self, offset: ArenaOffset) -> Result<(), i32> {
        let mut data = IoctlData::scalar(offset.get());
        self.ioctl(DeviceCall::ReleaseBuffer, &mut data).map(|_| ())
    }

    fn write_command(&self, cmd: &Command) -> Result<(), i32> {
        let record = CommandRecord {
            api_index: cmd.op as i32,
            ctx_index: cmd.ctx_index as i32,
            mem_offset: cmd.mem_offset(),
        };
        // `&File` implements `Write`, the device serializes concurrent writers.
        let mut file = &self.file;
        file.write_obj(record)
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn invoke_and_release(&self, cmd: &Command) -> Result<i32, i32> {
        let mut data = cmd.ioctl_data(0);
        self.ioctl(DeviceCall::InvokeAndRelease, &mut data)
    }

    fn invoke_and_fetch(&self, cmd: &Command, buffer_size: i32) -> Result<FetchResult, i32> {
        let mut data = cmd.ioctl_data(buffer_size);
        let status = self.ioctl(DeviceCall::InvokeAndFetch, &mut data)?;

        let offset = match data.mem_offset {
            u32::MAX => None,
            offset => Some(ArenaOffset::new(offset)),
        };

        Ok(FetchResult { status, offset })
    }

    fn put_data_into_buffer(&self, ctx: u32, size: u32) -> Result<PutData, i32> {
        let mut data = IoctlData {
            ctx_index: ctx,
            buffer_size: size as i32,
            ..Default::default()
        };
        let status = self.ioctl(DeviceCall::PutDataIntoBuffer, &mut data)?;

        Ok(PutData {
            offset: ArenaOffset::new(data.mem_offset),
            is_last: status == 1,
        })
    }

    fn close(self) -> Result<(), i32> {
        let fd = self.file.into_raw_fd();
        nix::unistd::close(fd).map_err(|e| e as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_encode_the_call() {
        let size = std::mem::size_of::<IoctlData>() as u64;
        assert_eq!(size, 16);

        for (call, nr) in [
            (DeviceCall::GetVersion, 0u64),
            (DeviceCall::SecureBuffer, 4),
            (DeviceCall::InvokeAndRelease, 9),
        ] {
            let code = request_code(call) as u64;
            assert_eq!(code & 0xff, nr);
            assert_eq!((code >> 8) & 0xff, b'B' as u64);
            assert_eq!((code >> 16) & 0x3fff, size);
        }
    }

    #[test]
    fn missing_device_is_an_error() {
        assert!(CharDevice::open("/nonexistent/brillcodec").is_err());
    }

    #[test]
    fn write_command_on_a_regular_file() {
        let path = std::env::temp_dir().join(format!("pv-codec-cmd-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let device = CharDevice::open(&path).unwrap();
        device
            .write_command(&Command::new(
                crate::protocol::CodecOp::Deinit,
                2,
                Some(ArenaOffset::new(0x100)),
            ))
            .unwrap();
        device.close().unwrap();

        assert_eq!(
            std::fs::read(&path).unwrap(),
            [6, 0, 0, 0, 2, 0, 0, 0, 0, 1, 0, 0]
        );
        std::fs::remove_file(&path).unwrap();
    }
}
