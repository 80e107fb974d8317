// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implementations of [`crate::CodecDevice`].
//!
//! [chardev] talks to the codec device node exposed by the guest kernel. This is what a pipeline
//! running in a real guest uses.
//!
//! [loopback] implements the host side of the device in-process, on top of a `memfd`. It runs a
//! trivial deterministic codec engine and records every call it receives, which makes it a way to
//! exercise the whole transport without any virtualization.

pub mod chardev;
pub use chardev::CharDevice;

#[cfg(feature = "loopback")]
pub mod loopback;
#[cfg(feature = "loopback")]
pub use loopback::LoopbackHost;
