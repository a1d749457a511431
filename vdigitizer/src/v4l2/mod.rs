// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Linux V4L2 backend
//!
//! Talks to `/dev/videoN` nodes through raw ioctls and maps the driver's
//! buffers with `memmap2`. Opening performs, in order: capability check,
//! signal source selection (DV timings or TV standard), format negotiation,
//! buffer request/map/queue and event subscription.

mod device;
pub mod sys;

pub use device::V4l2Device;

use crate::config::DeviceConfig;
use crate::device::{DeviceOpener, Session};
use crate::Result;

/// Opens [`V4l2Device`] sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Opener;

impl DeviceOpener for V4l2Opener {
    type Device = V4l2Device;

    fn open(&mut self, config: &DeviceConfig) -> Result<Session<V4l2Device>> {
        V4l2Device::open(config)
    }
}
