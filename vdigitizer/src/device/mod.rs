// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture device abstraction
//!
//! The capture core talks to the hardware only through [`VideoDevice`]:
//! readiness wait, buffer dequeue/requeue, stream on/off and event dequeue.
//! A [`DeviceOpener`] produces a [`Session`] that owns the device handle
//! together with the parameters negotiated at open time.
//!
//! Two backends exist:
//!
//! - [`crate::v4l2::V4l2Device`]: the real Linux device
//! - [`stub::StubDevice`]: scripted device used by tests

use std::io;
use std::time::Duration;

use bitflags::bitflags;

use crate::config::{DeviceConfig, PixelFormat};
use crate::Result;

pub mod stub;

bitflags! {
    /// Readiness conditions reported by a readiness wait
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Readiness: u8 {
        /// A completed buffer can be dequeued
        const READ = 1 << 0;
        /// The descriptor is writable (never expected on a capture device)
        const WRITE = 1 << 1;
        /// An out-of-band device event is pending
        const ERROR = 1 << 2;
    }
}

/// Out-of-band device event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Resolution or signal changed upstream of the capture hardware
    SourceChange,
    /// End of stream milestone
    EndOfStream,
    /// Any other event type (raw V4L2 event type)
    Other(u32),
}

/// Buffer returned by the driver on dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
}

/// Low-level operations on an open capture device
pub trait VideoDevice: Send {
    /// Wait until the descriptor is readable, writable or has an exceptional
    /// condition. An empty set means the timeout expired; an interrupted wait
    /// is reported as an error of kind [`io::ErrorKind::Interrupted`].
    fn select(&mut self, timeout: Duration) -> io::Result<Readiness>;

    /// Take the next filled buffer from the driver
    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    /// Hand a buffer back to the driver
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Start or stop the hardware stream
    fn set_stream(&mut self, enable: bool) -> io::Result<()>;

    /// Take one pending device event
    fn dequeue_event(&mut self) -> io::Result<DeviceEvent>;

    /// Mapped memory of a buffer; empty for an unknown index
    fn buffer_data(&self, index: u32) -> &[u8];
}

/// Opens device sessions
pub trait DeviceOpener {
    type Device: VideoDevice;

    /// Open the device and negotiate format and buffers.
    ///
    /// On success every buffer is queued to the driver and the stream is
    /// still off.
    fn open(&mut self, config: &DeviceConfig) -> Result<Session<Self::Device>>;
}

/// Format agreed on with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// View of one mapped kernel buffer. The mapping itself belongs to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    pub index: u32,
    pub length: usize,
}

/// Read-only session parameters shared with worker threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub n_buffers: u32,
}

/// One accepted frame, borrowed from a buffer the application owns
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: &'a [u8],
}

/// Device session runtime
///
/// Lives from a successful open until close or fault. Dropping the session
/// closes the device.
pub struct Session<D> {
    device: D,
    negotiated: NegotiatedFormat,
    buffers: Vec<BufferView>,
    capturing: bool,
}

impl<D: VideoDevice> Session<D> {
    pub fn new(device: D, negotiated: NegotiatedFormat, buffers: Vec<BufferView>) -> Self {
        Self {
            device,
            negotiated,
            buffers,
            capturing: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn negotiated(&self) -> NegotiatedFormat {
        self.negotiated
    }

    pub fn buffers(&self) -> &[BufferView] {
        &self.buffers
    }

    /// Number of negotiated kernel buffers
    pub fn n_buffers(&self) -> u32 {
        u32::try_from(self.buffers.len()).unwrap_or(u32::MAX)
    }

    /// Recorded hardware stream state
    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub(crate) fn set_capturing(&mut self, capturing: bool) {
        self.capturing = capturing;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            width: self.negotiated.width,
            height: self.negotiated.height,
            format: self.negotiated.format,
            n_buffers: self.n_buffers(),
        }
    }

    /// Frame view of an acquired buffer, truncated to the bytes the driver filled
    pub fn frame(&self, index: u32, bytes_used: u32) -> Frame<'_> {
        let data = self.device.buffer_data(index);
        let used = usize::try_from(bytes_used).map_or(data.len(), |n| n.min(data.len()));
        Frame {
            index,
            width: self.negotiated.width,
            height: self.negotiated.height,
            format: self.negotiated.format,
            data: &data[..used],
        }
    }

    /// Close the device
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::stub::{StubPlan, StubRecord, StubStep};
    use super::*;
    use std::sync::{Arc, Mutex};

    fn session(n_buffers: u32) -> Session<stub::StubDevice> {
        let record = Arc::new(Mutex::new(StubRecord::default()));
        let plan = StubPlan::session(n_buffers, vec![StubStep::Frame(100)]);
        stub::StubDevice::open_session(&plan, &DeviceConfig::default(), record, None)
    }

    #[test]
    fn test_session_starts_not_capturing() {
        let session = session(3);
        assert!(!session.is_capturing());
        assert_eq!(session.n_buffers(), 3);
        assert_eq!(session.buffers()[2].index, 2);
    }

    #[test]
    fn test_session_info_matches_negotiated_format() {
        let session = session(4);
        let info = session.info();
        assert_eq!(info.n_buffers, 4);
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 480);
        assert_eq!(info.format, PixelFormat::Yuyv);
        assert_eq!(
            session.negotiated(),
            NegotiatedFormat {
                width: 640,
                height: 480,
                format: PixelFormat::Yuyv,
            }
        );
    }

    #[test]
    fn test_session_owns_its_device() {
        let mut session = session(2);
        assert_eq!(session.device().remaining_steps(), 1);

        session.device_mut().select(Duration::ZERO).unwrap();
        assert_eq!(session.device().remaining_steps(), 0);
    }

    #[test]
    fn test_frame_is_truncated_to_bytes_used() {
        let session = session(2);
        let frame = session.frame(1, 100);
        assert_eq!(frame.index, 1);
        assert_eq!(frame.data.len(), 100);

        // Bigger than the mapping: clamp to the buffer length
        let frame = session.frame(1, u32::MAX);
        assert_eq!(frame.data.len(), session.buffers()[1].length);

        // Unknown index: nothing mapped
        assert!(session.frame(7, 100).data.is_empty());
    }

    #[test]
    fn test_readiness_flags() {
        let ready = Readiness::READ | Readiness::WRITE;
        assert!(ready.contains(Readiness::READ));
        assert!(!ready.contains(Readiness::ERROR));
        assert!(Readiness::default().is_empty());
    }
}
