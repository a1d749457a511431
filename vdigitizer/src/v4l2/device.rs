// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! V4L2 capture device

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};

use super::sys::{self, c_field, xioctl, zeroed};
use crate::config::{DeviceConfig, PixelFormat, VideoStandard};
use crate::device::{
    BufferView, DequeuedBuffer, DeviceEvent, NegotiatedFormat, Readiness, Session, VideoDevice,
};
use crate::multiplexer::select_fd;
use crate::{CaptureError, Result};

/// Open V4L2 capture device with its mapped buffers
///
/// Field order matters: the mappings are dropped before the descriptor is
/// closed.
pub struct V4l2Device {
    path: PathBuf,
    buffers: Vec<MmapMut>,
    file: File,
}

fn negotiation(what: &str, err: io::Error) -> CaptureError {
    CaptureError::Negotiation(format!("{what}: {err}"))
}

impl V4l2Device {
    /// Open the device and negotiate format and buffers. Every buffer is
    /// queued on return and the stream is off.
    pub fn open(config: &DeviceConfig) -> Result<Session<V4l2Device>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&config.path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => CaptureError::DeviceNotFound(config.path.clone()),
                io::ErrorKind::PermissionDenied => {
                    CaptureError::PermissionDenied(config.path.clone())
                }
                _ => CaptureError::Io(err),
            })?;
        info!("Device fd={} opened", file.as_raw_fd());

        let mut device = V4l2Device {
            path: config.path.clone(),
            buffers: Vec::new(),
            file,
        };

        device.query_capabilities()?;
        let (width, height) = device.apply_source(config)?;
        let negotiated = device.set_format(config, width, height)?;
        let views = device.init_buffers(config.n_buffers)?;
        device.subscribe_events();

        Ok(Session::new(device, negotiated, views))
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn query_capabilities(&self) -> Result<()> {
        let mut cap: sys::V4l2Capability = zeroed();
        debug!("Calling ioctl(VIDIOC_QUERYCAP) ...");
        // SAFETY: cap matches the request argument type.
        unsafe { xioctl(self.fd(), sys::VIDIOC_QUERYCAP, &mut cap) }
            .map_err(|err| negotiation("Can't query device (VIDIOC_QUERYCAP)", err))?;

        info!(
            "Using driver {}, card {} on {}",
            c_field(&cap.driver),
            c_field(&cap.card),
            c_field(&cap.bus_info)
        );

        let caps = if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        if caps & sys::V4L2_CAP_VIDEO_CAPTURE == 0 {
            return Err(CaptureError::Negotiation(
                "Video capture not supported by our device".to_string(),
            ));
        }
        if caps & sys::V4L2_CAP_STREAMING == 0 {
            return Err(CaptureError::Negotiation(
                "Device does not support streaming IO".to_string(),
            ));
        }
        Ok(())
    }

    /// Select the signal source; returns the resolution to request
    fn apply_source(&self, config: &DeviceConfig) -> Result<(u32, u32)> {
        if config.dv_timings {
            return self.apply_dv_timings(config);
        }

        if config.standard != VideoStandard::Unknown {
            let mut std_id = config.standard.std_id();
            info!("Using TV standard: {}", config.standard);
            // SAFETY: std_id matches the request argument type.
            unsafe { xioctl(self.fd(), sys::VIDIOC_S_STD, &mut std_id) }
                .map_err(|err| negotiation("Can't set video standard", err))?;
        } else {
            debug!("Using TV standard: DEFAULT");
        }
        Ok((config.width, config.height))
    }

    fn apply_dv_timings(&self, config: &DeviceConfig) -> Result<(u32, u32)> {
        let mut timings: sys::V4l2DvTimings = zeroed();
        debug!("Calling ioctl(VIDIOC_QUERY_DV_TIMINGS) ...");
        // SAFETY: timings matches the request argument type.
        if let Err(err) = unsafe { xioctl(self.fd(), sys::VIDIOC_QUERY_DV_TIMINGS, &mut timings) } {
            warn!("Failed to query DV timings: {err}");
            return Ok((config.width, config.height));
        }

        let (width, height) = (timings.width, timings.height);
        info!("Got new DV timings: resolution={width}x{height}");

        debug!("Calling ioctl(VIDIOC_S_DV_TIMINGS) ...");
        // SAFETY: timings matches the request argument type.
        unsafe { xioctl(self.fd(), sys::VIDIOC_S_DV_TIMINGS, &mut timings) }
            .map_err(|err| negotiation("Failed to set DV timings", err))?;

        if width == 0 || height == 0 {
            Ok((config.width, config.height))
        } else {
            Ok((width, height))
        }
    }

    fn set_format(&self, config: &DeviceConfig, width: u32, height: u32) -> Result<NegotiatedFormat> {
        let mut fmt: sys::V4l2Format = zeroed();
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix = sys::V4l2PixFormat {
            width,
            height,
            pixelformat: config.format.fourcc(),
            field: sys::V4L2_FIELD_ANY,
            ..zeroed()
        };

        info!(
            "Calling ioctl(VIDIOC_S_FMT) for resolution={width}x{height}, format={} ...",
            config.format
        );
        // SAFETY: fmt matches the request argument type.
        unsafe { xioctl(self.fd(), sys::VIDIOC_S_FMT, &mut fmt) }
            .map_err(|err| negotiation("Unable to set format", err))?;

        // SAFETY: the driver filled in the pix member for a capture buffer type.
        let pix = unsafe { fmt.fmt.pix };

        if pix.width != width || pix.height != height {
            warn!(
                "Requested resolution={width}x{height} is unavailable, got {}x{}",
                pix.width, pix.height
            );
        }

        let format = PixelFormat::from_fourcc(pix.pixelformat).ok_or_else(|| {
            CaptureError::Negotiation(format!(
                "Driver picked unsupported pixel format {:#010x}",
                pix.pixelformat
            ))
        })?;
        if format != config.format {
            warn!(
                "Could not obtain the requested pixel format={}; driver gave us {format}",
                config.format
            );
        }

        info!("Got format: resolution={}x{}, format={format}", pix.width, pix.height);
        Ok(NegotiatedFormat {
            width: pix.width,
            height: pix.height,
            format,
        })
    }

    fn init_buffers(&mut self, n_buffers: u32) -> Result<Vec<BufferView>> {
        let mut req: sys::V4l2RequestBuffers = zeroed();
        req.count = n_buffers;
        req.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = sys::V4L2_MEMORY_MMAP;

        debug!("Calling ioctl(VIDIOC_REQBUFS) for {n_buffers} buffers ...");
        // SAFETY: req matches the request argument type.
        unsafe { xioctl(self.fd(), sys::VIDIOC_REQBUFS, &mut req) }
            .map_err(|err| negotiation("Device does not support memory mapping", err))?;

        if req.count == 0 {
            return Err(CaptureError::Negotiation(
                "Insufficient buffer memory".to_string(),
            ));
        }
        if req.count != n_buffers {
            info!("Requested {n_buffers} buffers, got {}", req.count);
        }

        let mut views = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut buf = buffer_request(index);
            debug!("Calling ioctl(VIDIOC_QUERYBUF) for buffer index={index} ...");
            // SAFETY: buf matches the request argument type.
            unsafe { xioctl(self.fd(), sys::VIDIOC_QUERYBUF, &mut buf) }
                .map_err(|err| negotiation("Can't query buffer", err))?;

            // SAFETY: MMAP buffers report their offset in the m union.
            let offset = unsafe { buf.m.offset };
            let length = buf.length as usize;

            debug!("Mapping buffer index={index}; offset={offset}; length={length} ...");
            // SAFETY: the mapping is backed by driver memory that lives as
            // long as the descriptor, which outlives self.buffers.
            let map = unsafe {
                MmapOptions::new()
                    .offset(u64::from(offset))
                    .len(length)
                    .map_mut(&self.file)
            }
            .map_err(|err| negotiation("Can't map buffer", err))?;

            self.buffers.push(map);
            views.push(BufferView { index, length });
        }

        for view in &views {
            self.queue_buffer(view.index)
                .map_err(|err| negotiation("Can't queue buffer", err))?;
        }

        info!("Mapped and queued {} buffers", views.len());
        Ok(views)
    }

    fn subscribe_events(&self) {
        for (event, name) in [
            (sys::V4L2_EVENT_SOURCE_CHANGE, "V4L2_EVENT_SOURCE_CHANGE"),
            (sys::V4L2_EVENT_EOS, "V4L2_EVENT_EOS"),
        ] {
            let mut sub: sys::V4l2EventSubscription = zeroed();
            sub.type_ = event;
            debug!("Calling ioctl(VIDIOC_SUBSCRIBE_EVENT) for {name} ...");
            // SAFETY: sub matches the request argument type.
            if let Err(err) = unsafe { xioctl(self.fd(), sys::VIDIOC_SUBSCRIBE_EVENT, &mut sub) } {
                warn!("Can't subscribe to {name}: {err}");
            }
        }
    }

}

fn buffer_request(index: u32) -> sys::V4l2Buffer {
    let mut buf: sys::V4l2Buffer = zeroed();
    buf.index = index;
    buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
    buf.memory = sys::V4L2_MEMORY_MMAP;
    buf
}

impl VideoDevice for V4l2Device {
    fn select(&mut self, timeout: Duration) -> io::Result<Readiness> {
        select_fd(self.fd(), timeout)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = buffer_request(0);
        // SAFETY: buf matches the request argument type.
        unsafe { xioctl(self.fd(), sys::VIDIOC_DQBUF, &mut buf) }?;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = buffer_request(index);
        // SAFETY: buf matches the request argument type.
        unsafe { xioctl(self.fd(), sys::VIDIOC_QBUF, &mut buf) }
    }

    fn set_stream(&mut self, enable: bool) -> io::Result<()> {
        let mut type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        let request = if enable {
            sys::VIDIOC_STREAMON
        } else {
            sys::VIDIOC_STREAMOFF
        };
        // SAFETY: type_ matches the request argument type.
        unsafe { xioctl(self.fd(), request, &mut type_) }
    }

    fn dequeue_event(&mut self) -> io::Result<DeviceEvent> {
        let mut event: sys::V4l2Event = zeroed();
        // SAFETY: event matches the request argument type.
        unsafe { xioctl(self.fd(), sys::VIDIOC_DQEVENT, &mut event) }?;
        Ok(match event.type_ {
            sys::V4L2_EVENT_SOURCE_CHANGE => DeviceEvent::SourceChange,
            sys::V4L2_EVENT_EOS => DeviceEvent::EndOfStream,
            other => DeviceEvent::Other(other),
        })
    }

    fn buffer_data(&self, index: u32) -> &[u8] {
        match self.buffers.get(index as usize) {
            Some(map) => map,
            None => &[],
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            debug!("Unmapping {} buffers ...", self.buffers.len());
        }
        self.buffers.clear();
        info!("Closing device {} fd={} ...", self.path.display(), self.fd());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let config = DeviceConfig {
            path: PathBuf::from("/dev/vdigitizer-does-not-exist"),
            ..DeviceConfig::default()
        };
        assert!(matches!(
            V4l2Device::open(&config),
            Err(CaptureError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_open_non_v4l2_node_fails_negotiation() {
        let config = DeviceConfig {
            path: PathBuf::from("/dev/null"),
            ..DeviceConfig::default()
        };
        assert!(matches!(
            V4l2Device::open(&config),
            Err(CaptureError::Negotiation(_))
        ));
    }
}
