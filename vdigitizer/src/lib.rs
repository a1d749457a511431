// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! vdigitizer capture engine
//!
//! This crate provides the capture side of a video-digitizer daemon: it
//! pulls frames from a V4L2 capture device, validates them and hands every
//! accepted frame to a compressor, surviving disconnects, source changes and
//! transient I/O errors without terminating the process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Capture Supervisor                       │
//! │  - open / stream on / spawn workers                         │
//! │  - teardown and retry after a fixed delay                   │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Mainloop                             │
//! │  - select() on the device descriptor                        │
//! │  - device events (source change, end of stream)             │
//! │  - DQBUF -> skip / size policy -> compress -> QBUF          │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Video Device                            │
//! │  - V4L2 descriptor and mmap'ed kernel buffers               │
//! │  - scripted stub for tests                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vdigitizer::{CaptureSupervisor, DeviceConfig, JpegCompressor, StopSignal};
//! use vdigitizer::v4l2::V4l2Opener;
//!
//! let config = DeviceConfig::default();
//! let stop = StopSignal::new();
//! let compressor = JpegCompressor::new(config.jpeg_quality);
//!
//! let mut supervisor = CaptureSupervisor::new(config, V4l2Opener, compressor, stop);
//! supervisor.run();
//! ```
//!
//! # Modules
//!
//! - [`supervisor`]: Retry state machine around device sessions
//! - [`mainloop`]: Per-session readiness loop and frame policy
//! - [`multiplexer`]: Readiness wait on the device descriptor
//! - [`buffers`]: Kernel buffer dequeue/requeue handshake
//! - [`stream`]: Idempotent stream on/off
//! - [`events`]: Device event interpretation
//! - [`workers`]: Per-session worker pool lifecycle
//! - [`device`]: Device traits, session runtime and stub backend
//! - [`v4l2`]: Linux V4L2 backend
//! - [`jpeg`]: JPEG compression of accepted frames
//! - [`config`]: Device configuration
//! - [`stop`]: Process-wide stop latch

use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub mod buffers;
pub mod config;
pub mod device;
pub mod events;
pub mod jpeg;
pub mod mainloop;
pub mod multiplexer;
pub mod stop;
pub mod stream;
pub mod supervisor;
pub mod workers;

#[cfg(target_os = "linux")]
pub mod v4l2;

pub use config::{DeviceConfig, PixelFormat, VideoStandard};
pub use device::{DeviceEvent, DeviceOpener, Readiness, Session, VideoDevice};
pub use jpeg::{FrameCompressor, JpegCompressor, Picture, PictureSlot};
pub use stop::StopSignal;
pub use supervisor::{CaptureStats, CaptureSupervisor};

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Capture error types.
///
/// Every variant other than [`CaptureError::Config`] and
/// [`CaptureError::ConfigFile`] ends the current device session; the
/// supervisor logs it, tears the session down and initializes a new one.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("Invalid configuration file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    /// The device node does not exist.
    #[error("V4L2 device not found: {}", .0.display())]
    DeviceNotFound(PathBuf),

    /// The device node exists but can't be opened by this user.
    #[error("Permission denied for {}, try adding user to 'video' group", .0.display())]
    PermissionDenied(PathBuf),

    /// Capabilities, format or buffer negotiation failed.
    #[error("Device negotiation failed: {0}")]
    Negotiation(String),

    /// The stream could not be started.
    #[error("Unable to start capturing: {0}")]
    StreamStart(#[source] io::Error),

    /// select() on the device failed with something other than EINTR.
    #[error("Mainloop select() error: {0}")]
    Select(#[source] io::Error),

    /// The device produced nothing within the select timeout.
    #[error("Mainloop select() timeout after {0:?}")]
    Timeout(Duration),

    /// The capture descriptor became writable.
    #[error("Got unexpected writing event, seems device was disconnected")]
    Disconnected,

    /// The signal source changed upstream of the capture hardware.
    #[error("Source changed, device reinitialization required")]
    SourceChanged,

    /// VIDIOC_DQBUF failed.
    #[error("Unable to dequeue buffer: {0}")]
    Dequeue(#[source] io::Error),

    /// The driver returned a buffer index outside the negotiated range.
    #[error("Got invalid buffer index={index}; nbuffers={n_buffers}")]
    InvalidBufferIndex { index: u32, n_buffers: u32 },

    /// VIDIOC_QBUF failed.
    #[error("Unable to requeue buffer index={index}: {source}")]
    Requeue {
        index: u32,
        #[source]
        source: io::Error,
    },

    /// The worker pool could not be allocated.
    #[error("Can't allocate workers pool for {0} workers")]
    PoolAllocation(u32),

    /// A worker thread could not be spawned.
    #[error("Can't spawn worker #{index}: {source}")]
    WorkerSpawn {
        index: u32,
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
