// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-session capture mainloop
//!
//! Each iteration waits for the device, handles pending events, rejects a
//! writable descriptor, and processes at most one frame:
//!
//! ```text
//! select() ──► ERROR ──► dequeue event ──► source change? ──► reinit
//!    │
//!    ├──────► WRITE ──► disconnected ──► reinit
//!    │
//!    └──────► READ ──► DQBUF ──► every-frame ──► min size ──► compress ──► QBUF
//! ```
//!
//! Every acquired buffer is released on every path that gets as far as the
//! policy decision, whether the frame was forwarded or dropped.

use log::{debug, error};

use crate::buffers::{acquire_buffer, release_buffer};
use crate::config::DeviceConfig;
use crate::device::{Readiness, Session, VideoDevice};
use crate::events::{handle_event, EventVerdict};
use crate::jpeg::FrameCompressor;
use crate::multiplexer::{wait_readiness, Wait};
use crate::stop::StopSignal;
use crate::supervisor::CaptureStats;
use crate::{CaptureError, Result};

/// Fate of one dequeued frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Dropped by the every-frame cadence
    Skip,
    /// Smaller than the minimum frame size, assumed broken
    TooSmall,
    /// Handed to the compressor
    Forward,
}

/// Frame-skip and minimum-size policy
///
/// The skip counter lives as long as the filter, so a new filter is created
/// for every session.
#[derive(Debug, Clone)]
pub struct FrameFilter {
    every_frame: u32,
    min_frame_size: u32,
    counter: u32,
}

impl FrameFilter {
    pub fn new(every_frame: u32, min_frame_size: u32) -> Self {
        Self {
            every_frame,
            min_frame_size,
            counter: 0,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.every_frame, config.min_frame_size)
    }

    /// Decide what happens to a frame of `bytes_used` bytes
    pub fn classify(&mut self, bytes_used: u32) -> FrameDecision {
        if self.every_frame > 0 {
            if self.counter < self.every_frame - 1 {
                self.counter += 1;
                debug!(
                    "Dropping frame {} for option --every-frame={}",
                    self.counter, self.every_frame
                );
                return FrameDecision::Skip;
            }
            self.counter = 0;
        }

        // Low light makes some sensors emit corrupted frames that are much
        // smaller than regular ones.
        if bytes_used < self.min_frame_size {
            debug!("Dropping too small frame sized {bytes_used} bytes, assuming it as broken");
            return FrameDecision::TooSmall;
        }

        FrameDecision::Forward
    }
}

/// Run the capture loop for one session.
///
/// Returns `Ok(())` once `stop` is set, or the error that ended the session.
pub fn run<D, C>(
    session: &mut Session<D>,
    config: &DeviceConfig,
    compressor: &mut C,
    stop: &StopSignal,
    stats: &mut CaptureStats,
) -> Result<()>
where
    D: VideoDevice,
    C: FrameCompressor + ?Sized,
{
    let timeout = config.select_timeout();
    let mut filter = FrameFilter::from_config(config);

    while !stop.is_set() {
        let ready = match wait_readiness(session, timeout)? {
            Wait::Ready(ready) => ready,
            Wait::Interrupted => {
                debug!("Mainloop select() interrupted");
                continue;
            }
            Wait::Timeout if stop.is_set() => break,
            Wait::Timeout => return Err(CaptureError::Timeout(timeout)),
        };

        if ready.contains(Readiness::ERROR) {
            stats.events += 1;
            if handle_event(session) == EventVerdict::ReinitRequired {
                return Err(CaptureError::SourceChanged);
            }
        }

        if ready.contains(Readiness::WRITE) {
            return Err(CaptureError::Disconnected);
        }

        if ready.contains(Readiness::READ) {
            debug!("Frame ready ...");
            process_frame(session, compressor, &mut filter, stats)?;
        }
    }

    Ok(())
}

fn process_frame<D, C>(
    session: &mut Session<D>,
    compressor: &mut C,
    filter: &mut FrameFilter,
    stats: &mut CaptureStats,
) -> Result<()>
where
    D: VideoDevice,
    C: FrameCompressor + ?Sized,
{
    let handle = acquire_buffer(session)?;
    stats.frames_captured += 1;

    match filter.classify(handle.bytes_used()) {
        FrameDecision::Skip => stats.frames_skipped += 1,
        FrameDecision::TooSmall => stats.frames_too_small += 1,
        FrameDecision::Forward => {
            debug!("Grabbed a new frame");
            compressor.compress(&session.frame(handle.index(), handle.bytes_used()));
            stats.frames_forwarded += 1;
        }
    }

    if let Err(err) = release_buffer(session, handle) {
        error!("Frame processing ended the session: {err}");
        return Err(err);
    }
    Ok(())
}
