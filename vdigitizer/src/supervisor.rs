// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture supervisor
//!
//! Owns the device session lifecycle. A session is initialized as
//! open, stream on, spawn workers; any failure closes what was opened so far
//! and the next attempt starts after `error_delay`. Once running, the
//! mainloop drives the session until it fails, which tears it down as
//! workers, stream off, close, and goes straight back to initialization.
//! Only the stop signal ends [`CaptureSupervisor::run`].

use log::{error, info};

use crate::config::DeviceConfig;
use crate::device::{DeviceOpener, Session, VideoDevice};
use crate::jpeg::FrameCompressor;
use crate::mainloop;
use crate::stop::StopSignal;
use crate::stream::{set_streaming, stop_streaming};
use crate::workers::WorkerPool;
use crate::Result;

/// Counters kept across sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Sessions that reached the running state
    pub sessions_started: u64,
    /// Initialization attempts and running sessions that failed
    pub session_failures: u64,
    /// Buffers dequeued
    pub frames_captured: u64,
    /// Frames handed to the compressor
    pub frames_forwarded: u64,
    /// Frames dropped by the every-frame cadence
    pub frames_skipped: u64,
    /// Frames dropped for being smaller than the minimum size
    pub frames_too_small: u64,
    /// Exceptional conditions reported by the device
    pub events: u64,
    /// Worker threads spawned, summed over all sessions
    pub workers_spawned: u64,
}

/// A running session and the workers spawned for it
struct ActiveSession<D: VideoDevice> {
    session: Session<D>,
    pool: WorkerPool,
}

/// Capture supervisor
pub struct CaptureSupervisor<O: DeviceOpener, C: FrameCompressor> {
    config: DeviceConfig,
    opener: O,
    compressor: C,
    stop: StopSignal,
    stats: CaptureStats,
}

impl<O: DeviceOpener, C: FrameCompressor> CaptureSupervisor<O, C> {
    pub fn new(config: DeviceConfig, opener: O, compressor: C, stop: StopSignal) -> Self {
        Self {
            config,
            opener,
            compressor,
            stop,
            stats: CaptureStats::default(),
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn compressor(&self) -> &C {
        &self.compressor
    }

    /// Capture until the stop signal is set.
    ///
    /// Device faults never end this call. When it returns, no session is
    /// open and no worker is running.
    pub fn run(&mut self) {
        info!("Using V4L2 device: {}", self.config.path.display());
        info!("Using JPEG quality: {}%", self.config.jpeg_quality);

        while let Some(mut active) = self.init_loop() {
            let result = mainloop::run(
                &mut active.session,
                &self.config,
                &mut self.compressor,
                &self.stop,
                &mut self.stats,
            );
            Self::teardown(active);

            if let Err(err) = result {
                error!("{err}");
                self.stats.session_failures += 1;
            }
        }

        info!("Capture stopped");
    }

    /// Retry initialization until it succeeds or stop is set
    fn init_loop(&mut self) -> Option<ActiveSession<O::Device>> {
        while !self.stop.is_set() {
            match self.init_session() {
                Ok(active) => {
                    self.stats.sessions_started += 1;
                    self.stats.workers_spawned += active.pool.len() as u64;
                    return Some(active);
                }
                Err(err) => {
                    error!("{err}");
                    self.stats.session_failures += 1;
                    info!(
                        "Sleeping {} seconds before new capture init ...",
                        self.config.error_delay
                    );
                    if self.stop.wait_timeout(self.config.retry_delay()) {
                        break;
                    }
                }
            }
        }
        None
    }

    fn init_session(&mut self) -> Result<ActiveSession<O::Device>> {
        info!("Initializing capture device {} ...", self.config.path.display());

        let mut session = self.opener.open(&self.config)?;

        if let Err(err) = set_streaming(&mut session, true) {
            Self::close_session(session);
            return Err(err);
        }

        match WorkerPool::spawn(session.info(), &self.stop) {
            Ok(pool) => Ok(ActiveSession { session, pool }),
            Err(err) => {
                Self::close_session(session);
                Err(err)
            }
        }
    }

    fn teardown(mut active: ActiveSession<O::Device>) {
        active.pool.teardown();
        Self::close_session(active.session);
    }

    fn close_session(mut session: Session<O::Device>) {
        stop_streaming(&mut session);
        session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stub::{StubOpener, StubPlan, StubStep};
    use crate::device::{DeviceEvent, Frame};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingCompressor {
        frames: usize,
    }

    impl FrameCompressor for CountingCompressor {
        fn compress(&mut self, _frame: &Frame<'_>) {
            self.frames += 1;
        }
    }

    fn config() -> DeviceConfig {
        DeviceConfig {
            error_delay: 0,
            ..DeviceConfig::default()
        }
    }

    fn supervisor(plans: Vec<StubPlan>) -> CaptureSupervisor<StubOpener, CountingCompressor> {
        let stop = StopSignal::new();
        let opener = StubOpener::new(plans).with_stop(stop.clone());
        CaptureSupervisor::new(config(), opener, CountingCompressor::default(), stop)
    }

    #[test]
    fn test_source_change_reopens_device() {
        let mut supervisor = supervisor(vec![
            StubPlan::session(
                2,
                vec![
                    StubStep::Frame(4096),
                    StubStep::Event(DeviceEvent::SourceChange),
                ],
            ),
            StubPlan::session(3, vec![StubStep::Frame(4096), StubStep::Stop]),
        ]);
        supervisor.run();

        let record = supervisor.opener().snapshot();
        assert_eq!(record.opens, 2);
        assert_eq!(record.closes, 2);
        assert_eq!(record.stream_on, 2);
        assert_eq!(record.stream_off, 2);
        assert_eq!(supervisor.compressor().frames, 2);

        let stats = supervisor.stats();
        assert_eq!(stats.sessions_started, 2);
        assert_eq!(stats.session_failures, 1);
        assert_eq!(stats.frames_forwarded, 2);
        // A fresh pool per session, sized to its own buffer count
        assert_eq!(stats.workers_spawned, 2 + 3);
    }

    #[test]
    fn test_open_failures_are_retried() {
        let mut supervisor = supervisor(vec![
            StubPlan::open_failure(),
            StubPlan::open_failure(),
            StubPlan::session(2, vec![StubStep::Stop]),
        ]);
        supervisor.run();

        let record = supervisor.opener().snapshot();
        assert_eq!(record.open_attempts, 3);
        assert_eq!(record.opens, 1);
        assert_eq!(record.closes, 1);
        assert_eq!(supervisor.stats().session_failures, 2);
    }

    #[test]
    fn test_stream_start_failure_closes_session() {
        let mut supervisor = supervisor(vec![
            StubPlan::session(2, Vec::new()).with_stream_on_failure(),
            StubPlan::session(2, vec![StubStep::Stop]),
        ]);
        supervisor.run();

        let record = supervisor.opener().snapshot();
        assert_eq!(record.opens, 2);
        assert_eq!(record.closes, 2);
        // The failed start never marked the stream as running
        assert_eq!(record.stream_off, 1);
        assert_eq!(supervisor.stats().sessions_started, 1);
    }

    #[test]
    fn test_stop_set_before_run() {
        let mut supervisor = supervisor(vec![StubPlan::session(2, Vec::new())]);
        supervisor.stop.set();
        supervisor.run();

        assert_eq!(supervisor.opener().snapshot().open_attempts, 0);
    }

    #[test]
    fn test_stop_interrupts_retry_delay() {
        let stop = StopSignal::new();
        let opener = StubOpener::new(vec![StubPlan::open_failure()]);
        let config = DeviceConfig {
            error_delay: 3600,
            ..DeviceConfig::default()
        };
        let mut supervisor =
            CaptureSupervisor::new(config, opener, CountingCompressor::default(), stop.clone());

        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.set();
        });

        let start = Instant::now();
        supervisor.run();
        assert!(start.elapsed() < Duration::from_secs(60));
        setter.join().unwrap();

        assert_eq!(supervisor.opener().snapshot().open_attempts, 1);
    }
}
