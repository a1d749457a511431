// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Scripted stub device
//!
//! Replays a fixed sequence of readiness outcomes and records every call the
//! capture core makes (opens, closes, stream on/off, buffer acquire/release),
//! so the supervisor and mainloop can be driven without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    BufferView, DequeuedBuffer, DeviceEvent, DeviceOpener, NegotiatedFormat, Readiness, Session,
    VideoDevice,
};
use crate::config::DeviceConfig;
use crate::stop::StopSignal;
use crate::{CaptureError, Result};

/// Buffer size used for compressed formats
pub const STUB_COMPRESSED_BUFFER_SIZE: usize = 256 * 1024;

/// One readiness wait outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubStep {
    /// Read-ready, the dequeued buffer reports this many bytes
    Frame(u32),
    /// Read- and write-ready at once
    ReadWrite(u32),
    /// Write-ready only
    WriteReady,
    /// Exceptional condition with a pending event
    Event(DeviceEvent),
    /// Event and frame in the same wakeup
    EventAndFrame(DeviceEvent, u32),
    /// Exceptional condition but the event can't be dequeued
    LostEvent,
    /// Nothing ready before the timeout
    Timeout,
    /// Wait interrupted by a signal
    Interrupted,
    /// Wait failed
    SelectError,
    /// Read-ready but the driver hands out an out-of-range index
    InvalidIndex,
    /// Read-ready but dequeue fails
    DequeueFailure,
    /// Frame whose requeue fails
    RequeueFailure(u32),
    /// Assert the stop signal, reported as an interrupted wait
    Stop,
}

/// Calls observed by the stub
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubRecord {
    pub open_attempts: usize,
    pub opens: usize,
    pub closes: usize,
    pub stream_on: usize,
    pub stream_off: usize,
    pub selects: usize,
    pub events: usize,
    pub acquired: Vec<u32>,
    pub released: Vec<u32>,
}

/// What the next open produces
#[derive(Debug, Clone)]
pub struct StubPlan {
    n_buffers: u32,
    script: Vec<StubStep>,
    fail_open: bool,
    fail_stream_on: bool,
    fail_stream_off: bool,
    blocking: bool,
}

impl StubPlan {
    /// Session with `n_buffers` buffers replaying `script`.
    ///
    /// Once the script is exhausted every wait times out.
    pub fn session(n_buffers: u32, script: Vec<StubStep>) -> Self {
        Self {
            n_buffers,
            script,
            fail_open: false,
            fail_stream_on: false,
            fail_stream_off: false,
            blocking: false,
        }
    }

    /// Open attempt that fails
    pub fn open_failure() -> Self {
        Self {
            fail_open: true,
            ..Self::session(0, Vec::new())
        }
    }

    pub fn with_stream_on_failure(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    pub fn with_stream_off_failure(mut self) -> Self {
        self.fail_stream_off = true;
        self
    }

    /// Once the script is exhausted, every wait blocks for its full timeout
    /// like an idle device would
    pub fn with_blocking_waits(mut self) -> Self {
        self.blocking = true;
        self
    }
}

fn lock(record: &Mutex<StubRecord>) -> MutexGuard<'_, StubRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted capture device
pub struct StubDevice {
    script: VecDeque<StubStep>,
    pending: Option<StubStep>,
    driver_owned: VecDeque<u32>,
    n_buffers: u32,
    buffers: Vec<Vec<u8>>,
    fail_next_queue: bool,
    fail_stream_on: bool,
    fail_stream_off: bool,
    blocking: bool,
    record: Arc<Mutex<StubRecord>>,
    stop: Option<StopSignal>,
}

impl StubDevice {
    /// Build a session the way a real open would: buffers mapped and queued,
    /// stream off.
    pub fn open_session(
        plan: &StubPlan,
        config: &DeviceConfig,
        record: Arc<Mutex<StubRecord>>,
        stop: Option<StopSignal>,
    ) -> Session<StubDevice> {
        lock(&record).opens += 1;

        let buffer_size = config.format.bytes_per_pixel().map_or(
            STUB_COMPRESSED_BUFFER_SIZE,
            |bpp| config.width as usize * config.height as usize * bpp,
        );

        let device = StubDevice {
            script: plan.script.iter().copied().collect(),
            pending: None,
            driver_owned: (0..plan.n_buffers).collect(),
            n_buffers: plan.n_buffers,
            buffers: (0..plan.n_buffers).map(|_| vec![0x80; buffer_size]).collect(),
            fail_next_queue: false,
            fail_stream_on: plan.fail_stream_on,
            fail_stream_off: plan.fail_stream_off,
            blocking: plan.blocking,
            record,
            stop,
        };

        let negotiated = NegotiatedFormat {
            width: config.width,
            height: config.height,
            format: config.format,
        };
        let views = (0..plan.n_buffers)
            .map(|index| BufferView {
                index,
                length: buffer_size,
            })
            .collect();

        Session::new(device, negotiated, views)
    }

    /// Steps not consumed yet
    pub fn remaining_steps(&self) -> usize {
        self.script.len()
    }

    fn take_buffer(&mut self, bytes_used: u32) -> io::Result<DequeuedBuffer> {
        let index = self
            .driver_owned
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        lock(&self.record).acquired.push(index);
        Ok(DequeuedBuffer { index, bytes_used })
    }
}

impl VideoDevice for StubDevice {
    fn select(&mut self, timeout: Duration) -> io::Result<Readiness> {
        lock(&self.record).selects += 1;

        let Some(step) = self.script.pop_front() else {
            if self.blocking {
                thread::sleep(timeout);
            }
            return Ok(Readiness::empty());
        };

        let ready = match step {
            StubStep::Frame(_)
            | StubStep::InvalidIndex
            | StubStep::DequeueFailure
            | StubStep::RequeueFailure(_) => Readiness::READ,
            StubStep::ReadWrite(_) => Readiness::READ | Readiness::WRITE,
            StubStep::WriteReady => Readiness::WRITE,
            StubStep::Event(_) | StubStep::LostEvent => Readiness::ERROR,
            StubStep::EventAndFrame(..) => Readiness::ERROR | Readiness::READ,
            StubStep::Timeout => Readiness::empty(),
            StubStep::Interrupted => return Err(io::Error::from(io::ErrorKind::Interrupted)),
            StubStep::SelectError => return Err(io::Error::other("stub select failure")),
            StubStep::Stop => {
                if let Some(stop) = &self.stop {
                    stop.set();
                }
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
        };

        self.pending = Some(step);
        Ok(ready)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        match self.pending.take() {
            Some(StubStep::Frame(bytes_used) | StubStep::ReadWrite(bytes_used)) => {
                self.take_buffer(bytes_used)
            }
            Some(StubStep::RequeueFailure(bytes_used)) => {
                self.fail_next_queue = true;
                self.take_buffer(bytes_used)
            }
            Some(StubStep::InvalidIndex) => Ok(DequeuedBuffer {
                index: self.n_buffers + 1,
                bytes_used: 0,
            }),
            Some(StubStep::DequeueFailure) => Err(io::Error::other("stub dequeue failure")),
            _ => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        if self.fail_next_queue {
            self.fail_next_queue = false;
            return Err(io::Error::other("stub requeue failure"));
        }
        if index >= self.n_buffers || self.driver_owned.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer {index} is not owned by the application"),
            ));
        }
        self.driver_owned.push_back(index);
        lock(&self.record).released.push(index);
        Ok(())
    }

    fn set_stream(&mut self, enable: bool) -> io::Result<()> {
        let mut record = lock(&self.record);
        if enable {
            record.stream_on += 1;
            if self.fail_stream_on {
                return Err(io::Error::other("stub stream on failure"));
            }
        } else {
            record.stream_off += 1;
            if self.fail_stream_off {
                return Err(io::Error::other("stub stream off failure"));
            }
        }
        Ok(())
    }

    fn dequeue_event(&mut self) -> io::Result<DeviceEvent> {
        match self.pending.take() {
            Some(StubStep::Event(event)) => {
                lock(&self.record).events += 1;
                Ok(event)
            }
            Some(StubStep::EventAndFrame(event, bytes_used)) => {
                self.pending = Some(StubStep::Frame(bytes_used));
                lock(&self.record).events += 1;
                Ok(event)
            }
            Some(StubStep::LostEvent) => Err(io::Error::other("no event pending")),
            other => {
                self.pending = other;
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
        }
    }

    fn buffer_data(&self, index: u32) -> &[u8] {
        match self.buffers.get(index as usize) {
            Some(buffer) => buffer,
            None => &[],
        }
    }
}

impl Drop for StubDevice {
    fn drop(&mut self) {
        lock(&self.record).closes += 1;
    }
}

/// Opener handing out one [`StubPlan`] per open attempt
pub struct StubOpener {
    plans: VecDeque<StubPlan>,
    repeat: Option<StubPlan>,
    record: Arc<Mutex<StubRecord>>,
    stop: Option<StopSignal>,
}

impl StubOpener {
    pub fn new(plans: Vec<StubPlan>) -> Self {
        Self {
            plans: plans.into(),
            repeat: None,
            record: Arc::new(Mutex::new(StubRecord::default())),
            stop: None,
        }
    }

    /// Opener that never runs out: every attempt uses a copy of `plan`
    pub fn repeating(plan: StubPlan) -> Self {
        Self {
            repeat: Some(plan),
            ..Self::new(Vec::new())
        }
    }

    /// Assert `stop` once the plans run out, and let [`StubStep::Stop`] use it
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Shared record, stays valid after the opener moves into a supervisor
    pub fn record(&self) -> Arc<Mutex<StubRecord>> {
        Arc::clone(&self.record)
    }

    pub fn snapshot(&self) -> StubRecord {
        lock(&self.record).clone()
    }
}

impl DeviceOpener for StubOpener {
    type Device = StubDevice;

    fn open(&mut self, config: &DeviceConfig) -> Result<Session<StubDevice>> {
        lock(&self.record).open_attempts += 1;

        let Some(plan) = self.plans.pop_front().or_else(|| self.repeat.clone()) else {
            if let Some(stop) = &self.stop {
                stop.set();
            }
            return Err(CaptureError::DeviceNotFound(config.path.clone()));
        };

        if plan.fail_open {
            return Err(CaptureError::Negotiation("stub open failure".to_string()));
        }

        Ok(StubDevice::open_session(
            &plan,
            config,
            Arc::clone(&self.record),
            self.stop.clone(),
        ))
    }
}
