// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Kernel buffer exchange
//!
//! A buffer is owned either by the driver or by the application, never both.
//! [`acquire_buffer`] moves one buffer to the application and returns a
//! [`BufferHandle`]; [`release_buffer`] consumes the handle and gives the
//! buffer back. Between the two calls the buffer memory may be read; outside
//! that window it must not be touched.

use log::{debug, error};

use crate::device::{Session, VideoDevice};
use crate::{CaptureError, Result};

/// Ownership token for a dequeued buffer
#[must_use = "an acquired buffer must be released back to the driver"]
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    index: u32,
    bytes_used: u32,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes the driver filled in
    pub fn bytes_used(&self) -> u32 {
        self.bytes_used
    }
}

/// Dequeue the next completed buffer from the driver
pub fn acquire_buffer<D: VideoDevice>(session: &mut Session<D>) -> Result<BufferHandle> {
    debug!("Calling ioctl(VIDIOC_DQBUF) ...");
    let buffer = session
        .device_mut()
        .dequeue_buffer()
        .map_err(CaptureError::Dequeue)?;

    debug!(
        "Got a new frame in buffer index={}; bytesused={}",
        buffer.index, buffer.bytes_used
    );

    let n_buffers = session.n_buffers();
    if buffer.index >= n_buffers {
        error!(
            "Got invalid buffer index={}; nbuffers={}",
            buffer.index, n_buffers
        );
        return Err(CaptureError::InvalidBufferIndex {
            index: buffer.index,
            n_buffers,
        });
    }

    Ok(BufferHandle {
        index: buffer.index,
        bytes_used: buffer.bytes_used,
    })
}

/// Requeue a buffer so the driver can refill it
pub fn release_buffer<D: VideoDevice>(session: &mut Session<D>, handle: BufferHandle) -> Result<()> {
    debug!("Calling ioctl(VIDIOC_QBUF) for buffer index={} ...", handle.index);
    session
        .device_mut()
        .queue_buffer(handle.index)
        .map_err(|source| CaptureError::Requeue {
            index: handle.index,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::stub::{StubDevice, StubPlan, StubRecord, StubStep};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn open(script: Vec<StubStep>) -> (Session<StubDevice>, Arc<Mutex<StubRecord>>) {
        let record = Arc::new(Mutex::new(StubRecord::default()));
        let session = StubDevice::open_session(
            &StubPlan::session(3, script),
            &DeviceConfig::default(),
            Arc::clone(&record),
            None,
        );
        (session, record)
    }

    fn wait(session: &mut Session<StubDevice>) {
        session.device_mut().select(Duration::ZERO).unwrap();
    }

    #[test]
    fn test_acquire_then_release() {
        let (mut session, record) = open(vec![StubStep::Frame(4096)]);
        wait(&mut session);

        let handle = acquire_buffer(&mut session).unwrap();
        assert_eq!(handle.index(), 0);
        assert_eq!(handle.bytes_used(), 4096);

        release_buffer(&mut session, handle).unwrap();
        let record = record.lock().unwrap();
        assert_eq!(record.acquired, vec![0]);
        assert_eq!(record.released, vec![0]);
    }

    #[test]
    fn test_acquire_rejects_out_of_range_index() {
        let (mut session, _record) = open(vec![StubStep::InvalidIndex]);
        wait(&mut session);

        match acquire_buffer(&mut session) {
            Err(CaptureError::InvalidBufferIndex { index, n_buffers }) => {
                assert_eq!(n_buffers, 3);
                assert!(index >= n_buffers);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_acquire_failure_is_reported() {
        let (mut session, _record) = open(vec![StubStep::DequeueFailure]);
        wait(&mut session);
        assert!(matches!(
            acquire_buffer(&mut session),
            Err(CaptureError::Dequeue(_))
        ));
    }

    #[test]
    fn test_release_failure_is_reported() {
        let (mut session, record) = open(vec![StubStep::RequeueFailure(100)]);
        wait(&mut session);

        let handle = acquire_buffer(&mut session).unwrap();
        assert!(matches!(
            release_buffer(&mut session, handle),
            Err(CaptureError::Requeue { index: 0, .. })
        ));
        assert!(record.lock().unwrap().released.is_empty());
    }
}
