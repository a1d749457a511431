// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Hardware stream control

use log::{debug, info, warn};

use crate::device::{Session, VideoDevice};
use crate::{CaptureError, Result};

/// Start or stop the capture stream.
///
/// Does nothing if the session already is in the requested state. A failed
/// start is returned to the caller; stopping goes through [`stop_streaming`]
/// and never fails.
pub fn set_streaming<D: VideoDevice>(session: &mut Session<D>, enable: bool) -> Result<()> {
    if !enable {
        stop_streaming(session);
        return Ok(());
    }
    if session.is_capturing() {
        return Ok(());
    }

    debug!("Calling ioctl(VIDIOC_STREAMON) ...");
    session
        .device_mut()
        .set_stream(true)
        .map_err(CaptureError::StreamStart)?;

    session.set_capturing(true);
    info!("Capturing started");
    Ok(())
}

/// Stop the capture stream if it is running.
///
/// A failed stop is only logged since the device may already be gone, and
/// the session is marked stopped anyway.
pub fn stop_streaming<D: VideoDevice>(session: &mut Session<D>) {
    if !session.is_capturing() {
        return;
    }

    debug!("Calling ioctl(VIDIOC_STREAMOFF) ...");
    if let Err(err) = session.device_mut().set_stream(false) {
        warn!("Unable to stop capturing: {err}");
    }

    session.set_capturing(false);
    info!("Capturing stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::stub::{StubDevice, StubPlan, StubRecord};
    use std::sync::{Arc, Mutex};

    fn open(plan: StubPlan) -> (Session<StubDevice>, Arc<Mutex<StubRecord>>) {
        let record = Arc::new(Mutex::new(StubRecord::default()));
        let session =
            StubDevice::open_session(&plan, &DeviceConfig::default(), Arc::clone(&record), None);
        (session, record)
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mut session, record) = open(StubPlan::session(2, Vec::new()));

        set_streaming(&mut session, true).unwrap();
        set_streaming(&mut session, true).unwrap();

        assert!(session.is_capturing());
        assert_eq!(record.lock().unwrap().stream_on, 1);
    }

    #[test]
    fn test_stop_when_not_capturing_is_a_no_op() {
        let (mut session, record) = open(StubPlan::session(2, Vec::new()));

        set_streaming(&mut session, false).unwrap();
        assert_eq!(record.lock().unwrap().stream_off, 0);

        set_streaming(&mut session, true).unwrap();
        set_streaming(&mut session, false).unwrap();
        set_streaming(&mut session, false).unwrap();
        assert!(!session.is_capturing());
        assert_eq!(record.lock().unwrap().stream_off, 1);
    }

    #[test]
    fn test_start_failure_is_returned() {
        let (mut session, _record) = open(StubPlan::session(2, Vec::new()).with_stream_on_failure());

        assert!(matches!(
            set_streaming(&mut session, true),
            Err(CaptureError::StreamStart(_))
        ));
        assert!(!session.is_capturing());
    }

    #[test]
    fn test_stop_failure_is_not_escalated() {
        let (mut session, record) =
            open(StubPlan::session(2, Vec::new()).with_stream_off_failure());

        set_streaming(&mut session, true).unwrap();
        assert!(set_streaming(&mut session, false).is_ok());
        assert!(!session.is_capturing());

        // Already marked stopped: no second attempt
        set_streaming(&mut session, false).unwrap();
        assert_eq!(record.lock().unwrap().stream_off, 1);
    }

    #[test]
    fn test_stop_streaming_marks_session_stopped() {
        let (mut session, record) =
            open(StubPlan::session(2, Vec::new()).with_stream_off_failure());

        stop_streaming(&mut session);
        assert_eq!(record.lock().unwrap().stream_off, 0);

        set_streaming(&mut session, true).unwrap();
        stop_streaming(&mut session);
        stop_streaming(&mut session);
        assert!(!session.is_capturing());
        assert_eq!(record.lock().unwrap().stream_off, 1);
    }
}
