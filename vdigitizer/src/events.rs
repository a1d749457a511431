// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Device event handling

use log::{error, info, warn};

use crate::device::{DeviceEvent, Session, VideoDevice};

/// What the mainloop should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventVerdict {
    /// The session must be torn down and the device reinitialized
    ReinitRequired,
    /// Keep capturing
    Ignore,
}

/// Dequeue one pending device event and decide whether the session survives.
///
/// Only a source change ends the session. Unknown events and events that
/// can't be dequeued are logged and ignored.
pub fn handle_event<D: VideoDevice>(session: &mut Session<D>) -> EventVerdict {
    match session.device_mut().dequeue_event() {
        Ok(DeviceEvent::SourceChange) => {
            info!("Got V4L2_EVENT_SOURCE_CHANGE: source changed");
            EventVerdict::ReinitRequired
        }
        Ok(DeviceEvent::EndOfStream) => {
            info!("Got V4L2_EVENT_EOS: end of stream (ignored)");
            EventVerdict::Ignore
        }
        Ok(DeviceEvent::Other(kind)) => {
            warn!("Got unexpected V4L2 event type={kind} (ignored)");
            EventVerdict::Ignore
        }
        Err(err) => {
            error!("Got some V4L2 device event, but where is it? {err}");
            EventVerdict::Ignore
        }
    }
}
