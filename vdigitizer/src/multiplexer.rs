// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Readiness wait on the capture descriptor
//!
//! One `select(2)` per mainloop iteration covering the read, write and
//! except sets of the single device descriptor.

use std::io;
use std::time::Duration;

use log::debug;

use crate::device::{Readiness, Session, VideoDevice};
use crate::{CaptureError, Result};

/// Outcome of one readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// At least one condition is set
    Ready(Readiness),
    /// Nothing happened within the timeout
    Timeout,
    /// A signal interrupted the wait
    Interrupted,
}

/// Wait until the session's device is ready or `timeout` expires.
///
/// Errors other than an interrupted wait are returned as
/// [`CaptureError::Select`].
pub fn wait_readiness<D: VideoDevice>(session: &mut Session<D>, timeout: Duration) -> Result<Wait> {
    debug!("Calling select() on video device ...");
    match session.device_mut().select(timeout) {
        Ok(ready) if ready.is_empty() => Ok(Wait::Timeout),
        Ok(ready) => {
            debug!(
                "Device select() --> read={}, write={}, error={}",
                ready.contains(Readiness::READ),
                ready.contains(Readiness::WRITE),
                ready.contains(Readiness::ERROR),
            );
            Ok(Wait::Ready(ready))
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Wait::Interrupted),
        Err(err) => Err(CaptureError::Select(err)),
    }
}

/// Capacity of `fd_set` on Linux
#[cfg(target_os = "linux")]
const FD_SETSIZE: std::os::unix::io::RawFd = 1024;

/// `select(2)` on a single descriptor with read, write and except sets.
///
/// An empty set means the timeout expired.
#[cfg(target_os = "linux")]
pub fn select_fd(fd: std::os::unix::io::RawFd, timeout: Duration) -> io::Result<Readiness> {
    if !(0..FD_SETSIZE).contains(&fd) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("descriptor {fd} out of select() range"),
        ));
    }

    // SAFETY: fd_set is plain data; FD_ZERO initializes it before use.
    let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut write_fds: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut error_fds: libc::fd_set = unsafe { std::mem::zeroed() };

    // SAFETY: fd is within [0, FD_SETSIZE), checked above.
    unsafe {
        libc::FD_ZERO(&mut read_fds);
        libc::FD_ZERO(&mut write_fds);
        libc::FD_ZERO(&mut error_fds);
        libc::FD_SET(fd, &mut read_fds);
        libc::FD_SET(fd, &mut write_fds);
        libc::FD_SET(fd, &mut error_fds);
    }

    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };

    // SAFETY: all pointers reference live locals for the duration of the call.
    let ret = unsafe {
        libc::select(
            fd + 1,
            &mut read_fds,
            &mut write_fds,
            &mut error_fds,
            &mut tv,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ready = Readiness::empty();
    if ret > 0 {
        // SAFETY: the sets were filled in by select() above.
        unsafe {
            ready.set(Readiness::READ, libc::FD_ISSET(fd, &read_fds));
            ready.set(Readiness::WRITE, libc::FD_ISSET(fd, &write_fds));
            ready.set(Readiness::ERROR, libc::FD_ISSET(fd, &error_fds));
        }
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::stub::{StubDevice, StubPlan, StubRecord, StubStep};
    use crate::device::DeviceEvent;
    use std::sync::{Arc, Mutex};

    fn session(script: Vec<StubStep>) -> Session<StubDevice> {
        let record = Arc::new(Mutex::new(StubRecord::default()));
        StubDevice::open_session(
            &StubPlan::session(2, script),
            &DeviceConfig::default(),
            record,
            None,
        )
    }

    #[test]
    fn test_wait_outcomes() {
        let mut session = session(vec![
            StubStep::Frame(10),
            StubStep::ReadWrite(10),
            StubStep::Event(DeviceEvent::EndOfStream),
            StubStep::Timeout,
            StubStep::Interrupted,
        ]);
        let timeout = Duration::from_secs(1);

        assert_eq!(
            wait_readiness(&mut session, timeout).unwrap(),
            Wait::Ready(Readiness::READ)
        );
        assert_eq!(
            wait_readiness(&mut session, timeout).unwrap(),
            Wait::Ready(Readiness::READ | Readiness::WRITE)
        );
        assert_eq!(
            wait_readiness(&mut session, timeout).unwrap(),
            Wait::Ready(Readiness::ERROR)
        );
        assert_eq!(wait_readiness(&mut session, timeout).unwrap(), Wait::Timeout);
        assert_eq!(
            wait_readiness(&mut session, timeout).unwrap(),
            Wait::Interrupted
        );
    }

    #[test]
    fn test_wait_error_is_fatal() {
        let mut session = session(vec![StubStep::SelectError]);
        assert!(matches!(
            wait_readiness(&mut session, Duration::from_secs(1)),
            Err(CaptureError::Select(_))
        ));
    }

    #[cfg(target_os = "linux")]
    mod select {
        use super::super::select_fd;
        use crate::device::Readiness;
        use std::time::Duration;

        struct Pipe {
            read: i32,
            write: i32,
        }

        impl Pipe {
            fn new() -> Self {
                let mut fds = [0; 2];
                // SAFETY: fds has room for the two descriptors pipe() fills in.
                assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
                Self {
                    read: fds[0],
                    write: fds[1],
                }
            }
        }

        impl Drop for Pipe {
            fn drop(&mut self) {
                // SAFETY: both descriptors are owned by this struct.
                unsafe {
                    libc::close(self.read);
                    libc::close(self.write);
                }
            }
        }

        #[test]
        fn test_select_empty_pipe_times_out() {
            let pipe = Pipe::new();
            let ready = select_fd(pipe.read, Duration::from_millis(10)).unwrap();
            assert!(ready.is_empty());
        }

        #[test]
        fn test_select_reports_readable_pipe() {
            let pipe = Pipe::new();
            let byte = [1u8];
            // SAFETY: writing one byte from a live buffer to an owned descriptor.
            let n = unsafe { libc::write(pipe.write, byte.as_ptr().cast(), 1) };
            assert_eq!(n, 1);

            let ready = select_fd(pipe.read, Duration::from_millis(10)).unwrap();
            assert!(ready.contains(Readiness::READ));
            assert!(!ready.contains(Readiness::WRITE));
        }

        #[test]
        fn test_select_reports_writable_pipe() {
            let pipe = Pipe::new();
            let ready = select_fd(pipe.write, Duration::from_millis(10)).unwrap();
            assert!(ready.contains(Readiness::WRITE));
            assert!(!ready.contains(Readiness::READ));
        }

        #[test]
        fn test_select_rejects_negative_descriptor() {
            assert!(select_fd(-1, Duration::ZERO).is_err());
        }
    }
}
