// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Raw V4L2 definitions from `linux/videodev2.h`
//!
//! Only the structures and requests the capture path needs. Layouts follow
//! the kernel UAPI, so their sizes (and therefore the ioctl numbers derived
//! from them) match the running architecture.

use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | ((b'V' as u32) << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

const fn ior<T>(nr: u32) -> u32 {
    ioc(IOC_READ, nr, size_of::<T>())
}

const fn iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, nr, size_of::<T>())
}

const fn iowr<T>(nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, size_of::<T>())
}

pub const VIDIOC_QUERYCAP: u32 = ior::<V4l2Capability>(0);
pub const VIDIOC_S_FMT: u32 = iowr::<V4l2Format>(5);
pub const VIDIOC_REQBUFS: u32 = iowr::<V4l2RequestBuffers>(8);
pub const VIDIOC_QUERYBUF: u32 = iowr::<V4l2Buffer>(9);
pub const VIDIOC_QBUF: u32 = iowr::<V4l2Buffer>(15);
pub const VIDIOC_DQBUF: u32 = iowr::<V4l2Buffer>(17);
pub const VIDIOC_STREAMON: u32 = iow::<libc::c_int>(18);
pub const VIDIOC_STREAMOFF: u32 = iow::<libc::c_int>(19);
pub const VIDIOC_S_STD: u32 = iow::<u64>(24);
pub const VIDIOC_S_DV_TIMINGS: u32 = iowr::<V4l2DvTimings>(87);
pub const VIDIOC_DQEVENT: u32 = ior::<V4l2Event>(89);
pub const VIDIOC_SUBSCRIBE_EVENT: u32 = iow::<V4l2EventSubscription>(90);
pub const VIDIOC_QUERY_DV_TIMINGS: u32 = ior::<V4l2DvTimings>(99);

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_ANY: u32 = 0;

pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;

/// Attempts for an ioctl interrupted by a signal
const XIOCTL_RETRIES: u32 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// `fmt` union of `struct v4l2_format`; the kernel side contains pointers,
/// hence the pointer-sized alignment member.
#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatUnion {
    pub pix: V4l2PixFormat,
    pub raw_data: [u8; 200],
    _align: [usize; 200 / size_of::<usize>()],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Event {
    pub type_: u32,
    pub u: [u64; 8],
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2EventSubscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

/// `struct v4l2_dv_timings` with the BT.656/1120 timings flattened; only the
/// active width and height are interpreted.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2DvTimings {
    pub type_: u32,
    pub width: u32,
    pub height: u32,
    pub rest: [u8; 120],
}

/// All-zero value of a UAPI struct
pub fn zeroed<T: Copy>() -> T {
    // SAFETY: only instantiated with the plain-data repr(C) types above, for
    // which the all-zero bit pattern is valid.
    unsafe { std::mem::zeroed() }
}

/// `ioctl(2)` retried when interrupted by a signal.
///
/// # Safety
///
/// `arg` must point to a live value of the type `request` encodes.
pub unsafe fn xioctl<T>(fd: RawFd, request: u32, arg: *mut T) -> io::Result<()> {
    let mut retries = XIOCTL_RETRIES;
    loop {
        if libc::ioctl(fd, request as _, arg) >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted && retries > 0 {
            retries -= 1;
            continue;
        }
        return Err(err);
    }
}

/// NUL-terminated fixed-size field as text
pub fn c_field(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<V4l2Capability>(), 104);
        assert_eq!(size_of::<V4l2Format>(), 208);
        assert_eq!(size_of::<V4l2RequestBuffers>(), 20);
        assert_eq!(size_of::<V4l2Buffer>(), 88);
        assert_eq!(size_of::<V4l2Event>(), 136);
        assert_eq!(size_of::<V4l2EventSubscription>(), 32);
        assert_eq!(size_of::<V4l2DvTimings>(), 132);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_request_numbers() {
        assert_eq!(VIDIOC_QUERYCAP, 0x8068_5600);
        assert_eq!(VIDIOC_S_FMT, 0xc0d0_5605);
        assert_eq!(VIDIOC_REQBUFS, 0xc014_5608);
        assert_eq!(VIDIOC_QUERYBUF, 0xc058_5609);
        assert_eq!(VIDIOC_QBUF, 0xc058_560f);
        assert_eq!(VIDIOC_DQBUF, 0xc058_5611);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(VIDIOC_STREAMOFF, 0x4004_5613);
        assert_eq!(VIDIOC_S_STD, 0x4008_5618);
        assert_eq!(VIDIOC_DQEVENT, 0x8088_5659);
        assert_eq!(VIDIOC_SUBSCRIBE_EVENT, 0x4020_565a);
        assert_eq!(VIDIOC_S_DV_TIMINGS, 0xc084_5657);
        assert_eq!(VIDIOC_QUERY_DV_TIMINGS, 0x8084_5663);
    }

    #[test]
    fn test_c_field() {
        assert_eq!(c_field(b"uvcvideo\0\0\0\0"), "uvcvideo");
        assert_eq!(c_field(b"full"), "full");
        assert_eq!(c_field(&[0; 4]), "");
    }

    #[test]
    fn test_ioctl_on_non_device_fails() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let mut cap: V4l2Capability = zeroed();
        // SAFETY: cap matches the QUERYCAP argument type.
        let result = unsafe {
            xioctl(
                std::os::unix::io::AsRawFd::as_raw_fd(&file),
                VIDIOC_QUERYCAP,
                &mut cap,
            )
        };
        assert!(result.is_err());
    }
}
