// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! JPEG compression of accepted frames
//!
//! The mainloop hands every forwarded frame to a [`FrameCompressor`] while
//! it still owns the buffer. [`JpegCompressor`] converts raw frames to RGB,
//! encodes them with the `image` crate and keeps one picture per kernel
//! buffer. The most recent picture is also published in a [`PictureSlot`]
//! that other threads can read.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use log::{debug, warn};

use crate::config::PixelFormat;
use crate::device::Frame;

/// Consumer of accepted frames
///
/// Called synchronously from the mainloop. Implementations must not keep a
/// reference to the frame data after returning.
pub trait FrameCompressor {
    fn compress(&mut self, frame: &Frame<'_>);
}

/// Compression failure
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("Frame too short: got {got} bytes, expected {expected}")]
    ShortFrame { got: usize, expected: usize },

    #[error("Unsupported frame geometry {width}x{height} for {format}")]
    Geometry {
        width: u32,
        height: u32,
        format: PixelFormat,
    },

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// One compressed frame
#[derive(Debug, Clone)]
pub struct Picture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Kernel buffer the frame came from
    pub buffer_index: u32,
    pub captured_at: Instant,
}

/// Latest picture, shared between the capture thread and readers
#[derive(Debug, Clone, Default)]
pub struct PictureSlot {
    latest: Arc<Mutex<Option<Arc<Picture>>>>,
}

impl PictureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<Picture>> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, picture: Picture) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(picture));
    }
}

/// JPEG compressor backed by `image`
pub struct JpegCompressor {
    quality: u8,
    pictures: Vec<Vec<u8>>,
    slot: PictureSlot,
    encoded: u64,
    failed: u64,
}

impl JpegCompressor {
    /// Create a compressor; `quality` is clamped to 1..=100
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            pictures: Vec::new(),
            slot: PictureSlot::new(),
            encoded: 0,
            failed: 0,
        }
    }

    /// Publish into an existing slot instead of a private one
    pub fn with_slot(mut self, slot: PictureSlot) -> Self {
        self.slot = slot;
        self
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn slot(&self) -> PictureSlot {
        self.slot.clone()
    }

    /// Last picture produced from buffer `index`
    pub fn picture(&self, index: u32) -> Option<&[u8]> {
        self.pictures
            .get(index as usize)
            .filter(|data| !data.is_empty())
            .map(Vec::as_slice)
    }

    /// Frames encoded so far
    pub fn encoded(&self) -> u64 {
        self.encoded
    }

    /// Frames that could not be encoded
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Encode one frame into a standalone JPEG
    pub fn encode(&self, frame: &Frame<'_>) -> Result<Vec<u8>, CompressError> {
        if frame.format.is_compressed() {
            if frame.data.is_empty() {
                return Err(CompressError::ShortFrame {
                    got: 0,
                    expected: 1,
                });
            }
            return Ok(frame.data.to_vec());
        }

        let rgb = to_rgb(frame)?;
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, self.quality).encode(
            &rgb,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(data)
    }
}

impl FrameCompressor for JpegCompressor {
    fn compress(&mut self, frame: &Frame<'_>) {
        let data = match self.encode(frame) {
            Ok(data) => data,
            Err(err) => {
                self.failed += 1;
                warn!(
                    "Can't compress frame from buffer index={}: {err}",
                    frame.index
                );
                return;
            }
        };

        debug!(
            "Compressed buffer index={} into {} bytes",
            frame.index,
            data.len()
        );

        let index = frame.index as usize;
        if self.pictures.len() <= index {
            self.pictures.resize_with(index + 1, Vec::new);
        }
        self.pictures[index].clone_from(&data);
        self.encoded += 1;

        self.slot.publish(Picture {
            data,
            width: frame.width,
            height: frame.height,
            buffer_index: frame.index,
            captured_at: Instant::now(),
        });
    }
}

fn saturate(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 limited range to RGB
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        saturate((298 * c + 409 * e + 128) >> 8),
        saturate((298 * c - 100 * d - 208 * e + 128) >> 8),
        saturate((298 * c + 516 * d + 128) >> 8),
    ]
}

fn rgb565_to_rgb(lo: u8, hi: u8) -> [u8; 3] {
    let pixel = u16::from_le_bytes([lo, hi]);
    let r = ((pixel >> 11) & 0x1f) as u8;
    let g = ((pixel >> 5) & 0x3f) as u8;
    let b = (pixel & 0x1f) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

/// Convert an uncompressed frame to packed 8-bit RGB
pub fn to_rgb(frame: &Frame<'_>) -> Result<Vec<u8>, CompressError> {
    let geometry = || CompressError::Geometry {
        width: frame.width,
        height: frame.height,
        format: frame.format,
    };

    let bpp = frame.format.bytes_per_pixel().ok_or_else(geometry)?;
    if frame.width == 0 || frame.height == 0 {
        return Err(geometry());
    }
    let pixels = frame.width as usize * frame.height as usize;
    let expected = pixels * bpp;
    if frame.data.len() < expected {
        return Err(CompressError::ShortFrame {
            got: frame.data.len(),
            expected,
        });
    }
    let data = &frame.data[..expected];

    let mut rgb = Vec::with_capacity(pixels * 3);
    match frame.format {
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            if frame.width % 2 != 0 {
                return Err(geometry());
            }
            let yuyv = frame.format == PixelFormat::Yuyv;
            for chunk in data.chunks_exact(4) {
                let (y0, u, y1, v) = if yuyv {
                    (chunk[0], chunk[1], chunk[2], chunk[3])
                } else {
                    (chunk[1], chunk[0], chunk[3], chunk[2])
                };
                rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
        }
        PixelFormat::Rgb565 => {
            for chunk in data.chunks_exact(2) {
                rgb.extend_from_slice(&rgb565_to_rgb(chunk[0], chunk[1]));
            }
        }
        PixelFormat::Rgb24 => rgb.extend_from_slice(data),
        PixelFormat::Jpeg | PixelFormat::Mjpeg => return Err(geometry()),
    }
    Ok(rgb)
}
