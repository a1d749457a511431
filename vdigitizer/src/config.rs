// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Device configuration
//!
//! Immutable for the process lifetime. Loaded from an optional JSON file
//! and overridden by command line flags.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CaptureError, Result};

/// Build a V4L2 fourcc code from its four ASCII characters
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Capture pixel format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, Y0 U Y1 V
    #[default]
    Yuyv,
    /// Packed YUV 4:2:2, U Y0 V Y1
    Uyvy,
    /// 16-bit RGB 5:6:5, little endian
    Rgb565,
    /// 24-bit RGB
    Rgb24,
    /// Baseline JPEG from the device
    Jpeg,
    /// Motion JPEG from the device
    Mjpeg,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Rgb565,
        PixelFormat::Rgb24,
        PixelFormat::Jpeg,
        PixelFormat::Mjpeg,
    ];

    /// V4L2 fourcc code
    pub fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Yuyv => fourcc(b"YUYV"),
            PixelFormat::Uyvy => fourcc(b"UYVY"),
            PixelFormat::Rgb565 => fourcc(b"RGBP"),
            PixelFormat::Rgb24 => fourcc(b"RGB3"),
            PixelFormat::Jpeg => fourcc(b"JPEG"),
            PixelFormat::Mjpeg => fourcc(b"MJPG"),
        }
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.fourcc() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Rgb565 => "RGB565",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Mjpeg => "MJPEG",
        }
    }

    /// Bytes per pixel for uncompressed formats, `None` for JPEG streams
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Rgb565 => Some(2),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Jpeg | PixelFormat::Mjpeg => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self.bytes_per_pixel().is_none()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|format| format.name()).collect();
                CaptureError::Config(format!(
                    "Unknown pixel format '{s}', expected one of: {}",
                    names.join(", ")
                ))
            })
    }
}

/// Analog video standard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoStandard {
    /// Leave the driver's standard untouched
    #[default]
    Unknown,
    Pal,
    Ntsc,
    Secam,
}

impl VideoStandard {
    pub const ALL: [VideoStandard; 4] = [
        VideoStandard::Unknown,
        VideoStandard::Pal,
        VideoStandard::Ntsc,
        VideoStandard::Secam,
    ];

    /// V4L2 `v4l2_std_id` mask
    pub fn std_id(self) -> u64 {
        match self {
            VideoStandard::Unknown => 0,
            VideoStandard::Pal => 0x0000_00ff,
            VideoStandard::Ntsc => 0x0000_b000,
            VideoStandard::Secam => 0x00ff_0000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VideoStandard::Unknown => "UNKNOWN",
            VideoStandard::Pal => "PAL",
            VideoStandard::Ntsc => "NTSC",
            VideoStandard::Secam => "SECAM",
        }
    }
}

impl fmt::Display for VideoStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VideoStandard {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|standard| standard.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                CaptureError::Config(format!(
                    "Unknown video standard '{s}', expected one of: UNKNOWN, PAL, NTSC, SECAM"
                ))
            })
    }
}

/// Capture device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device node (e.g., /dev/video0)
    pub path: PathBuf,
    /// Requested width
    pub width: u32,
    /// Requested height
    pub height: u32,
    /// Requested pixel format
    pub format: PixelFormat,
    /// Analog standard to apply
    pub standard: VideoStandard,
    /// Query and apply DV timings instead of a standard
    pub dv_timings: bool,
    /// Requested number of kernel buffers
    pub n_buffers: u32,
    /// Keep every Nth frame, 0 keeps all
    pub every_frame: u32,
    /// Frames smaller than this are assumed broken
    pub min_frame_size: u32,
    /// JPEG quality, 1..=100
    pub jpeg_quality: u8,
    /// select() timeout in seconds
    pub timeout: u32,
    /// Delay between failed initialization attempts, in seconds
    pub error_delay: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            standard: VideoStandard::Unknown,
            dv_timings: false,
            n_buffers: default_buffer_count(),
            every_frame: 0,
            min_frame_size: 128,
            jpeg_quality: 80,
            timeout: 1,
            error_delay: 1,
        }
    }
}

/// One buffer per online CPU plus one
fn default_buffer_count() -> u32 {
    thread::available_parallelism().map_or(2, |n| {
        u32::try_from(n.get()).map_or(2, |n| n.saturating_add(1))
    })
}

impl DeviceConfig {
    /// Load a configuration from a JSON file. Missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: DeviceConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the capture loop can't work with
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(CaptureError::Config("Device path is empty".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Config(format!(
                "Invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.n_buffers == 0 {
            return Err(CaptureError::Config(
                "Buffer count must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(CaptureError::Config(format!(
                "JPEG quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.timeout == 0 {
            return Err(CaptureError::Config(
                "select() timeout must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Readiness wait timeout
    pub fn select_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout))
    }

    /// Delay before retrying a failed initialization
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.error_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_codes() {
        assert_eq!(PixelFormat::Yuyv.fourcc(), 0x5659_5559);
        assert_eq!(PixelFormat::Mjpeg.fourcc(), 0x4750_4a4d);
        assert_eq!(PixelFormat::from_fourcc(0x5659_5559), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(fourcc(b"GREY")), None);
    }

    #[test]
    fn test_parse_format_is_case_insensitive() {
        assert_eq!("yuyv".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert_eq!("RGB565".parse::<PixelFormat>().unwrap(), PixelFormat::Rgb565);
        assert_eq!(" mjpeg ".parse::<PixelFormat>().unwrap(), PixelFormat::Mjpeg);
        assert!("H264".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_parse_standard() {
        assert_eq!("pal".parse::<VideoStandard>().unwrap(), VideoStandard::Pal);
        assert_eq!("NTSC".parse::<VideoStandard>().unwrap().std_id(), 0xb000);
        assert_eq!(VideoStandard::default().std_id(), 0);
        assert!("PAL-M".parse::<VideoStandard>().is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.n_buffers >= 2);
        assert_eq!(config.select_timeout(), Duration::from_secs(1));
        assert_eq!(config.every_frame, 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DeviceConfig {
            width: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.width = 640;
        config.jpeg_quality = 0;
        assert!(config.validate().is_err());

        config.jpeg_quality = 101;
        assert!(config.validate().is_err());

        config.jpeg_quality = 90;
        config.n_buffers = 0;
        assert!(config.validate().is_err());

        config.n_buffers = 4;
        config.timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_keeps_defaults_for_missing_keys() {
        let config = DeviceConfig::from_json(
            r#"{ "path": "/dev/video2", "format": "UYVY", "every-frame": 3, "dv-timings": true }"#,
        )
        .unwrap();

        assert_eq!(config.path, PathBuf::from("/dev/video2"));
        assert_eq!(config.format, PixelFormat::Uyvy);
        assert_eq!(config.every_frame, 3);
        assert!(config.dv_timings);
        assert_eq!(config.width, 640);
        assert_eq!(config.jpeg_quality, 80);
    }

    #[test]
    fn test_from_json_rejects_unknown_keys_and_invalid_values() {
        assert!(matches!(
            DeviceConfig::from_json(r#"{ "fps": 30 }"#),
            Err(CaptureError::ConfigFile(_))
        ));
        assert!(matches!(
            DeviceConfig::from_json(r#"{ "jpeg-quality": 0 }"#),
            Err(CaptureError::Config(_))
        ));
    }
}
