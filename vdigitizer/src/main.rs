// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! vdigitizer CLI entry point
//!
//! Captures frames from a V4L2 device and compresses them to JPEG until
//! SIGINT or SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use vdigitizer::{DeviceConfig, PixelFormat, StopSignal, VideoStandard};

fn cli() -> Command {
    Command::new("vdigitizer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("V4L2 capture daemon producing JPEG pictures")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("JSON configuration file; command line options override it"),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Path to V4L2 device [default: /dev/video0]"),
        )
        .arg(
            Arg::new("width")
                .short('x')
                .long("width")
                .value_name("N")
                .value_parser(value_parser!(u32))
                .help("Initial image width [default: 640]"),
        )
        .arg(
            Arg::new("height")
                .short('y')
                .long("height")
                .value_name("N")
                .value_parser(value_parser!(u32))
                .help("Initial image height [default: 480]"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FMT")
                .help("Image format: YUYV, UYVY, RGB565, RGB24, JPEG, MJPEG [default: YUYV]"),
        )
        .arg(
            Arg::new("tv-standard")
                .short('a')
                .long("tv-standard")
                .value_name("STD")
                .help("Force TV standard: PAL, NTSC, SECAM [default: autodetect]"),
        )
        .arg(
            Arg::new("dv-timings")
                .short('t')
                .long("dv-timings")
                .action(ArgAction::SetTrue)
                .help("Enable DV timings querying and events processing"),
        )
        .arg(
            Arg::new("buffers")
                .short('b')
                .long("buffers")
                .value_name("N")
                .value_parser(value_parser!(u32))
                .help("Number of kernel buffers [default: CPU count + 1]"),
        )
        .arg(
            Arg::new("every-frame")
                .short('e')
                .long("every-frame")
                .value_name("N")
                .value_parser(value_parser!(u32))
                .help("Drop all input frames except every N-th [default: 0, keep all]"),
        )
        .arg(
            Arg::new("min-frame-size")
                .short('z')
                .long("min-frame-size")
                .value_name("BYTES")
                .value_parser(value_parser!(u32))
                .help("Drop frames smaller than this, they are assumed broken [default: 128]"),
        )
        .arg(
            Arg::new("quality")
                .short('q')
                .long("quality")
                .value_name("N")
                .value_parser(value_parser!(u8))
                .help("JPEG quality, 1..=100 [default: 80]"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u32))
                .help("Timeout for device select() [default: 1]"),
        )
        .arg(
            Arg::new("error-delay")
                .long("error-delay")
                .value_name("SECONDS")
                .value_parser(value_parser!(u32))
                .help("Delay before trying to reinitialize the device [default: 1]"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
}

/// Configuration file (if any) with command line overrides applied
fn build_config(matches: &ArgMatches) -> Result<DeviceConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => DeviceConfig::from_file(path)
            .with_context(|| format!("Can't load configuration from {}", path.display()))?,
        None => DeviceConfig::default(),
    };

    if let Some(path) = matches.get_one::<PathBuf>("device") {
        config.path.clone_from(path);
    }
    if let Some(format) = matches.get_one::<String>("format") {
        config.format = format
            .parse::<PixelFormat>()
            .with_context(|| format!("Unknown image format: {format}"))?;
    }
    if let Some(standard) = matches.get_one::<String>("tv-standard") {
        config.standard = standard
            .parse::<VideoStandard>()
            .with_context(|| format!("Unknown TV standard: {standard}"))?;
    }
    if matches.get_flag("dv-timings") {
        config.dv_timings = true;
    }

    let numbers: [(&str, &mut u32); 7] = [
        ("width", &mut config.width),
        ("height", &mut config.height),
        ("buffers", &mut config.n_buffers),
        ("every-frame", &mut config.every_frame),
        ("min-frame-size", &mut config.min_frame_size),
        ("timeout", &mut config.timeout),
        ("error-delay", &mut config.error_delay),
    ];
    for (name, field) in numbers {
        if let Some(value) = matches.get_one::<u32>(name) {
            *field = *value;
        }
    }
    if let Some(quality) = matches.get_one::<u8>("quality") {
        config.jpeg_quality = *quality;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("Failed to initialize logging")?;

    let config = build_config(&matches)?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("===== Stopping by signal =====");
        handler_stop.set();
    })
    .context("Failed to install signal handler")?;

    run(config, stop)
}

#[cfg(target_os = "linux")]
fn run(config: DeviceConfig, stop: StopSignal) -> Result<()> {
    use vdigitizer::v4l2::V4l2Opener;
    use vdigitizer::{CaptureSupervisor, JpegCompressor};

    let compressor = JpegCompressor::new(config.jpeg_quality);
    let mut supervisor = CaptureSupervisor::new(config, V4l2Opener, compressor, stop);
    supervisor.run();

    let stats = supervisor.stats();
    info!(
        "Sessions: {} started, {} failed, {} workers; frames: {} captured, {} compressed, {} skipped, {} broken",
        stats.sessions_started,
        stats.session_failures,
        stats.workers_spawned,
        stats.frames_captured,
        stats.frames_forwarded,
        stats.frames_skipped,
        stats.frames_too_small
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_config: DeviceConfig, _stop: StopSignal) -> Result<()> {
    anyhow::bail!("V4L2 capture is only available on Linux")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Result<DeviceConfig> {
        let matches = cli().try_get_matches_from(args)?;
        build_config(&matches)
    }

    #[test]
    fn test_defaults_without_arguments() {
        assert_eq!(config(&["vdigitizer"]).unwrap(), DeviceConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            "vdigitizer",
            "-d",
            "/dev/video2",
            "-x",
            "1280",
            "-y",
            "720",
            "-f",
            "uyvy",
            "-a",
            "pal",
            "-b",
            "3",
            "-e",
            "2",
            "-z",
            "8000",
            "-q",
            "95",
            "--timeout",
            "5",
        ])
        .unwrap();

        assert_eq!(config.path, PathBuf::from("/dev/video2"));
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.format, PixelFormat::Uyvy);
        assert_eq!(config.standard, VideoStandard::Pal);
        assert_eq!(config.n_buffers, 3);
        assert_eq!(config.every_frame, 2);
        assert_eq!(config.min_frame_size, 8000);
        assert_eq!(config.jpeg_quality, 95);
        assert_eq!(config.timeout, 5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config(&["vdigitizer", "-f", "h264"]).is_err());
        assert!(config(&["vdigitizer", "-q", "0"]).is_err());
        assert!(config(&["vdigitizer", "-x", "0"]).is_err());
        assert!(config(&["vdigitizer", "-x", "wide"]).is_err());
    }
}
