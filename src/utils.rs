use crate::capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub format: PixelFormat,
}

/// Capture formats in order of preference
pub const CAPTURE_FORMATS: [PixelFormat; 4] = [
    PixelFormat::Mjpeg,
    PixelFormat::Yuyv4,
    PixelFormat::Rgb24,
    PixelFormat::Gray8,
];

pub fn fourcc_for(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Mjpeg => Some(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv4 => Some(FourCC::new(b"YUYV")),
        PixelFormat::Rgb24 => Some(FourCC::new(b"RGB3")),
        PixelFormat::Gray8 => Some(FourCC::new(b"GREY")),
        PixelFormat::Rgba8 => None,
    }
}

/// Inverse of [`fourcc_for`]; `None` for formats we cannot decode
pub fn format_for(fourcc: FourCC) -> Option<PixelFormat> {
    CAPTURE_FORMATS
        .into_iter()
        .find(|format| fourcc_for(*format) == Some(fourcc))
}

/// Probes a single node, returning its preferred capture format
pub fn probe_device(path: &str) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        debug!("{} has no capture capability", path);
        return None;
    }

    let formats = dev.enum_formats().ok()?;
    let format = CAPTURE_FORMATS
        .into_iter()
        .find(|candidate| {
            fourcc_for(*candidate).is_some_and(|fourcc| formats.iter().any(|f| f.fourcc == fourcc))
        })?;

    Some(FoundDevice {
        path: path.to_string(),
        card: caps.card,
        format,
    })
}

/// Lists capture-capable V4L2 nodes in index order
pub fn enumerate_devices() -> Vec<FoundDevice> {
    info!("Enumerating capture devices...");

    let found: Vec<FoundDevice> = (0..64)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .filter_map(|path| probe_device(&path))
        .collect();

    for device in &found {
        info!("Found {:?} device: {} - {}", device.format, device.path, device.card);
    }
    found
}
