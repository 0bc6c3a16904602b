use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host arrival time for latency tracking
    pub received_at: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            received_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.meta.timestamp_ns
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Capture timestamp from the device clock
    pub timestamp_ns: i64,
}

impl FrameMetadata {
    /// Metadata for a tightly packed frame
    pub fn packed(sequence: u64, width: u32, height: u32, format: PixelFormat, timestamp_ns: i64) -> Self {
        Self {
            sequence,
            width,
            height,
            stride: width.saturating_mul(format.bytes_per_pixel().unwrap_or(1)),
            format,
            timestamp_ns,
        }
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba8,
    Rgb24,
    Gray8,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for uncompressed formats
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgba8 => Some(4),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }
}
