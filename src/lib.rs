pub mod capture;
pub mod display;
pub mod error;
pub mod orientation;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{Disposition, PipelineError};
pub use orientation::{DisplayRotation, Rotation};
pub use pipeline::{Coordinator, PipelineState, PipelineStateKind, ProcessingMode, StatsSnapshot};

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
    pub transform: TransformConfig,
    pub feed: FeedConfig,
}

impl Config {
    /// Loads `path` (if present) with `EDGEVIEW__SECTION__KEY` overrides on top
    pub fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("EDGEVIEW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackendKind {
    #[default]
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackendKind,
    /// Preferred device path, tried before enumeration order
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub reader_depth: usize,
    /// Clockwise mount angle reported for the sensor
    pub sensor_orientation: i32,
    pub start_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackendKind::V4l2,
            device: None,
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            reader_depth: 2,
            sensor_orientation: 90,
            start_timeout_ms: 5000,
        }
    }
}

impl CaptureConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub rotation: DisplayRotation,
    pub gpu_backend: GpuBackend,
    /// Pin the render thread to this core
    pub render_core: Option<usize>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            rotation: DisplayRotation::Rotation0,
            gpu_backend: GpuBackend::Auto,
            render_core: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    Vulkan,
    Metal,
    Dx12,
    OpenGl,
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on waiting for in-flight transforms when stopping
    pub drain_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub mode: ProcessingMode,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 2,
            mode: ProcessingMode::Edge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Attach a PNG preview of the latest transform output
    pub include_frames: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1000,
            include_frames: false,
        }
    }
}
