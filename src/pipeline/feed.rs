//! Periodic stats and frame feed for remote dashboards
//!
//! Messages are published on a broadcast channel; the transport that carries
//! them off the device lives outside this crate.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::coordinator::StatsReader;
use super::stats::StatsSnapshot;
use super::transform::{ProcessingMode, TransformResult};
use crate::capture::decode::{self, DecodeError};
use crate::capture::{FrameMetadata, PixelFormat};
use crate::FeedConfig;

const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("preview decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("preview encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FramePayload {
    pub width: u32,
    pub height: u32,
    pub mode: ProcessingMode,
    /// Source frame timestamp
    pub timestamp: i64,
    /// Milliseconds from capture to transform completion
    #[serde(rename = "processingTime")]
    pub processing_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum FeedPayload {
    Stats(StatsSnapshot),
    Frame(FramePayload),
}

/// `{"type": .., "payload": .., "timestamp": ms}`
#[derive(Debug, Clone, Serialize)]
pub struct FeedMessage {
    #[serde(flatten)]
    pub payload: FeedPayload,
    pub timestamp: u64,
    /// PNG of the transform output, sent out of band by the transport
    #[serde(skip)]
    pub preview: Option<Bytes>,
}

impl FeedMessage {
    pub fn new(payload: FeedPayload) -> Self {
        Self {
            payload,
            timestamp: unix_millis(),
            preview: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Encodes a transform result as PNG
pub fn encode_preview(result: &TransformResult) -> Result<Bytes, FeedError> {
    let output = &result.output;
    let mut png = Vec::new();
    let encoder = PngEncoder::new(&mut png);
    let meta = FrameMetadata {
        sequence: 0,
        width: output.width,
        height: output.height,
        stride: output.stride,
        format: output.format,
        timestamp_ns: result.timestamp_ns,
    };
    match output.format {
        PixelFormat::Gray8 => {
            let luma = decode::to_luma(&output.data, &meta)?;
            encoder.write_image(&luma, output.width, output.height, ExtendedColorType::L8)?;
        }
        _ => {
            let rgba = decode::to_rgba(&output.data, &meta)?;
            encoder.write_image(&rgba, output.width, output.height, ExtendedColorType::Rgba8)?;
        }
    }
    Ok(Bytes::from(png))
}

pub struct FeedPublisher {
    reader: StatsReader,
    config: FeedConfig,
    tx: broadcast::Sender<Arc<FeedMessage>>,
    last_frame_ts: Option<i64>,
}

impl FeedPublisher {
    pub fn new(reader: StatsReader, config: FeedConfig) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            reader,
            config,
            tx,
            last_frame_ts: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FeedMessage>> {
        self.tx.subscribe()
    }

    pub fn stats_message(&self) -> FeedMessage {
        FeedMessage::new(FeedPayload::Stats(self.reader.snapshot()))
    }

    /// Message for the newest transform result not yet published
    pub fn frame_message(&mut self) -> Option<FeedMessage> {
        let result = self.reader.latest_result()?;
        if self.last_frame_ts == Some(result.timestamp_ns) {
            return None;
        }
        self.last_frame_ts = Some(result.timestamp_ns);

        let mut message = FeedMessage::new(FeedPayload::Frame(FramePayload {
            width: result.output.width,
            height: result.output.height,
            mode: result.mode,
            timestamp: result.timestamp_ns,
            processing_time: result.latency.as_secs_f64() * 1000.0,
        }));
        if self.config.include_frames {
            match encode_preview(&result) {
                Ok(png) => message.preview = Some(png),
                Err(e) => warn!("Preview encoding failed: {}", e),
            }
        }
        Some(message)
    }

    fn publish(&self, message: FeedMessage) {
        // no subscribers is fine
        let _ = self.tx.send(Arc::new(message));
    }

    /// Publishes on every interval tick until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval_ms = self.config.interval_ms, "Feed publisher running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.publish(self.stats_message());
                    if let Some(frame) = self.frame_message() {
                        self.publish(frame);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Feed publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::coordinator::PipelineStateKind;
    use crate::pipeline::transform::TransformOutput;

    #[test]
    fn test_stats_envelope_shape() {
        let message = FeedMessage::new(FeedPayload::Stats(StatsSnapshot {
            fps: 30,
            resolution: "1280x720".into(),
            last_processing_latency_ms: 4.5,
            frame_count: 12,
            pipeline_state: PipelineStateKind::Streaming,
        }));
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["payload"]["resolution"], "1280x720");
        assert_eq!(json["payload"]["lastProcessingLatencyMs"], 4.5);
        assert_eq!(json["payload"]["pipelineState"], "streaming");
        assert!(json["timestamp"].is_u64());
    }

    #[test]
    fn test_frame_envelope_shape() {
        let message = FeedMessage::new(FeedPayload::Frame(FramePayload {
            width: 640,
            height: 480,
            mode: ProcessingMode::Edge,
            timestamp: 99,
            processing_time: 3.0,
        }));
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "frame");
        assert_eq!(json["payload"]["mode"], "edge");
        assert_eq!(json["payload"]["processingTime"], 3.0);
        assert!(json.get("preview").is_none());
    }

    #[test]
    fn test_gray_preview_is_png() {
        let result = TransformResult {
            timestamp_ns: 1,
            mode: ProcessingMode::Gray,
            output: TransformOutput {
                data: Bytes::from(vec![128u8; 16]),
                width: 4,
                height: 4,
                stride: 4,
                format: PixelFormat::Gray8,
                code: 2,
            },
            latency: Duration::from_millis(2),
        };
        let png = encode_preview(&result).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_raw_preview_skips_row_padding() {
        // 2x2 RGBA rows padded to 12 bytes; padding bytes are 0xEE
        let mut data = Vec::new();
        for row in 0..2u8 {
            data.extend_from_slice(&[row * 100, 10, 20, 255, row * 100, 10, 20, 255]);
            data.extend_from_slice(&[0xEE; 4]);
        }
        let result = TransformResult {
            timestamp_ns: 1,
            mode: ProcessingMode::Raw,
            output: TransformOutput {
                data: Bytes::from(data),
                width: 2,
                height: 2,
                stride: 12,
                format: PixelFormat::Rgba8,
                code: 0,
            },
            latency: Duration::ZERO,
        };
        let png = encode_preview(&result).unwrap();
        let image = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(1, 0).0, [0, 10, 20, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [100, 10, 20, 255]);
    }
}
