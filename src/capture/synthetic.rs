//! Synthetic camera producing a moving test pattern
//!
//! Useful on machines without a camera and as a deterministic source for
//! demos. Honours the same asynchronous open/configure contract as real
//! backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info};

use super::device::{
    CameraBackend, CameraDevice, CaptureRequest, CaptureSession, DeviceEvent, DeviceEvents,
    DeviceId, SessionOutputs,
};
use super::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::{device_codes, PipelineError};

#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sensor_orientation: i32,
    /// Stop producing after this many frames
    pub frame_limit: Option<u64>,
    pub first_timestamp_ns: i64,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            sensor_orientation: 90,
            frame_limit: None,
            first_timestamp_ns: 0,
        }
    }
}

pub struct SyntheticBackend {
    camera: SyntheticCamera,
}

impl SyntheticBackend {
    pub fn new(camera: SyntheticCamera) -> Self {
        Self { camera }
    }
}

impl CameraBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<DeviceId>, PipelineError> {
        Ok(vec![DeviceId("synthetic:0".into())])
    }

    fn open(&self, id: &DeviceId, events: DeviceEvents) -> Result<(), PipelineError> {
        let device = SyntheticDevice {
            id: id.clone(),
            camera: self.camera.clone(),
            open: true,
        };
        thread::Builder::new()
            .name("synthetic-open".into())
            .spawn(move || {
                events.send(DeviceEvent::Opened(Box::new(device)));
            })
            .map_err(|_| PipelineError::DeviceError(device_codes::CAMERA_SERVICE))?;
        Ok(())
    }
}

struct SyntheticDevice {
    id: DeviceId,
    camera: SyntheticCamera,
    open: bool,
}

impl CameraDevice for SyntheticDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn sensor_orientation(&self) -> i32 {
        self.camera.sensor_orientation
    }

    fn create_session(
        &mut self,
        outputs: SessionOutputs,
        events: DeviceEvents,
    ) -> Result<(), PipelineError> {
        if !self.open {
            return Err(PipelineError::SessionConfigFailed("device is closed".into()));
        }
        let session = SyntheticSession {
            camera: self.camera.clone(),
            outputs,
            producer: None,
        };
        thread::Builder::new()
            .name("synthetic-configure".into())
            .spawn(move || {
                events.send(DeviceEvent::SessionConfigured(Box::new(session)));
            })
            .map_err(|e| PipelineError::SessionConfigFailed(e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

struct Producer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct SyntheticSession {
    camera: SyntheticCamera,
    outputs: SessionOutputs,
    producer: Option<Producer>,
}

impl CaptureSession for SyntheticSession {
    fn set_repeating_request(&mut self, request: CaptureRequest) -> Result<(), PipelineError> {
        // Replacing the request restarts the producer
        self.close();

        let fps = request
            .fps_range
            .map(|(_, max)| max)
            .unwrap_or(self.camera.fps)
            .max(1);
        let stop = Arc::new(AtomicBool::new(false));
        let camera = self.camera.clone();
        let outputs = self.outputs.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("synthetic-stream".into())
            .spawn(move || produce(camera, fps, outputs, thread_stop))
            .map_err(|e| PipelineError::SessionConfigFailed(e.to_string()))?;
        self.producer = Some(Producer { stop, handle });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.stop.store(true, Ordering::Release);
            if producer.handle.join().is_err() {
                error!("Synthetic producer panicked");
            }
        }
    }
}

/// RGBA gradient with a vertical bar sweeping across the frame
fn render_pattern(width: u32, height: u32, sequence: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    let bar = (sequence.wrapping_mul(8) % u64::from(width.max(1))) as u32;
    for y in 0..height {
        for x in 0..width {
            if x.abs_diff(bar) < 8 {
                data.extend_from_slice(&[255, 255, 255, 255]);
            } else {
                let r = (u64::from(x) * 255 / u64::from(width.max(1))) as u8;
                let g = (u64::from(y) * 255 / u64::from(height.max(1))) as u8;
                data.extend_from_slice(&[r, g, 96, 255]);
            }
        }
    }
    data
}

fn produce(camera: SyntheticCamera, fps: u32, outputs: SessionOutputs, stop: Arc<AtomicBool>) {
    let interval = Duration::from_secs(1) / fps;
    let interval_ns = interval.as_nanos() as i64;
    info!(
        width = camera.width,
        height = camera.height,
        fps,
        "Synthetic stream started"
    );

    let mut next = Instant::now();
    let mut sequence = 0u64;
    while !stop.load(Ordering::Acquire) {
        if camera.frame_limit.is_some_and(|limit| sequence >= limit) {
            break;
        }
        let frame = Frame::new(
            Bytes::from(render_pattern(camera.width, camera.height, sequence)),
            FrameMetadata::packed(
                sequence,
                camera.width,
                camera.height,
                PixelFormat::Rgba8,
                camera
                    .first_timestamp_ns
                    .saturating_add(interval_ns.saturating_mul(sequence as i64)),
            ),
        );
        if !outputs.deliver(frame) {
            break;
        }
        sequence += 1;

        next += interval;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    debug!(frames = sequence, "Synthetic stream exiting");
}
