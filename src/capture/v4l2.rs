//! V4L2 camera backend with memory-mapped streaming

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use super::device::{
    CameraBackend, CameraDevice, CaptureRequest, CaptureSession, DeviceEvent, DeviceEvents,
    DeviceId, SessionOutputs,
};
use super::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::{device_codes, PipelineError};
use crate::{utils, CaptureConfig};

/// Poll interval of the streaming thread, bounds how long `close` waits
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

fn error_code(e: &io::Error) -> i32 {
    match e.raw_os_error() {
        Some(libc::EBUSY) => device_codes::CAMERA_IN_USE,
        Some(libc::EACCES) | Some(libc::EPERM) => device_codes::CAMERA_DISABLED,
        _ => device_codes::CAMERA_DEVICE,
    }
}

pub struct V4l2Backend {
    config: CaptureConfig,
    /// Preferred format of each node seen by the last enumeration
    detected: Mutex<HashMap<String, PixelFormat>>,
}

impl V4l2Backend {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            detected: Mutex::new(HashMap::new()),
        }
    }
}

impl CameraBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn enumerate(&self) -> Result<Vec<DeviceId>, PipelineError> {
        let found = utils::enumerate_devices();
        if let Ok(mut detected) = self.detected.lock() {
            *detected = found
                .iter()
                .map(|device| (device.path.clone(), device.format))
                .collect();
        }
        let mut devices: Vec<DeviceId> = found.into_iter().map(|found| DeviceId(found.path)).collect();

        // A configured device path moves to the front when present
        if let Some(preferred) = &self.config.device {
            if let Some(pos) = devices.iter().position(|id| &id.0 == preferred) {
                let id = devices.remove(pos);
                devices.insert(0, id);
            }
        }
        Ok(devices)
    }

    fn open(&self, id: &DeviceId, events: DeviceEvents) -> Result<(), PipelineError> {
        let id = id.clone();
        let config = self.config.clone();
        let fallback = self
            .detected
            .lock()
            .ok()
            .and_then(|detected| detected.get(&id.0).copied());
        thread::Builder::new()
            .name("v4l2-open".into())
            .spawn(move || match V4l2Device::open(id.clone(), config, fallback) {
                Ok(device) => {
                    events.send(DeviceEvent::Opened(Box::new(device)));
                }
                Err(e) => {
                    error!(device = %id, "Failed to open: {}", e);
                    events.send(DeviceEvent::Error(error_code(&e)));
                }
            })
            .map_err(|e| {
                error!("Failed to spawn open thread: {}", e);
                PipelineError::DeviceError(device_codes::CAMERA_SERVICE)
            })?;
        Ok(())
    }
}

pub struct V4l2Device {
    id: DeviceId,
    config: CaptureConfig,
    /// Format detected at enumeration, tried when the driver rejects ours
    fallback: Option<PixelFormat>,
    /// The only open handle; shared with the stream thread while a session runs
    device: Option<Arc<Device>>,
}

impl V4l2Device {
    #[instrument(skip(config))]
    fn open(id: DeviceId, config: CaptureConfig, fallback: Option<PixelFormat>) -> io::Result<Self> {
        let device = Device::with_path(&id.0)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device doesn't support video capture",
            ));
        }

        Ok(Self {
            id,
            config,
            fallback,
            device: Some(Arc::new(device)),
        })
    }
}

impl CameraDevice for V4l2Device {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn sensor_orientation(&self) -> i32 {
        // V4L2 does not expose the mounting angle
        self.config.sensor_orientation
    }

    fn create_session(
        &mut self,
        outputs: SessionOutputs,
        events: DeviceEvents,
    ) -> Result<(), PipelineError> {
        let Some(device) = self.device.clone() else {
            return Err(PipelineError::SessionConfigFailed("device is closed".into()));
        };

        let control = Arc::new(SessionControl::default());
        let path = self.id.0.clone();
        let config = self.config.clone();
        let fallback = self.fallback;
        let thread_control = Arc::clone(&control);

        // Held until the handle is stored so the thread cannot publish the
        // session before `close` is able to join it
        let mut slot = control
            .handle
            .lock()
            .map_err(|_| PipelineError::SessionConfigFailed("session lock poisoned".into()))?;
        let handle = thread::Builder::new()
            .name("v4l2-stream".into())
            .spawn(move || {
                stream_loop(device, path, config, fallback, outputs, events, thread_control)
            })
            .map_err(|e| PipelineError::SessionConfigFailed(e.to_string()))?;
        *slot = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!(device = %self.id, "Device closed");
        }
    }
}

#[derive(Default)]
struct SessionControl {
    stop: AtomicBool,
    repeating: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct V4l2Session {
    control: Arc<SessionControl>,
}

impl CaptureSession for V4l2Session {
    fn set_repeating_request(&mut self, request: CaptureRequest) -> Result<(), PipelineError> {
        debug!(?request, "Repeating request");
        self.control.repeating.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        self.control.repeating.store(false, Ordering::Release);
        self.control.stop.store(true, Ordering::Release);
        let handle = self.control.handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("V4L2 stream thread panicked");
            }
        }
    }
}

/// Maps what the driver accepted back to a frame format
///
/// Drivers may substitute another format for the one requested; frames are
/// labelled with what was negotiated.
pub fn negotiated_format(requested: PixelFormat, negotiated: v4l::FourCC) -> Option<PixelFormat> {
    let format = utils::format_for(negotiated)?;
    if format != requested {
        warn!(?requested, ?format, "Driver substituted capture format");
    }
    Some(format)
}

fn set_format(device: &Device, config: &CaptureConfig, format: PixelFormat) -> io::Result<v4l::Format> {
    let fourcc = utils::fourcc_for(format).ok_or_else(|| {
        io::Error::new(io::ErrorKind::Unsupported, "unsupported pixel format")
    })?;
    let mut fmt = device.format()?;
    fmt.width = config.width;
    fmt.height = config.height;
    fmt.fourcc = fourcc;
    device.set_format(&fmt)
}

fn configure(
    device: &Device,
    config: &CaptureConfig,
    fallback: Option<PixelFormat>,
) -> io::Result<(v4l::Format, PixelFormat)> {
    let mut fmt = set_format(device, config, config.format)?;
    let mut format = negotiated_format(config.format, fmt.fourcc);
    if format.is_none() {
        if let Some(fallback) = fallback.filter(|f| *f != config.format) {
            debug!(?fallback, "Retrying with detected format");
            fmt = set_format(device, config, fallback)?;
            format = negotiated_format(fallback, fmt.fourcc);
        }
    }
    let format = format.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            format!("driver negotiated unsupported format {}", fmt.fourcc),
        )
    })?;
    info!("Negotiated format: {}x{} {}", fmt.width, fmt.height, fmt.fourcc);

    // The frame rate request is advisory
    if config.fps > 0 {
        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            debug!("Frame rate request ignored: {}", e);
        }
    }
    Ok((fmt, format))
}

fn stream_loop(
    device: Arc<Device>,
    path: String,
    config: CaptureConfig,
    fallback: Option<PixelFormat>,
    outputs: SessionOutputs,
    events: DeviceEvents,
    control: Arc<SessionControl>,
) {
    let (fmt, format) = match configure(&device, &config, fallback) {
        Ok(configured) => configured,
        Err(e) => {
            events.send(DeviceEvent::SessionConfigureFailed(e.to_string()));
            return;
        }
    };
    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count) {
        Ok(stream) => stream,
        Err(e) => {
            events.send(DeviceEvent::SessionConfigureFailed(e.to_string()));
            return;
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);

    drop(control.handle.lock());
    let session = V4l2Session {
        control: Arc::clone(&control),
    };
    if !events.send(DeviceEvent::SessionConfigured(Box::new(session))) {
        return;
    }
    info!("Capture stream started with {} buffers", config.buffer_count);

    let mut sequence = 0u64;
    while !control.stop.load(Ordering::Acquire) {
        match stream.next() {
            Ok((buf, meta)) => {
                if !control.repeating.load(Ordering::Acquire) {
                    continue;
                }
                sequence += 1;
                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };
                let timestamp_ns =
                    meta.timestamp.sec as i64 * 1_000_000_000 + meta.timestamp.usec as i64 * 1_000;
                let frame = Frame::new(
                    Bytes::copy_from_slice(&buf[..used]),
                    FrameMetadata {
                        sequence,
                        width: fmt.width,
                        height: fmt.height,
                        stride: fmt.stride,
                        format,
                        timestamp_ns,
                    },
                );
                outputs.deliver(frame);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                if control.stop.load(Ordering::Acquire) {
                    break;
                }
                if e.raw_os_error() == Some(libc::ENODEV) {
                    warn!("Device {} removed", path);
                    events.send(DeviceEvent::Disconnected);
                } else {
                    error!("Dequeue failed: {}", e);
                    events.send(DeviceEvent::Error(error_code(&e)));
                }
                break;
            }
        }
    }
    debug!("V4L2 stream thread exiting");
}
