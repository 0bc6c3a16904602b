//! Camera backend capabilities
//!
//! A backend owns the platform camera stack. Opening a device and
//! configuring a session are asynchronous: the backend reports the outcome
//! through [`DeviceEvents`], which lands on the frame source worker.

use std::fmt;

use super::frame::Frame;
use super::reader::FrameWriter;
use crate::display::PresentationTarget;
use crate::error::PipelineError;

/// Stable identifier of a physical camera
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
}

/// Repeating capture request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub template: RequestTemplate,
    /// Advisory target frame-rate range; devices may ignore it
    pub fps_range: Option<(u32, u32)>,
    pub auto_control: bool,
}

impl CaptureRequest {
    pub fn preview(desired_fps: u32) -> Self {
        Self {
            template: RequestTemplate::Preview,
            fps_range: (desired_fps > 0).then_some((desired_fps, desired_fps)),
            auto_control: true,
        }
    }
}

/// Output targets of a capture session: the display surface and the side buffer
#[derive(Clone)]
pub struct SessionOutputs {
    pub display: PresentationTarget,
    pub reader: FrameWriter,
}

impl SessionOutputs {
    /// Hands one captured frame to every target
    ///
    /// The display target receives a reference to the same bytes; nothing is
    /// copied here.
    pub fn deliver(&self, frame: Frame) -> bool {
        let displayed = self.display.push(&frame);
        let queued = self.reader.push(frame);
        displayed || queued
    }
}

/// Asynchronous notifications from a backend
pub enum DeviceEvent {
    Opened(Box<dyn CameraDevice>),
    Disconnected,
    Error(i32),
    SessionConfigured(Box<dyn CaptureSession>),
    SessionConfigureFailed(String),
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Opened(device) => write!(f, "Opened({})", device.id()),
            DeviceEvent::Disconnected => f.write_str("Disconnected"),
            DeviceEvent::Error(code) => write!(f, "Error({code})"),
            DeviceEvent::SessionConfigured(_) => f.write_str("SessionConfigured"),
            DeviceEvent::SessionConfigureFailed(reason) => {
                write!(f, "SessionConfigureFailed({reason})")
            }
        }
    }
}

/// Sink for backend events
///
/// Events sent after the receiving worker has shut down are not lost
/// silently: devices and sessions carried by them are closed here.
#[derive(Clone)]
pub struct DeviceEvents {
    send: std::sync::Arc<dyn Fn(DeviceEvent) -> Result<(), DeviceEvent> + Send + Sync>,
}

impl DeviceEvents {
    pub fn new(send: impl Fn(DeviceEvent) -> Result<(), DeviceEvent> + Send + Sync + 'static) -> Self {
        Self {
            send: std::sync::Arc::new(send),
        }
    }

    /// Returns false when nobody is listening anymore
    pub fn send(&self, event: DeviceEvent) -> bool {
        match (self.send)(event) {
            Ok(()) => true,
            Err(DeviceEvent::Opened(mut device)) => {
                device.close();
                false
            }
            Err(DeviceEvent::SessionConfigured(mut session)) => {
                session.close();
                false
            }
            Err(_) => false,
        }
    }
}

/// Entry point into a camera stack
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Devices in a stable order; the first one is preferred
    fn enumerate(&self) -> Result<Vec<DeviceId>, PipelineError>;

    /// Starts opening a device; completion arrives as `DeviceEvent::Opened`
    /// or `DeviceEvent::Error`
    fn open(&self, id: &DeviceId, events: DeviceEvents) -> Result<(), PipelineError>;
}

/// An open device handle
pub trait CameraDevice: Send {
    fn id(&self) -> &DeviceId;

    /// Fixed clockwise mounting angle of the sensor in degrees
    fn sensor_orientation(&self) -> i32;

    /// Starts configuring a session; completion arrives as
    /// `DeviceEvent::SessionConfigured` or `DeviceEvent::SessionConfigureFailed`
    fn create_session(&mut self, outputs: SessionOutputs, events: DeviceEvents)
        -> Result<(), PipelineError>;

    /// Idempotent
    fn close(&mut self);
}

/// A configured capture session
pub trait CaptureSession: Send {
    /// Replaces the repeating request; frames flow to the outputs afterwards
    fn set_repeating_request(&mut self, request: CaptureRequest) -> Result<(), PipelineError>;

    /// Stops delivery; no output receives a frame after this returns
    fn close(&mut self);
}
