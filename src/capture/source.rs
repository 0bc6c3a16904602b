//! Frame source: owns the camera device and capture session
//!
//! All device and session state lives on a dedicated worker thread. Backend
//! callbacks and side-buffer notifications are funnelled into that thread,
//! so the device handle and session are never touched concurrently.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::device::{
    CameraBackend, CameraDevice, CaptureRequest, CaptureSession, DeviceEvent, DeviceEvents,
    DeviceId, SessionOutputs,
};
use super::frame::Frame;
use super::reader::FrameReader;
use crate::display::PresentationTarget;
use crate::error::{device_codes, PipelineError};
use crate::orientation::{DisplayRotation, OrientationState};

/// Events emitted from the capture callback context
///
/// `FrameDelivered` lends the frame for the duration of the call only; the
/// buffer is released as soon as the handler returns. Returning
/// `ControlFlow::Break` from a frame event ends the stream from inside the
/// worker.
#[derive(Debug)]
pub enum SourceEvent<'a> {
    FrameDelivered(&'a Frame),
    DeviceLost,
    DeviceError(i32),
}

pub type SourceHandler = Arc<dyn Fn(SourceEvent<'_>) -> ControlFlow<()> + Send + Sync>;

/// Result of a successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub device: DeviceId,
    pub orientation: OrientationState,
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub reader_depth: usize,
    pub start_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            reader_depth: 2,
            start_timeout: Duration::from_secs(5),
        }
    }
}

enum Control {
    FrameAvailable,
    Stop,
}

enum Next {
    Control(Control),
    Device(DeviceEvent),
}

struct Worker {
    control: flume::Sender<Control>,
    handle: JoinHandle<()>,
    target: PresentationTarget,
}

pub struct FrameSource {
    backend: Arc<dyn CameraBackend>,
    options: SourceOptions,
    handler: SourceHandler,
    worker: Option<Worker>,
}

impl FrameSource {
    pub fn new(backend: Arc<dyn CameraBackend>, options: SourceOptions, handler: SourceHandler) -> Self {
        Self {
            backend,
            options,
            handler,
            worker: None,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// True while a worker exists and has not exited on its own
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Opens the first available device and streams into `target`
    ///
    /// Blocks until the repeating request is active or the start fails.
    #[instrument(skip(self, target), fields(backend = self.backend.name()))]
    pub fn start(
        &mut self,
        target: PresentationTarget,
        desired_fps: u32,
        display_rotation: DisplayRotation,
    ) -> Result<StreamInfo, PipelineError> {
        self.stop();

        let device_id = self
            .backend
            .enumerate()?
            .into_iter()
            .next()
            .ok_or(PipelineError::NoDeviceAvailable)?;
        info!(device = %device_id, "Selected capture device");

        target.bind_producer()?;

        let (control_tx, control_rx) = flume::unbounded();
        let (device_tx, device_rx) = flume::unbounded::<DeviceEvent>();
        let (ready_tx, ready_rx) = flume::bounded(1);

        let notify_tx = control_tx.clone();
        let reader = FrameReader::new(self.options.reader_depth, move || {
            let _ = notify_tx.send(Control::FrameAvailable);
        });
        let events = DeviceEvents::new(move |event| {
            device_tx.send(event).map_err(|flume::SendError(event)| event)
        });

        let state = WorkerState {
            control: control_rx,
            device_events: device_rx,
            events: events.clone(),
            target: target.clone(),
            reader,
            display: display_rotation,
            desired_fps,
            phase: Phase::Opening,
            device: None,
            session: None,
            request: CaptureRequest::preview(desired_fps),
            orientation: None,
            ready: Some(ready_tx),
            handler: Arc::clone(&self.handler),
        };

        let handle = match thread::Builder::new()
            .name("edgeview-camera".into())
            .spawn(move || state.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn camera worker: {}", e);
                target.unbind_producer();
                return Err(PipelineError::DeviceError(device_codes::CAMERA_SERVICE));
            }
        };
        self.worker = Some(Worker {
            control: control_tx,
            handle,
            target,
        });

        if let Err(e) = self.backend.open(&device_id, events) {
            error!(device = %device_id, "Failed to open device: {}", e);
            self.stop();
            return Err(e);
        }

        let outcome = match ready_rx.recv_timeout(self.options.start_timeout) {
            Ok(outcome) => outcome,
            Err(flume::RecvTimeoutError::Timeout) => Err(PipelineError::StartTimedOut),
            Err(flume::RecvTimeoutError::Disconnected) => {
                Err(PipelineError::DeviceError(device_codes::CAMERA_SERVICE))
            }
        };
        match outcome {
            Ok(info) => {
                info!(
                    device = %info.device,
                    rotation = info.orientation.total.degrees(),
                    "Capture streaming"
                );
                Ok(info)
            }
            Err(e) => {
                warn!("Capture start failed: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    /// Tears down session, device, reader and worker, in that order
    ///
    /// Idempotent. Must not be called from a `SourceEvent` handler.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        debug!("Stopping frame source");
        let _ = worker.control.send(Control::Stop);
        if worker.handle.join().is_err() {
            error!("Camera worker panicked");
        }
        worker.target.unbind_producer();
        info!("Frame source stopped");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Configuring,
    Streaming,
}

struct WorkerState {
    control: flume::Receiver<Control>,
    device_events: flume::Receiver<DeviceEvent>,
    events: DeviceEvents,
    target: PresentationTarget,
    reader: FrameReader,
    display: DisplayRotation,
    desired_fps: u32,
    phase: Phase,
    device: Option<Box<dyn CameraDevice>>,
    session: Option<Box<dyn CaptureSession>>,
    request: CaptureRequest,
    orientation: Option<OrientationState>,
    ready: Option<flume::Sender<Result<StreamInfo, PipelineError>>>,
    handler: SourceHandler,
}

impl WorkerState {
    fn run(mut self) {
        debug!("Camera worker started");
        loop {
            let next = flume::Selector::new()
                .recv(&self.control, |msg| msg.map(Next::Control))
                .recv(&self.device_events, |event| event.map(Next::Device))
                .wait();

            let keep_running = match next {
                Ok(Next::Control(Control::FrameAvailable)) => self.on_frame_available(),
                Ok(Next::Device(event)) => self.on_device_event(event),
                Ok(Next::Control(Control::Stop)) | Err(_) => false,
            };
            if !keep_running {
                break;
            }
        }
        self.teardown();
        debug!("Camera worker exiting");
    }

    fn on_device_event(&mut self, event: DeviceEvent) -> bool {
        debug!(?event, phase = ?self.phase, "Device event");
        match event {
            DeviceEvent::Opened(mut device) => {
                if self.phase != Phase::Opening {
                    warn!("Unexpected device open, closing it");
                    device.close();
                    return true;
                }
                let orientation = OrientationState::new(device.sensor_orientation(), self.display);
                info!(
                    sensor = orientation.sensor_mount_angle,
                    display = orientation.display.degrees(),
                    total = orientation.total.degrees(),
                    "Device opened"
                );
                self.orientation = Some(orientation);
                self.target.set_rotation(orientation.total);

                let outputs = SessionOutputs {
                    display: self.target.clone(),
                    reader: self.reader.writer(),
                };
                let result = device.create_session(outputs, self.events.clone());
                self.device = Some(device);
                match result {
                    Ok(()) => {
                        self.phase = Phase::Configuring;
                        true
                    }
                    Err(e) => {
                        self.fail_start(session_failure(e));
                        false
                    }
                }
            }
            DeviceEvent::SessionConfigured(mut session) => {
                if self.phase != Phase::Configuring {
                    warn!("Unexpected session, closing it");
                    session.close();
                    return true;
                }
                if let Some((min, max)) = self.request.fps_range {
                    debug!(min, max, fps = self.desired_fps, "Requesting frame rate");
                }
                if let Err(e) = session.set_repeating_request(self.request.clone()) {
                    session.close();
                    self.fail_start(session_failure(e));
                    return false;
                }
                self.session = Some(session);
                self.phase = Phase::Streaming;

                let (Some(device), Some(orientation)) = (&self.device, self.orientation) else {
                    return true;
                };
                let info = StreamInfo {
                    device: device.id().clone(),
                    orientation,
                };
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(info));
                }
                true
            }
            DeviceEvent::SessionConfigureFailed(reason) => {
                error!("Session configuration failed: {}", reason);
                self.fail_start(PipelineError::SessionConfigFailed(reason));
                false
            }
            DeviceEvent::Disconnected => {
                warn!("Camera disconnected");
                if self.phase == Phase::Streaming {
                    let _ = (self.handler)(SourceEvent::DeviceLost);
                } else {
                    self.fail_start(PipelineError::DeviceDisconnected);
                }
                false
            }
            DeviceEvent::Error(code) => {
                error!(code, "Camera error");
                if self.phase == Phase::Streaming {
                    let _ = (self.handler)(SourceEvent::DeviceError(code));
                } else {
                    self.fail_start(PipelineError::DeviceError(code));
                }
                false
            }
        }
    }

    fn on_frame_available(&mut self) -> bool {
        let Some(buffer) = self.reader.acquire_latest() else {
            return true;
        };
        let flow = if self.phase == Phase::Streaming {
            (self.handler)(SourceEvent::FrameDelivered(buffer.frame()))
        } else {
            ControlFlow::Continue(())
        };
        buffer.release();
        if flow.is_break() {
            info!("Frame handler ended the stream");
        }
        flow.is_continue()
    }

    fn fail_start(&mut self, error: PipelineError) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error));
        }
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.reader.close();
        self.target.unbind_producer();
        self.fail_start(PipelineError::DeviceDisconnected);
    }
}

fn session_failure(error: PipelineError) -> PipelineError {
    match error {
        e @ PipelineError::SessionConfigFailed(_) => e,
        other => PipelineError::SessionConfigFailed(other.to_string()),
    }
}
