#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use edgeview::capture::{
    CameraBackend, CameraDevice, CaptureRequest, CaptureSession, DeviceEvent, DeviceEvents,
    DeviceId, Frame, FrameMetadata, PixelFormat, SessionOutputs,
};
use edgeview::display::{ClearColor, Quad, RenderBackend, TextureId};
use edgeview::pipeline::{FrameTransform, ProcessingMode, TransformError, TransformInput, TransformOutput};
use edgeview::{Config, PipelineError};

pub const RENDER_THREAD: &str = "edgeview-render";

pub fn thread_name() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_string()
}

/// Polls `condition` until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn rgba_frame(width: u32, height: u32, timestamp_ns: i64) -> Frame {
    Frame::new(
        Bytes::from(vec![200u8; (width * height * 4) as usize]),
        FrameMetadata::packed(0, width, height, PixelFormat::Rgba8, timestamp_ns),
    )
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.start_timeout_ms = 2000;
    config.pipeline.drain_timeout_ms = 200;
    config.transform.workers = 1;
    config.transform.queue_depth = 1;
    config
}

// ---------------------------------------------------------------------------
// Camera

#[derive(Debug, Clone, PartialEq)]
pub enum CameraCall {
    Open(DeviceId),
    CreateSession,
    SetRepeating(CaptureRequest),
    SessionClose,
    DeviceClose,
}

#[derive(Default)]
pub struct CameraLog {
    calls: Mutex<Vec<CameraCall>>,
    events: Mutex<Option<DeviceEvents>>,
    outputs: Mutex<Option<SessionOutputs>>,
}

impl CameraLog {
    fn record(&self, call: CameraCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<CameraCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&CameraCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    /// Pushes a frame into the active session's outputs, as the camera would
    pub fn deliver(&self, frame: Frame) -> bool {
        match &*self.outputs.lock().unwrap() {
            Some(outputs) => outputs.deliver(frame),
            None => false,
        }
    }

    pub fn disconnect(&self) {
        if let Some(events) = &*self.events.lock().unwrap() {
            events.send(DeviceEvent::Disconnected);
        }
    }

    pub fn error(&self, code: i32) {
        if let Some(events) = &*self.events.lock().unwrap() {
            events.send(DeviceEvent::Error(code));
        }
    }
}

#[derive(Clone)]
pub struct MockCamera {
    pub devices: Vec<DeviceId>,
    pub sensor_orientation: i32,
    pub session_failure: Option<String>,
    pub log: Arc<CameraLog>,
}

impl MockCamera {
    pub fn new(sensor_orientation: i32) -> Self {
        Self {
            devices: vec![DeviceId("mock:0".into())],
            sensor_orientation,
            session_failure: None,
            log: Arc::new(CameraLog::default()),
        }
    }

    pub fn without_devices() -> Self {
        Self {
            devices: Vec::new(),
            ..Self::new(90)
        }
    }

    pub fn failing_session(reason: &str) -> Self {
        Self {
            session_failure: Some(reason.into()),
            ..Self::new(90)
        }
    }
}

impl CameraBackend for MockCamera {
    fn name(&self) -> &str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<DeviceId>, PipelineError> {
        Ok(self.devices.clone())
    }

    fn open(&self, id: &DeviceId, events: DeviceEvents) -> Result<(), PipelineError> {
        self.log.record(CameraCall::Open(id.clone()));
        *self.log.events.lock().unwrap() = Some(events.clone());
        events.send(DeviceEvent::Opened(Box::new(MockDevice {
            id: id.clone(),
            camera: self.clone(),
        })));
        Ok(())
    }
}

struct MockDevice {
    id: DeviceId,
    camera: MockCamera,
}

impl CameraDevice for MockDevice {
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
        self.camera.log.record(CameraCall::CreateSession);
        match &self.camera.session_failure {
            Some(reason) => {
                events.send(DeviceEvent::SessionConfigureFailed(reason.clone()));
            }
            None => {
                *self.camera.log.outputs.lock().unwrap() = Some(outputs);
                events.send(DeviceEvent::SessionConfigured(Box::new(MockSession {
                    log: Arc::clone(&self.camera.log),
                })));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.camera.log.record(CameraCall::DeviceClose);
    }
}

struct MockSession {
    log: Arc<CameraLog>,
}

impl CaptureSession for MockSession {
    fn set_repeating_request(&mut self, request: CaptureRequest) -> Result<(), PipelineError> {
        self.log.record(CameraCall::SetRepeating(request));
        Ok(())
    }

    fn close(&mut self) {
        self.log.outputs.lock().unwrap().take();
        self.log.record(CameraCall::SessionClose);
    }
}

// ---------------------------------------------------------------------------
// GPU

#[derive(Debug, Clone, PartialEq)]
pub enum GpuOp {
    CreateTexture(TextureId),
    Import { texture: TextureId, width: u32, height: u32, timestamp_ns: i64 },
    Resize(u32, u32),
    Clear(ClearColor),
    Draw { texture: TextureId, quad: Quad },
    Release(TextureId),
}

#[derive(Debug, Clone)]
pub struct GpuCall {
    pub op: GpuOp,
    pub thread: String,
}

#[derive(Default)]
pub struct GpuLog {
    calls: Mutex<Vec<GpuCall>>,
    pub fail_import: AtomicBool,
}

impl GpuLog {
    fn record(&self, op: GpuOp) {
        self.calls.lock().unwrap().push(GpuCall {
            op,
            thread: thread_name(),
        });
    }

    pub fn calls(&self) -> Vec<GpuCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<GpuOp> {
        self.calls().into_iter().map(|c| c.op).collect()
    }

    pub fn count(&self, matches: impl Fn(&GpuOp) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(&c.op)).count()
    }

    pub fn draws(&self) -> usize {
        self.count(|op| matches!(op, GpuOp::Draw { .. }))
    }

    pub fn textures_created(&self) -> usize {
        self.count(|op| matches!(op, GpuOp::CreateTexture(_)))
    }

    pub fn last_draw(&self) -> Option<Quad> {
        self.ops().into_iter().rev().find_map(|op| match op {
            GpuOp::Draw { quad, .. } => Some(quad),
            _ => None,
        })
    }
}

pub struct RecordingGpu {
    log: Arc<GpuLog>,
    next_texture: AtomicU32,
}

impl RecordingGpu {
    pub fn new(log: Arc<GpuLog>) -> Self {
        Self {
            log,
            next_texture: AtomicU32::new(1),
        }
    }

    pub fn factory(log: &Arc<GpuLog>) -> impl FnOnce() -> Result<RecordingGpu, PipelineError> + Send + 'static {
        let log = Arc::clone(log);
        move || Ok(RecordingGpu::new(log))
    }
}

impl RenderBackend for RecordingGpu {
    fn create_external_texture(&mut self) -> Result<TextureId, PipelineError> {
        let id = TextureId(self.next_texture.fetch_add(1, Ordering::Relaxed));
        self.log.record(GpuOp::CreateTexture(id));
        Ok(id)
    }

    fn import(&mut self, texture: TextureId, frame: &Frame) -> Result<(), PipelineError> {
        if self.log.fail_import.load(Ordering::Acquire) {
            return Err(PipelineError::GpuImportFailed("injected".into()));
        }
        self.log.record(GpuOp::Import {
            texture,
            width: frame.width(),
            height: frame.height(),
            timestamp_ns: frame.timestamp_ns(),
        });
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.log.record(GpuOp::Resize(width, height));
    }

    fn clear(&mut self, color: ClearColor) {
        self.log.record(GpuOp::Clear(color));
    }

    fn draw_quad(&mut self, texture: TextureId, quad: &Quad) -> Result<(), PipelineError> {
        self.log.record(GpuOp::Draw {
            texture,
            quad: *quad,
        });
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.log.record(GpuOp::Release(texture));
    }
}

// ---------------------------------------------------------------------------
// Transforms

/// Echoes its input and records each invocation
#[derive(Default)]
pub struct EchoTransform {
    pub calls: Mutex<Vec<(i64, ProcessingMode, String)>>,
}

impl FrameTransform for EchoTransform {
    fn name(&self) -> &str {
        "echo"
    }

    fn process(
        &self,
        input: &TransformInput,
        mode: ProcessingMode,
    ) -> Result<TransformOutput, TransformError> {
        self.calls
            .lock()
            .unwrap()
            .push((input.timestamp_ns, mode, thread_name()));
        Ok(output(input, mode))
    }
}

fn output(input: &TransformInput, mode: ProcessingMode) -> TransformOutput {
    TransformOutput {
        data: input.data.clone(),
        width: input.width,
        height: input.height,
        stride: input.stride,
        format: input.format,
        code: mode.flag(),
    }
}

/// Sleeps before echoing
pub struct SlowTransform {
    pub delay: Duration,
    pub started: AtomicUsize,
}

impl SlowTransform {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: AtomicUsize::new(0),
        }
    }
}

impl FrameTransform for SlowTransform {
    fn name(&self) -> &str {
        "slow"
    }

    fn process(
        &self,
        input: &TransformInput,
        mode: ProcessingMode,
    ) -> Result<TransformOutput, TransformError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        Ok(output(input, mode))
    }
}

/// Blocks each invocation until the test opens the gate for its timestamp
#[derive(Default)]
pub struct GatedTransform {
    gates: Mutex<HashMap<i64, flume::Receiver<()>>>,
    openers: Mutex<HashMap<i64, flume::Sender<()>>>,
    pub entered: AtomicUsize,
}

impl GatedTransform {
    pub fn with_gates(timestamps: &[i64]) -> Self {
        let gated = Self::default();
        for &ts in timestamps {
            let (tx, rx) = flume::bounded(1);
            gated.gates.lock().unwrap().insert(ts, rx);
            gated.openers.lock().unwrap().insert(ts, tx);
        }
        gated
    }

    pub fn open(&self, timestamp_ns: i64) {
        if let Some(tx) = self.openers.lock().unwrap().remove(&timestamp_ns) {
            let _ = tx.send(());
        }
    }

    pub fn open_all(&self) {
        for (_, tx) in self.openers.lock().unwrap().drain() {
            let _ = tx.send(());
        }
    }
}

impl FrameTransform for GatedTransform {
    fn name(&self) -> &str {
        "gated"
    }

    fn process(
        &self,
        input: &TransformInput,
        mode: ProcessingMode,
    ) -> Result<TransformOutput, TransformError> {
        let gate = self.gates.lock().unwrap().remove(&input.timestamp_ns);
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        Ok(output(input, mode))
    }
}

/// Fails every invocation, or panics if `panic` is set
pub struct BrokenTransform {
    pub panic: bool,
    pub calls: AtomicUsize,
}

impl FrameTransform for BrokenTransform {
    fn name(&self) -> &str {
        "broken"
    }

    fn process(
        &self,
        _input: &TransformInput,
        _mode: ProcessingMode,
    ) -> Result<TransformOutput, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("transform blew up");
        }
        Err(TransformError::Failed("always fails".into()))
    }
}
