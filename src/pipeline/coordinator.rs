//! Pipeline coordinator
//!
//! Owns the frame source, the render loop and the transform boundary and
//! drives them through `Idle -> AwaitingSurface -> Starting -> Streaming ->
//! Stopping -> Idle`. Host lifecycle signals arrive through `&mut self`
//! methods; capture and render callbacks only touch the shared state block.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::stats::{Stats, StatsSnapshot};
use super::transform::{
    DrainOutcome, FrameTransform, ProcessingMode, TransformBoundary, TransformOptions,
    TransformResult,
};
use crate::capture::{CameraBackend, FrameSource, SourceEvent, SourceHandler, SourceOptions};
use crate::display::{PresentationTarget, RenderBackend, RenderHandle, RenderLoop, RenderOptions};
use crate::error::{Disposition, PipelineError};
use crate::orientation::{DisplayRotation, OrientationState, Rotation};
use crate::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    AwaitingSurface,
    Starting,
    Streaming,
    Stopping,
    Failed(PipelineError),
}

/// State without the failure payload, as exported in stats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStateKind {
    Idle,
    AwaitingSurface,
    Starting,
    Streaming,
    Stopping,
    Failed,
}

impl PipelineState {
    pub fn kind(&self) -> PipelineStateKind {
        match self {
            PipelineState::Idle => PipelineStateKind::Idle,
            PipelineState::AwaitingSurface => PipelineStateKind::AwaitingSurface,
            PipelineState::Starting => PipelineStateKind::Starting,
            PipelineState::Streaming => PipelineStateKind::Streaming,
            PipelineState::Stopping => PipelineStateKind::Stopping,
            PipelineState::Failed(_) => PipelineStateKind::Failed,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            PipelineState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// State touched from the capture worker and the render thread
struct Shared {
    state: Mutex<PipelineState>,
    last_error: Mutex<Option<PipelineError>>,
    /// Set on failure; the next delivered frame ends the capture stream
    halted: AtomicBool,
    stats: Arc<Stats>,
}

impl Shared {
    fn new(stats: Arc<Stats>) -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
            last_error: Mutex::new(None),
            halted: AtomicBool::new(false),
            stats,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> PipelineState {
        self.lock().clone()
    }

    fn set(&self, next: PipelineState) {
        let mut state = self.lock();
        if *state != next {
            info!(from = ?state.kind(), to = ?next.kind(), "Pipeline state");
        }
        *state = next;
    }

    /// Moves to `next` only if the current state passes `allowed`
    fn advance(&self, allowed: impl FnOnce(&PipelineState) -> bool, next: PipelineState) -> bool {
        let mut state = self.lock();
        if !allowed(&state) {
            return false;
        }
        info!(from = ?state.kind(), to = ?next.kind(), "Pipeline state");
        *state = next;
        true
    }

    fn record_error(&self, error: PipelineError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn last_error(&self) -> Option<PipelineError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fail(&self, error: PipelineError) {
        let error = error.into_failure();
        self.halted.store(true, Ordering::Release);
        self.record_error(error.clone());
        self.set(PipelineState::Failed(error));
    }

    /// Fatal errors reported while nothing is running are only recorded
    fn fail_active(&self, error: PipelineError) {
        if self.lock().kind() == PipelineStateKind::Idle {
            warn!("Fatal error while idle: {}", error);
            self.record_error(error.into_failure());
            return;
        }
        self.fail(error);
    }

    /// Mid-stream device loss; runs on the capture worker as it winds down
    fn device_lost(&self, error: PipelineError) {
        warn!("Capture device lost: {}", error);
        match error.disposition() {
            Disposition::Fatal => self.fail(error),
            _ => {
                self.record_error(error);
                self.advance(
                    |s| matches!(s, PipelineState::Starting | PipelineState::Streaming),
                    PipelineState::Idle,
                );
            }
        }
    }
}

fn source_handler(
    shared: Arc<Shared>,
    transform: Arc<TransformBoundary>,
    render: RenderHandle,
    drain_timeout: Duration,
) -> SourceHandler {
    Arc::new(move |event| {
        let lost = match event {
            SourceEvent::FrameDelivered(frame) => {
                if shared.halted.load(Ordering::Acquire) {
                    return ControlFlow::Break(());
                }
                shared.stats.record_frame(frame.width(), frame.height());
                transform.submit(frame);
                render.request_redraw();
                return ControlFlow::Continue(());
            }
            SourceEvent::DeviceLost => PipelineError::DeviceDisconnected,
            SourceEvent::DeviceError(code) => PipelineError::DeviceError(code),
        };
        shared.device_lost(lost);
        if let DrainOutcome::Abandoned { in_flight } = transform.drain(drain_timeout) {
            debug!(in_flight, "Late transform results will be discarded");
        }
        if let Err(e) = render.detach_source() {
            warn!("Surface detach after device loss failed: {}", e);
        }
        ControlFlow::Break(())
    })
}

/// Read-only view for stats consumers on other threads
#[derive(Clone)]
pub struct StatsReader {
    shared: Arc<Shared>,
    transform: Arc<TransformBoundary>,
}

impl StatsReader {
    pub fn snapshot(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.shared.state().kind())
    }

    pub fn latest_result(&self) -> Option<Arc<TransformResult>> {
        self.transform.latest()
    }

    pub fn mode(&self) -> ProcessingMode {
        self.transform.mode()
    }
}

pub struct Coordinator {
    config: Config,
    shared: Arc<Shared>,
    transform: Arc<TransformBoundary>,
    source: FrameSource,
    render: RenderLoop,
    surface: Option<PresentationTarget>,
    display: DisplayRotation,
    orientation: Option<OrientationState>,
    authorized: bool,
    foreground: bool,
}

impl Coordinator {
    /// Spawns the render thread and transform workers; nothing is opened yet
    ///
    /// `gpu` runs on the render thread and builds the GPU context there.
    #[instrument(skip_all, fields(backend = backend.name()))]
    pub fn new<F, G>(
        config: Config,
        backend: Arc<dyn CameraBackend>,
        gpu: F,
        transform: Arc<dyn FrameTransform>,
    ) -> Result<Self, PipelineError>
    where
        F: FnOnce() -> Result<G, PipelineError> + Send + 'static,
        G: RenderBackend + 'static,
    {
        let stats = Arc::new(Stats::new());
        let shared = Arc::new(Shared::new(Arc::clone(&stats)));

        let boundary = Arc::new(TransformBoundary::new(
            transform,
            config.transform.mode,
            TransformOptions {
                workers: config.transform.workers,
                queue_depth: config.transform.queue_depth,
            },
            Arc::clone(&stats),
        )?);

        let fatal = Arc::clone(&shared);
        let render = RenderLoop::spawn(
            gpu,
            RenderOptions {
                width: config.display.width,
                height: config.display.height,
                pin_core: config.display.render_core,
            },
            stats,
            move |e| {
                error!("Render failure: {}", e);
                fatal.fail_active(e);
            },
        )?;

        let drain_timeout = Duration::from_millis(config.pipeline.drain_timeout_ms);
        let handler = source_handler(
            Arc::clone(&shared),
            Arc::clone(&boundary),
            render.handle(),
            drain_timeout,
        );
        let source = FrameSource::new(
            backend,
            SourceOptions {
                reader_depth: config.capture.reader_depth,
                start_timeout: config.capture.start_timeout(),
            },
            handler,
        );

        Ok(Self {
            display: config.display.rotation,
            config,
            shared,
            transform: boundary,
            source,
            render,
            surface: None,
            orientation: None,
            authorized: false,
            foreground: true,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Most recent error, including mid-stream device loss that returned to `Idle`
    pub fn last_error(&self) -> Option<PipelineError> {
        self.shared.last_error()
    }

    pub fn total_rotation(&self) -> Option<Rotation> {
        self.orientation.map(|o| o.total)
    }

    pub fn surface(&self) -> Option<&PresentationTarget> {
        self.surface.as_ref()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.state().kind())
    }

    pub fn stats_reader(&self) -> StatsReader {
        StatsReader {
            shared: Arc::clone(&self.shared),
            transform: Arc::clone(&self.transform),
        }
    }

    pub fn latest_result(&self) -> Option<Arc<TransformResult>> {
        self.transform.latest()
    }

    pub fn mode(&self) -> ProcessingMode {
        self.transform.mode()
    }

    /// Switches processing mode for subsequent frames
    pub fn set_mode(&self, mode: ProcessingMode) {
        info!(?mode, "Processing mode changed");
        self.transform.set_mode(mode);
    }

    /// Creates the presentation surface on the render thread
    ///
    /// Reuses the live surface if one exists. Starts streaming right away if
    /// authorization was already granted.
    pub fn create_surface(&mut self) -> Result<(), PipelineError> {
        if self.surface.is_none() {
            match self.render.handle().create_surface() {
                Ok(target) => self.surface = Some(target),
                Err(e) => {
                    error!("Surface creation failed: {}", e);
                    self.shared.fail_active(e.clone());
                    return Err(e);
                }
            }
        }
        if self.shared.advance(
            |s| *s == PipelineState::Idle,
            PipelineState::AwaitingSurface,
        ) {
            return self.start_if_ready();
        }
        Ok(())
    }

    pub fn on_authorization_granted(&mut self) -> Result<(), PipelineError> {
        info!("Camera authorization granted");
        self.authorized = true;
        self.start_if_ready()
    }

    pub fn on_authorization_denied(&mut self) {
        warn!("Camera authorization denied");
        self.authorized = false;
        match self.state().kind() {
            PipelineStateKind::Idle | PipelineStateKind::Failed => {}
            PipelineStateKind::AwaitingSurface => self.shared.fail(PipelineError::AuthorizationDenied),
            _ => {
                self.shared.set(PipelineState::Stopping);
                self.teardown_stream();
                self.shared.fail(PipelineError::AuthorizationDenied);
            }
        }
    }

    pub fn on_foreground(&mut self) -> Result<(), PipelineError> {
        debug!("Host foregrounded");
        self.foreground = true;
        if self.surface.is_some()
            && self.shared.advance(
                |s| *s == PipelineState::Idle,
                PipelineState::AwaitingSurface,
            )
        {
            return self.start_if_ready();
        }
        Ok(())
    }

    pub fn on_background(&mut self) {
        debug!("Host backgrounded");
        self.foreground = false;
        if self.state().kind() != PipelineStateKind::Failed {
            self.stop();
        }
    }

    /// Returns to `Idle` from any state; a no-op when already idle
    pub fn stop(&mut self) {
        match self.state() {
            PipelineState::Idle => {
                // reaps a worker that ended on device loss
                self.source.stop();
            }
            PipelineState::Failed(e) => {
                debug!("Clearing failure: {}", e);
                self.teardown_stream();
                self.shared.set(PipelineState::Idle);
            }
            _ => {
                self.shared.set(PipelineState::Stopping);
                self.teardown_stream();
                self.shared.set(PipelineState::Idle);
            }
        }
    }

    /// Recomputes total rotation; the session is not reconfigured
    pub fn on_display_rotation_changed(&mut self, rotation: DisplayRotation) {
        self.display = rotation;
        let Some(orientation) = self.orientation else {
            return;
        };
        let orientation = orientation.with_display(rotation);
        info!(
            display = rotation.degrees(),
            total = orientation.total.degrees(),
            "Display rotation changed"
        );
        self.orientation = Some(orientation);
        if let Some(surface) = &self.surface {
            surface.set_rotation(orientation.total);
        }
        self.render.handle().request_redraw();
    }

    /// Viewport change followed by a redraw
    pub fn on_resize(&self, width: u32, height: u32) -> Result<(), PipelineError> {
        self.render.handle().resize(width, height)
    }

    /// Stops capture, then destroys the surface on the render thread
    pub fn release_surface(&mut self) -> Result<(), PipelineError> {
        self.stop();
        if self.surface.take().is_some() {
            self.render.handle().release_surface()?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Err(e) = self.release_surface() {
            warn!("Surface release during shutdown: {}", e);
        }
        self.render.shutdown();
    }

    fn start_if_ready(&mut self) -> Result<(), PipelineError> {
        if !self.authorized || !self.foreground {
            return Ok(());
        }
        if !self.shared.advance(
            |s| *s == PipelineState::AwaitingSurface,
            PipelineState::Starting,
        ) {
            return Ok(());
        }
        self.start_stream()
    }

    #[instrument(skip(self), fields(fps = self.config.capture.fps))]
    fn start_stream(&mut self) -> Result<(), PipelineError> {
        let Some(target) = self.surface.clone() else {
            self.shared.fail(PipelineError::NoSurface);
            return Err(PipelineError::NoSurface);
        };
        self.shared.halted.store(false, Ordering::Release);
        self.shared.stats.reset();

        match self
            .source
            .start(target, self.config.capture.fps, self.display)
        {
            Ok(info) => {
                self.orientation = Some(info.orientation);
                if self.shared.advance(
                    |s| *s == PipelineState::Starting,
                    PipelineState::Streaming,
                ) {
                    return Ok(());
                }
                let state = self.state();
                let error = state
                    .error()
                    .cloned()
                    .or_else(|| self.shared.last_error())
                    .unwrap_or(PipelineError::DeviceDisconnected);
                warn!("Stream ended while starting: {}", error);
                self.teardown_stream();
                Err(error)
            }
            Err(e) => {
                self.shared.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Capture first, then in-flight transforms, then the surface notification
    fn teardown_stream(&mut self) {
        self.source.stop();
        let timeout = Duration::from_millis(self.config.pipeline.drain_timeout_ms);
        match self.transform.drain(timeout) {
            DrainOutcome::Drained => debug!("Transforms drained"),
            DrainOutcome::Abandoned { in_flight } => {
                warn!(in_flight, "Transforms abandoned; late results discarded")
            }
        }
        if let Err(e) = self.render.handle().detach_source() {
            debug!("Detach after render exit: {}", e);
        }
        self.orientation = None;
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
