//! Demand-driven render loop on a dedicated GPU thread
//!
//! Every GPU call happens on the thread spawned here. Other threads talk to
//! it through [`RenderHandle`], which only sends messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::quad::Quad;
use super::surface::{PresentationTarget, TextureId};
use crate::capture::Frame;
use crate::error::{Disposition, PipelineError};
use crate::pipeline::stats::{FpsCounter, Stats};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

impl ClearColor {
    pub const BLACK: ClearColor = ClearColor { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };
    /// Shown when the external texture cannot be imported
    pub const ERROR: ClearColor = ClearColor { r: 1.0, g: 0.0, b: 0.0, a: 1.0 };
}

/// GPU operations the render loop needs
///
/// Implementations are created on, and only ever used from, the render
/// thread, so they need not be `Send`.
pub trait RenderBackend {
    fn create_external_texture(&mut self) -> Result<TextureId, PipelineError>;

    /// Latches `frame` into the external texture
    fn import(&mut self, texture: TextureId, frame: &Frame) -> Result<(), PipelineError>;

    fn resize(&mut self, width: u32, height: u32);

    fn clear(&mut self, color: ClearColor);

    /// One triangle-strip draw of `quad` sampling `texture`
    fn draw_quad(&mut self, texture: TextureId, quad: &Quad) -> Result<(), PipelineError>;

    fn release_texture(&mut self, texture: TextureId);
}

/// What a single `draw_frame` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Drawn,
    NoSurface,
    NoContent,
    ImportFailed,
    ContextLost,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    /// CPU core to pin the render thread to
    pub pin_core: Option<usize>,
}

enum RenderCommand {
    CreateSurface(flume::Sender<Result<PresentationTarget, PipelineError>>),
    Redraw,
    Resize { width: u32, height: u32 },
    DetachSource,
    ReleaseSurface(flume::Sender<()>),
    Shutdown,
}

/// Cloneable, thread-safe handle to the render thread
#[derive(Clone)]
pub struct RenderHandle {
    tx: flume::Sender<RenderCommand>,
    redraw_pending: Arc<AtomicBool>,
}

impl RenderHandle {
    fn send(&self, command: RenderCommand) -> Result<(), PipelineError> {
        self.tx
            .send(command)
            .map_err(|_| PipelineError::RenderThreadGone)
    }

    /// Schedules a redraw; coalesces with one already queued
    pub fn request_redraw(&self) {
        if !self.redraw_pending.swap(true, Ordering::AcqRel)
            && self.send(RenderCommand::Redraw).is_err()
        {
            self.redraw_pending.store(false, Ordering::Release);
        }
    }

    /// Creates the external texture, or returns the live one
    pub fn create_surface(&self) -> Result<PresentationTarget, PipelineError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.send(RenderCommand::CreateSurface(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| PipelineError::RenderThreadGone)?
    }

    pub fn resize(&self, width: u32, height: u32) -> Result<(), PipelineError> {
        self.send(RenderCommand::Resize { width, height })
    }

    /// Tells the render thread the capture stream no longer targets the surface
    pub fn detach_source(&self) -> Result<(), PipelineError> {
        self.send(RenderCommand::DetachSource)
    }

    /// Destroys the external texture; blocks until done
    pub fn release_surface(&self) -> Result<(), PipelineError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.send(RenderCommand::ReleaseSurface(reply_tx))?;
        reply_rx.recv().map_err(|_| PipelineError::RenderThreadGone)
    }
}

/// Owner of the render thread
pub struct RenderLoop {
    handle: RenderHandle,
    thread: Option<JoinHandle<()>>,
}

impl RenderLoop {
    /// Spawns the render thread; `factory` builds the GPU context on it
    pub fn spawn<F, G>(
        factory: F,
        options: RenderOptions,
        stats: Arc<Stats>,
        on_fatal: impl Fn(PipelineError) + Send + 'static,
    ) -> Result<Self, PipelineError>
    where
        F: FnOnce() -> Result<G, PipelineError> + Send + 'static,
        G: RenderBackend + 'static,
    {
        let (tx, rx) = flume::unbounded();
        let redraw_pending = Arc::new(AtomicBool::new(false));
        let pending = Arc::clone(&redraw_pending);

        let thread = thread::Builder::new()
            .name("edgeview-render".into())
            .spawn(move || {
                if let Some(id) = options.pin_core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(core = id, "Failed to pin render thread");
                    }
                }
                match factory() {
                    Ok(gpu) => {
                        info!("Render thread ready");
                        let state = RenderState {
                            gpu,
                            surface: None,
                            fps: FpsCounter::new(Instant::now()),
                            stats,
                            on_fatal: Box::new(on_fatal),
                        };
                        state.run(rx, pending, options.width, options.height);
                    }
                    Err(e) => {
                        error!("GPU context creation failed: {}", e);
                        on_fatal(e.clone());
                        run_without_context(rx, e);
                    }
                }
                debug!("Render thread exiting");
            })
            .map_err(|e| PipelineError::GpuContext(e.to_string()))?;

        Ok(Self {
            handle: RenderHandle { tx, redraw_pending },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RenderHandle {
        self.handle.clone()
    }

    /// Releases the surface and joins the render thread
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.handle.send(RenderCommand::Shutdown);
        if thread.join().is_err() {
            error!("Render thread panicked");
        }
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps answering requests after context creation failed
fn run_without_context(rx: flume::Receiver<RenderCommand>, error: PipelineError) {
    for command in rx.iter() {
        match command {
            RenderCommand::CreateSurface(reply) => {
                let _ = reply.send(Err(error.clone()));
            }
            RenderCommand::ReleaseSurface(reply) => {
                let _ = reply.send(());
            }
            RenderCommand::Shutdown => break,
            _ => {}
        }
    }
}

struct SurfaceSlot {
    texture: TextureId,
    target: PresentationTarget,
    /// Size of the last successfully imported content
    content: Option<(u32, u32)>,
}

struct RenderState<G: RenderBackend> {
    gpu: G,
    surface: Option<SurfaceSlot>,
    fps: FpsCounter,
    stats: Arc<Stats>,
    on_fatal: Box<dyn Fn(PipelineError) + Send>,
}

impl<G: RenderBackend> RenderState<G> {
    fn run(
        mut self,
        rx: flume::Receiver<RenderCommand>,
        redraw_pending: Arc<AtomicBool>,
        width: u32,
        height: u32,
    ) {
        self.gpu.resize(width, height);
        for command in rx.iter() {
            match command {
                RenderCommand::CreateSurface(reply) => {
                    let _ = reply.send(self.create_surface());
                }
                RenderCommand::Redraw => {
                    redraw_pending.store(false, Ordering::Release);
                    self.draw_frame();
                }
                RenderCommand::Resize { width, height } => {
                    debug!(width, height, "Viewport resized");
                    self.gpu.resize(width, height);
                    self.draw_frame();
                }
                RenderCommand::DetachSource => {
                    if let Some(surface) = &self.surface {
                        surface.target.take_pending();
                        debug!("Capture source detached");
                    }
                }
                RenderCommand::ReleaseSurface(reply) => {
                    self.release_surface();
                    let _ = reply.send(());
                }
                RenderCommand::Shutdown => break,
            }
        }
        self.release_surface();
    }

    fn create_surface(&mut self) -> Result<PresentationTarget, PipelineError> {
        if let Some(surface) = &self.surface {
            return Ok(surface.target.clone());
        }
        let texture = self.gpu.create_external_texture()?;
        let target = PresentationTarget::new(texture);
        info!(texture = texture.0, "Presentation surface created");
        self.surface = Some(SurfaceSlot {
            texture,
            target: target.clone(),
            content: None,
        });
        Ok(target)
    }

    fn release_surface(&mut self) {
        if let Some(surface) = self.surface.take() {
            if surface.target.has_producer() {
                warn!("Releasing surface while a capture stream still targets it");
            }
            surface.target.mark_released();
            self.gpu.release_texture(surface.texture);
            info!(texture = surface.texture.0, "Presentation surface released");
        }
    }

    fn draw_frame(&mut self) -> DrawOutcome {
        let started = Instant::now();
        self.gpu.clear(ClearColor::BLACK);

        let Some(surface) = self.surface.as_mut() else {
            self.gpu.clear(ClearColor::ERROR);
            return DrawOutcome::NoSurface;
        };

        if surface.target.take_pending() {
            if let Some(frame) = surface.target.latest() {
                match self.gpu.import(surface.texture, &frame) {
                    Ok(()) => surface.content = Some((frame.width(), frame.height())),
                    Err(e) if e.disposition() == Disposition::Recover => {
                        debug!("Texture import failed: {}", e);
                        self.gpu.clear(ClearColor::ERROR);
                        return DrawOutcome::ImportFailed;
                    }
                    Err(e) => {
                        error!("GPU context lost during import: {}", e);
                        (self.on_fatal)(e);
                        return DrawOutcome::ContextLost;
                    }
                }
            }
        }

        if surface.content.is_none() {
            return DrawOutcome::NoContent;
        }

        if let Err(e) = self
            .gpu
            .draw_quad(surface.texture, &Quad::full_screen(surface.target.rotation()))
        {
            error!("Draw failed: {}", e);
            (self.on_fatal)(e);
            return DrawOutcome::ContextLost;
        }

        metrics::histogram!("render_time_us").record(started.elapsed().as_micros() as f64);
        if let Some(fps) = self.fps.record(Instant::now()) {
            debug!(fps, "Display rate");
            self.stats.set_fps(fps);
        }
        DrawOutcome::Drawn
    }
}
