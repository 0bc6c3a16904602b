//! Transform boundary: per-frame processing off the capture thread
//!
//! Frames are copied on submission and handed to a small worker pool over a
//! bounded channel. Submission never blocks: when the queue is full the
//! frame is skipped for processing (it is still displayed). Completions may
//! arrive out of order; each result carries its source timestamp and older
//! results never replace newer ones.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::stats::Stats;
use crate::capture::{Frame, PixelFormat};
use crate::error::PipelineError;

/// Processing behaviour selected per invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Raw,
    #[default]
    Edge,
    Gray,
}

impl ProcessingMode {
    /// Integer flag passed across the transform boundary
    pub fn flag(self) -> i32 {
        match self {
            ProcessingMode::Raw => 0,
            ProcessingMode::Edge => 1,
            ProcessingMode::Gray => 2,
        }
    }

    pub fn from_flag(flag: i32) -> Option<Self> {
        match flag {
            0 => Some(ProcessingMode::Raw),
            1 => Some(ProcessingMode::Edge),
            2 => Some(ProcessingMode::Gray),
            _ => None,
        }
    }
}

/// Mode shared between the controller and the capture thread
#[derive(Debug, Default)]
pub struct ModeFlag(AtomicU8);

impl ModeFlag {
    pub fn new(mode: ProcessingMode) -> Self {
        Self(AtomicU8::new(mode.flag() as u8))
    }

    pub fn get(&self) -> ProcessingMode {
        ProcessingMode::from_flag(self.0.load(Ordering::Relaxed) as i32).unwrap_or_default()
    }

    pub fn set(&self, mode: ProcessingMode) {
        self.0.store(mode.flag() as u8, Ordering::Relaxed);
    }
}

/// Owned copy of a frame handed to a transform
#[derive(Debug, Clone)]
pub struct TransformInput {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub timestamp_ns: i64,
}

impl TransformInput {
    /// Copies the pixel bytes so the capture buffer can be released
    pub fn copy_from(frame: &Frame) -> Self {
        Self {
            data: Bytes::copy_from_slice(&frame.data),
            width: frame.meta.width,
            height: frame.meta.height,
            stride: frame.meta.stride,
            format: frame.meta.format,
            timestamp_ns: frame.meta.timestamp_ns,
        }
    }

    pub fn metadata(&self) -> crate::capture::FrameMetadata {
        crate::capture::FrameMetadata {
            sequence: 0,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            timestamp_ns: self.timestamp_ns,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including padding
    pub stride: u32,
    pub format: PixelFormat,
    /// Opaque result code from the transform
    pub code: i32,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unsupported input format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("{0}")]
    Failed(String),
}

impl From<TransformError> for PipelineError {
    fn from(e: TransformError) -> Self {
        PipelineError::TransformFailed(e.to_string())
    }
}

/// External per-frame processor
pub trait FrameTransform: Send + Sync {
    fn name(&self) -> &str;

    fn process(
        &self,
        input: &TransformInput,
        mode: ProcessingMode,
    ) -> Result<TransformOutput, TransformError>;
}

/// Completed transform tagged with its source frame
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub timestamp_ns: i64,
    pub mode: ProcessingMode,
    pub output: TransformOutput,
    /// Capture arrival to completion
    pub latency: Duration,
}

/// Most recent applied result; rejects anything older
///
/// Freshness is ordered by session epoch first, then by source timestamp,
/// since device timestamps restart with each capture session.
#[derive(Default)]
pub struct LatestResult {
    slot: Mutex<ResultSlot>,
}

#[derive(Default)]
struct ResultSlot {
    /// Epochs below this were drained
    floor: u64,
    current: Option<(u64, Arc<TransformResult>)>,
}

impl LatestResult {
    /// Applies `result` unless a newer frame's result is already in place
    pub fn offer(&self, epoch: u64, result: TransformResult) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        if epoch < slot.floor {
            return false;
        }
        if let Some((current_epoch, current)) = slot.current.as_ref() {
            if (epoch, result.timestamp_ns) < (*current_epoch, current.timestamp_ns) {
                return false;
            }
        }
        slot.current = Some((epoch, Arc::new(result)));
        true
    }

    pub fn latest(&self) -> Option<Arc<TransformResult>> {
        let slot = self.slot.lock().ok()?;
        slot.current.as_ref().map(|(_, result)| Arc::clone(result))
    }

    /// Drops results from `epoch` and earlier and refuses any that arrive later
    pub fn clear_through(&self, epoch: u64) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.floor = slot.floor.max(epoch + 1);
            if slot
                .current
                .as_ref()
                .is_some_and(|(current, _)| *current <= epoch)
            {
                slot.current = None;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 2,
        }
    }
}

/// Outcome of waiting for in-flight transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// Timed out; these jobs finish later and their results are discarded
    Abandoned { in_flight: usize },
}

struct Job {
    input: TransformInput,
    mode: ProcessingMode,
    epoch: u64,
    received_at: Instant,
}

struct Inner {
    transform: Arc<dyn FrameTransform>,
    mode: ModeFlag,
    /// Bumped on drain; jobs from older epochs are discarded
    epoch: AtomicU64,
    in_flight: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    results: LatestResult,
    stats: Arc<Stats>,
    failures: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn run(&self, job: Job) {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.transform.process(&job.input, job.mode)
        }));
        metrics::histogram!("transform_time_us").record(started.elapsed().as_micros() as f64);

        match outcome {
            Ok(Ok(output)) => {
                if job.epoch != self.epoch.load(Ordering::Acquire) {
                    debug!(ts = job.input.timestamp_ns, "Discarding result from drained session");
                    return;
                }
                let latency = job.received_at.elapsed();
                let applied = self.results.offer(
                    job.epoch,
                    TransformResult {
                        timestamp_ns: job.input.timestamp_ns,
                        mode: job.mode,
                        output,
                        latency,
                    },
                );
                if applied {
                    self.stats.record_latency(latency);
                } else {
                    debug!(ts = job.input.timestamp_ns, "Discarding stale transform result");
                }
            }
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(ts = job.input.timestamp_ns, "{}", PipelineError::from(e));
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    transform = self.transform.name(),
                    ts = job.input.timestamp_ns,
                    "Transform panicked"
                );
            }
        }
    }
}

pub struct TransformBoundary {
    inner: Arc<Inner>,
    tx: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TransformBoundary {
    pub fn new(
        transform: Arc<dyn FrameTransform>,
        mode: ProcessingMode,
        options: TransformOptions,
        stats: Arc<Stats>,
    ) -> Result<Self, PipelineError> {
        let inner = Arc::new(Inner {
            transform,
            mode: ModeFlag::new(mode),
            epoch: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            results: LatestResult::default(),
            stats,
            failures: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let (tx, rx) = flume::bounded::<Job>(options.queue_depth.max(1));

        let mut boundary = Self {
            inner: Arc::clone(&inner),
            tx: Some(tx),
            workers: Vec::with_capacity(options.workers),
        };
        for index in 0..options.workers.max(1) {
            let inner = Arc::clone(&inner);
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("edgeview-transform-{}", index))
                .spawn(move || {
                    for job in rx.iter() {
                        if job.epoch == inner.epoch.load(Ordering::Acquire) {
                            inner.run(job);
                        }
                        inner.finish_one();
                    }
                })
                .map_err(|e| PipelineError::TransformFailed(e.to_string()))?;
            boundary.workers.push(handle);
        }
        info!(
            transform = inner.transform.name(),
            workers = boundary.workers.len(),
            "Transform boundary ready"
        );
        Ok(boundary)
    }

    /// Copies the frame and queues it; never blocks the caller
    pub fn submit(&self, frame: &Frame) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let job = Job {
            input: TransformInput::copy_from(frame),
            mode: self.inner.mode.get(),
            epoch: self.inner.epoch.load(Ordering::Acquire),
            received_at: frame.received_at,
        };
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                self.inner.finish_one();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("transform_dropped").increment(1);
                false
            }
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.inner.mode.get()
    }

    /// Takes effect from the next submitted frame
    pub fn set_mode(&self, mode: ProcessingMode) {
        self.inner.mode.set(mode);
    }

    pub fn latest(&self) -> Option<Arc<TransformResult>> {
        self.inner.results.latest()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Invalidates outstanding work and waits up to `timeout` for it to finish
    pub fn drain(&self, timeout: Duration) -> DrainOutcome {
        let previous = self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.results.clear_through(previous);
        let deadline = Instant::now() + timeout;

        let Ok(mut guard) = self.inner.idle_lock.lock() else {
            return DrainOutcome::Abandoned {
                in_flight: self.in_flight(),
            };
        };
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                return DrainOutcome::Drained;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!(in_flight, "Abandoning in-flight transforms");
                return DrainOutcome::Abandoned { in_flight };
            };
            guard = match self.inner.idle.wait_timeout(guard, remaining) {
                Ok((guard, _)) => guard,
                Err(_) => return DrainOutcome::Abandoned { in_flight },
            };
        }
    }

    /// Closes the queue and joins the workers
    pub fn shutdown(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Transform worker panicked");
            }
        }
        debug!("Transform boundary shut down");
    }
}

impl Drop for TransformBoundary {
    fn drop(&mut self) {
        self.shutdown();
    }
}
