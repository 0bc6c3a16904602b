//! Side-buffer reader: a bounded ring of captured frames for CPU consumers

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::warn;

use super::frame::Frame;

type Notify = Box<dyn Fn() + Send + Sync>;

struct Shared {
    ring: Mutex<HeapRb<Frame>>,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_acquired: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Consumer end of the side buffer
///
/// Holds at most `depth` queued frames; the producer overwrites the oldest
/// when full. Only one acquired buffer may be outstanding at a time.
pub struct FrameReader {
    shared: Arc<Shared>,
}

/// Producer end, handed to a capture session as an output target
#[derive(Clone)]
pub struct FrameWriter {
    shared: Arc<Shared>,
}

/// A borrowed frame; dropping it releases the slot back to the reader
pub struct FrameBuffer {
    frame: Frame,
    shared: Arc<Shared>,
}

impl FrameReader {
    /// `notify` runs on the producer thread after every write
    pub fn new(depth: usize, notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(HeapRb::new(depth.max(1))),
                outstanding: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                notify: Box::new(notify),
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    pub fn writer(&self) -> FrameWriter {
        FrameWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Takes the newest queued frame, discarding older ones
    pub fn acquire_latest(&self) -> Option<FrameBuffer> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        if self.shared.outstanding.load(Ordering::Acquire) > 0 {
            warn!("Frame buffer still borrowed, skipping acquire");
            return None;
        }

        let latest = {
            let mut ring = self.shared.ring.lock().ok()?;
            let mut latest = None;
            while let Some(frame) = ring.try_pop() {
                if latest.replace(frame).is_some() {
                    self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            latest
        }?;

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.stats.frames_acquired.fetch_add(1, Ordering::Relaxed);
        Some(FrameBuffer {
            frame: latest,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Number of acquired buffers not yet released
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.shared
            .ring
            .lock()
            .map(|ring| ring.occupied_len())
            .unwrap_or(0)
    }

    /// Stops accepting frames and drops anything queued
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Ok(mut ring) = self.shared.ring.lock() {
            ring.clear();
        }
    }

    pub fn stats(&self) -> (usize, usize, usize) {
        let stats = &self.shared.stats;
        (
            stats.frames_written.load(Ordering::Relaxed),
            stats.frames_acquired.load(Ordering::Relaxed),
            stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl FrameWriter {
    /// Queues a frame; returns false once the reader is closed
    pub fn push(&self, frame: Frame) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let Ok(mut ring) = self.shared.ring.lock() else {
                return false;
            };
            if ring.push_overwrite(frame).is_some() {
                self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("reader_frames_dropped").increment(1);
            }
        }
        self.shared.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        (self.shared.notify)();
        true
    }
}

impl FrameBuffer {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Returns the buffer to the reader
    pub fn release(self) {}
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
