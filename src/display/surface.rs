//! External texture and the presentation target handed to capture

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::Frame;
use crate::error::PipelineError;
use crate::orientation::Rotation;

/// GPU-side texture name owned by the render thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

struct ExternalTexture {
    id: TextureId,
    /// Content latch: set by the producer, cleared by the render thread
    pending: AtomicBool,
    content: ArcSwapOption<Frame>,
    /// Quarter turns applied when presenting the content
    rotation: AtomicU8,
    producer_bound: AtomicBool,
    released: AtomicBool,
    frames_received: AtomicU64,
}

/// Opaque capture target backed by an external texture
///
/// Created on the render thread and passed by handle to the frame source.
/// Producers write frames into it without copying pixel data; the render
/// thread imports the latest content when the latch is set.
#[derive(Clone)]
pub struct PresentationTarget {
    inner: Arc<ExternalTexture>,
}

impl PresentationTarget {
    pub(crate) fn new(id: TextureId) -> Self {
        Self {
            inner: Arc::new(ExternalTexture {
                id,
                pending: AtomicBool::new(false),
                content: ArcSwapOption::empty(),
                rotation: AtomicU8::new(0),
                producer_bound: AtomicBool::new(false),
                released: AtomicBool::new(false),
                frames_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn texture_id(&self) -> TextureId {
        self.inner.id
    }

    /// Producer side: replaces the content and raises the latch
    ///
    /// Safe from any thread, never touches the GPU. Returns false once the
    /// target has been released.
    pub fn push(&self, frame: &Frame) -> bool {
        if self.inner.released.load(Ordering::Acquire) {
            return false;
        }
        self.inner.content.store(Some(Arc::new(frame.clone())));
        self.inner.frames_received.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.store(true, Ordering::Release);
        true
    }

    /// Claims the target for a capture stream; only one may write into it
    pub fn bind_producer(&self) -> Result<(), PipelineError> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(PipelineError::NoSurface);
        }
        self.inner
            .producer_bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| PipelineError::SurfaceBusy)
    }

    pub fn unbind_producer(&self) {
        self.inner.producer_bound.store(false, Ordering::Release);
    }

    pub fn has_producer(&self) -> bool {
        self.inner.producer_bound.load(Ordering::Acquire)
    }

    /// Sets the presentation rotation; the render thread reads it per draw
    pub fn set_rotation(&self, rotation: Rotation) {
        self.inner
            .rotation
            .store(rotation.quarter_turns() as u8, Ordering::Release);
    }

    pub fn rotation(&self) -> Rotation {
        Rotation::from_degrees(self.inner.rotation.load(Ordering::Acquire) as i32 * 90)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn frames_received(&self) -> u64 {
        self.inner.frames_received.load(Ordering::Relaxed)
    }

    /// Consumer side: clears the latch, returning whether it was set
    pub(crate) fn take_pending(&self) -> bool {
        self.inner.pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn latest(&self) -> Option<Arc<Frame>> {
        self.inner.content.load_full()
    }

    pub(crate) fn clear_content(&self) {
        self.inner.pending.store(false, Ordering::Release);
        self.inner.content.store(None);
    }

    pub(crate) fn mark_released(&self) {
        self.inner.released.store(true, Ordering::Release);
        self.clear_content();
    }
}

impl std::fmt::Debug for PresentationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationTarget")
            .field("texture", &self.inner.id)
            .field("rotation", &self.rotation())
            .field("producer_bound", &self.has_producer())
            .field("released", &self.is_released())
            .finish()
    }
}
