//! Throughput and latency counters shared across pipeline threads

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use serde::Serialize;

use super::coordinator::PipelineStateKind;

/// Counts completed draws per wall-clock second
#[derive(Debug)]
pub struct FpsCounter {
    frames: u32,
    window_start: Instant,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
        }
    }

    /// Records one draw; returns the count once a full second has elapsed
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            let fps = self.frames;
            self.frames = 0;
            self.window_start = now;
            Some(fps)
        } else {
            None
        }
    }
}

/// Point-in-time copy of the pipeline statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub fps: u32,
    pub resolution: String,
    pub last_processing_latency_ms: f64,
    pub frame_count: u64,
    pub pipeline_state: PipelineStateKind,
}

/// Lock-free statistics written by the render loop, capture worker and
/// transform workers
#[derive(Default)]
pub struct Stats {
    fps: CachePadded<AtomicU32>,
    frame_count: CachePadded<AtomicU64>,
    last_latency_us: CachePadded<AtomicU64>,
    /// Width in the high half, height in the low half
    resolution: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fps(&self, fps: u32) {
        self.fps.store(fps, Ordering::Relaxed);
    }

    pub fn record_frame(&self, width: u32, height: u32) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        self.resolution
            .store(((width as u64) << 32) | height as u64, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        self.last_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        let packed = self.resolution.load(Ordering::Relaxed);
        (packed != 0).then_some(((packed >> 32) as u32, packed as u32))
    }

    /// Clears counters for a fresh session
    pub fn reset(&self) {
        self.fps.store(0, Ordering::Relaxed);
        self.frame_count.store(0, Ordering::Relaxed);
        self.last_latency_us.store(0, Ordering::Relaxed);
        self.resolution.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, state: PipelineStateKind) -> StatsSnapshot {
        let resolution = match self.resolution() {
            Some((w, h)) => format!("{}x{}", w, h),
            None => "0x0".to_string(),
        };
        StatsSnapshot {
            fps: self.fps(),
            resolution,
            last_processing_latency_ms: self.last_latency_us.load(Ordering::Relaxed) as f64
                / 1000.0,
            frame_count: self.frame_count(),
            pipeline_state: state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_reports_draws_within_second() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);
        for i in 1..30u64 {
            assert_eq!(counter.record(start + Duration::from_millis(i * 33)), None);
        }
        assert_eq!(counter.record(start + Duration::from_secs(1)), Some(30));
    }

    #[test]
    fn test_fps_resets_each_window() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);
        for i in 1..=10u64 {
            counter.record(start + Duration::from_millis(i * 100));
        }
        let second = start + Duration::from_secs(1);
        assert_eq!(counter.record(second + Duration::from_millis(500)), None);
        assert_eq!(counter.record(second + Duration::from_millis(1000)), Some(2));
    }

    #[test]
    fn test_snapshot_resolution() {
        let stats = Stats::new();
        assert_eq!(stats.snapshot(PipelineStateKind::Idle).resolution, "0x0");
        stats.record_frame(1280, 720);
        stats.record_latency(Duration::from_micros(4500));
        let snapshot = stats.snapshot(PipelineStateKind::Streaming);
        assert_eq!(snapshot.resolution, "1280x720");
        assert_eq!(snapshot.frame_count, 1);
        assert!((snapshot.last_processing_latency_ms - 4.5).abs() < f64::EPSILON);
    }
}
