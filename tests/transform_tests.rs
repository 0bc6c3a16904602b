mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use edgeview::pipeline::{
    DrainOutcome, ProcessingMode, Stats, TransformBoundary, TransformOptions,
};
use edgeview::{Coordinator, PipelineState};

const WAIT: Duration = Duration::from_secs(2);

fn boundary(
    transform: Arc<dyn edgeview::pipeline::FrameTransform>,
    workers: usize,
    queue_depth: usize,
) -> TransformBoundary {
    TransformBoundary::new(
        transform,
        ProcessingMode::Edge,
        TransformOptions {
            workers,
            queue_depth,
        },
        Arc::new(Stats::new()),
    )
    .unwrap()
}

#[test]
fn test_stale_result_not_applied() {
    let gated = Arc::new(GatedTransform::with_gates(&[100, 200]));
    let boundary = boundary(gated.clone(), 2, 2);

    assert!(boundary.submit(&rgba_frame(8, 8, 100)));
    assert!(boundary.submit(&rgba_frame(8, 8, 200)));
    assert!(wait_for(WAIT, || gated.entered.load(Ordering::SeqCst) == 2));

    gated.open(200);
    assert!(wait_for(WAIT, || boundary
        .latest()
        .is_some_and(|r| r.timestamp_ns == 200)));

    gated.open(100);
    assert!(wait_for(WAIT, || boundary.in_flight() == 0));
    assert_eq!(boundary.latest().unwrap().timestamp_ns, 200);
}

#[test]
fn test_full_queue_skips_without_blocking() {
    let gated = Arc::new(GatedTransform::with_gates(&[1]));
    let boundary = boundary(gated.clone(), 1, 1);

    assert!(boundary.submit(&rgba_frame(8, 8, 1)));
    assert!(wait_for(WAIT, || gated.entered.load(Ordering::SeqCst) == 1));
    assert!(boundary.submit(&rgba_frame(8, 8, 2)));

    let started = Instant::now();
    assert!(!boundary.submit(&rgba_frame(8, 8, 3)));
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(boundary.dropped(), 1);

    gated.open_all();
    assert!(wait_for(WAIT, || boundary.in_flight() == 0));
    assert_eq!(boundary.latest().unwrap().timestamp_ns, 2);
}

#[test]
fn test_drain_discards_late_completion() {
    let gated = Arc::new(GatedTransform::with_gates(&[100]));
    let boundary = boundary(gated.clone(), 1, 1);

    boundary.submit(&rgba_frame(8, 8, 100));
    assert!(wait_for(WAIT, || gated.entered.load(Ordering::SeqCst) == 1));

    assert_eq!(
        boundary.drain(Duration::from_millis(10)),
        DrainOutcome::Abandoned { in_flight: 1 }
    );
    gated.open(100);
    assert!(wait_for(WAIT, || boundary.in_flight() == 0));
    assert!(boundary.latest().is_none());
    assert_eq!(boundary.drain(Duration::from_millis(10)), DrainOutcome::Drained);
}

#[test]
fn test_failed_transform_is_swallowed() {
    let broken = Arc::new(BrokenTransform {
        panic: false,
        calls: Default::default(),
    });
    let boundary = boundary(broken.clone(), 1, 2);

    boundary.submit(&rgba_frame(8, 8, 1));
    assert!(wait_for(WAIT, || boundary.failures() == 1));
    boundary.submit(&rgba_frame(8, 8, 2));
    assert!(wait_for(WAIT, || boundary.failures() == 2));
    assert!(boundary.latest().is_none());
}

#[test]
fn test_panicking_transform_keeps_worker_alive() {
    let broken = Arc::new(BrokenTransform {
        panic: true,
        calls: Default::default(),
    });
    let boundary = boundary(broken.clone(), 1, 2);

    for ts in 1..=3 {
        boundary.submit(&rgba_frame(8, 8, ts));
        assert!(wait_for(WAIT, || boundary.in_flight() == 0));
    }
    assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
    assert_eq!(boundary.failures(), 3);
}

#[test]
fn test_mode_change_applies_to_next_frame() {
    let echo = Arc::new(EchoTransform::default());
    let boundary = boundary(echo.clone(), 1, 2);

    boundary.submit(&rgba_frame(8, 8, 1));
    assert!(wait_for(WAIT, || boundary.in_flight() == 0));
    boundary.set_mode(ProcessingMode::Gray);
    boundary.submit(&rgba_frame(8, 8, 2));
    assert!(wait_for(WAIT, || boundary.in_flight() == 0));

    let calls = echo.calls.lock().unwrap().clone();
    let modes: Vec<_> = calls.iter().map(|(_, mode, _)| *mode).collect();
    assert_eq!(modes, vec![ProcessingMode::Edge, ProcessingMode::Gray]);
    assert!(calls
        .iter()
        .all(|(_, _, thread)| thread.starts_with("edgeview-transform")));
    assert_eq!(boundary.latest().unwrap().output.code, 2);
}

#[test]
fn test_slow_transform_does_not_delay_redraw() {
    let camera = MockCamera::new(90);
    let gpu = Arc::new(GpuLog::default());
    let slow = Arc::new(SlowTransform::new(Duration::from_millis(600)));
    let mut coordinator = Coordinator::new(
        test_config(),
        Arc::new(camera.clone()),
        RecordingGpu::factory(&gpu),
        slow.clone(),
    )
    .unwrap();
    coordinator.create_surface().unwrap();
    coordinator.on_authorization_granted().unwrap();
    assert_eq!(coordinator.state(), PipelineState::Streaming);

    camera.log.deliver(rgba_frame(64, 48, 1));
    assert!(wait_for(WAIT, || gpu.draws() == 1));
    assert!(wait_for(WAIT, || slow.started.load(Ordering::SeqCst) == 1));

    // the worker is busy; this frame must still reach the screen promptly
    let started = Instant::now();
    camera.log.deliver(rgba_frame(64, 48, 2));
    assert!(wait_for(WAIT, || gpu.draws() == 2));
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "redraw took {:?}",
        started.elapsed()
    );

    coordinator.stop();
    assert_eq!(coordinator.state(), PipelineState::Idle);
}
