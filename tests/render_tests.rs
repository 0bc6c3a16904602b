mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::*;
use edgeview::display::{ClearColor, Quad, RenderLoop, RenderOptions};
use edgeview::pipeline::{FpsCounter, Stats};
use edgeview::{PipelineError, Rotation};

const WAIT: Duration = Duration::from_secs(2);

fn options() -> RenderOptions {
    RenderOptions {
        width: 720,
        height: 1280,
        pin_core: None,
    }
}

fn spawn(gpu: &Arc<GpuLog>) -> RenderLoop {
    RenderLoop::spawn(
        RecordingGpu::factory(gpu),
        options(),
        Arc::new(Stats::new()),
        |e| panic!("unexpected fatal error: {}", e),
    )
    .unwrap()
}

#[test]
fn test_create_surface_reuses_live_texture() {
    let gpu = Arc::new(GpuLog::default());
    let render = spawn(&gpu);
    let handle = render.handle();

    let first = handle.create_surface().unwrap();
    let second = handle.create_surface().unwrap();
    assert_eq!(first.texture_id(), second.texture_id());
    assert_eq!(gpu.textures_created(), 1);
}

#[test]
fn test_import_failure_clears_to_error_color() {
    let gpu = Arc::new(GpuLog::default());
    let render = spawn(&gpu);
    let handle = render.handle();
    let target = handle.create_surface().unwrap();

    gpu.fail_import.store(true, Ordering::Release);
    target.push(&rgba_frame(64, 48, 1));
    handle.request_redraw();
    assert!(wait_for(WAIT, || gpu
        .ops()
        .contains(&GpuOp::Clear(ClearColor::ERROR))));
    assert_eq!(gpu.draws(), 0);

    gpu.fail_import.store(false, Ordering::Release);
    target.push(&rgba_frame(64, 48, 2));
    handle.request_redraw();
    assert!(wait_for(WAIT, || gpu.draws() == 1));
}

#[test]
fn test_redraw_without_new_frame_reuses_content() {
    let gpu = Arc::new(GpuLog::default());
    let render = spawn(&gpu);
    let handle = render.handle();
    let target = handle.create_surface().unwrap();
    target.set_rotation(Rotation::Deg270);

    target.push(&rgba_frame(64, 48, 1));
    handle.request_redraw();
    assert!(wait_for(WAIT, || gpu.draws() == 1));

    handle.request_redraw();
    assert!(wait_for(WAIT, || gpu.draws() == 2));
    assert_eq!(gpu.count(|op| matches!(op, GpuOp::Import { .. })), 1);
    assert_eq!(gpu.last_draw(), Some(Quad::full_screen(Rotation::Deg270)));
}

#[test]
fn test_nothing_drawn_before_first_frame() {
    let gpu = Arc::new(GpuLog::default());
    let render = spawn(&gpu);
    let handle = render.handle();
    handle.create_surface().unwrap();

    handle.request_redraw();
    handle.resize(100, 100).unwrap();
    assert!(wait_for(WAIT, || gpu.ops().contains(&GpuOp::Resize(100, 100))));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(gpu.draws(), 0);
    assert!(!gpu.ops().contains(&GpuOp::Clear(ClearColor::ERROR)));
}

#[test]
fn test_draw_imports_latest_frame_only() {
    let gpu = Arc::new(GpuLog::default());
    let render = spawn(&gpu);
    let handle = render.handle();
    let target = handle.create_surface().unwrap();

    for ts in 1..=3 {
        target.push(&rgba_frame(32, 32, ts));
    }
    handle.request_redraw();
    assert!(wait_for(WAIT, || gpu.draws() == 1));
    let imports: Vec<_> = gpu
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            GpuOp::Import { timestamp_ns, .. } => Some(timestamp_ns),
            _ => None,
        })
        .collect();
    assert_eq!(imports, vec![3]);
}

#[test]
fn test_release_marks_target_released() {
    let gpu = Arc::new(GpuLog::default());
    let render = spawn(&gpu);
    let handle = render.handle();
    let target = handle.create_surface().unwrap();

    handle.release_surface().unwrap();
    assert!(target.is_released());
    assert!(!target.push(&rgba_frame(8, 8, 1)));
    assert_eq!(gpu.count(|op| matches!(op, GpuOp::Release(_))), 1);
}

#[test]
fn test_context_failure_is_fatal() {
    let fatal = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&fatal);
    let render = RenderLoop::spawn(
        || Err::<RecordingGpu, _>(PipelineError::GpuContext("no adapter".into())),
        options(),
        Arc::new(Stats::new()),
        move |e| *seen.lock().unwrap() = Some(e),
    )
    .unwrap();

    let err = render.handle().create_surface().unwrap_err();
    assert_eq!(err, PipelineError::GpuContext("no adapter".into()));
    assert_eq!(
        *fatal.lock().unwrap(),
        Some(PipelineError::GpuContext("no adapter".into()))
    );
}

#[test]
fn test_fps_reported_after_one_second() {
    let gpu = Arc::new(GpuLog::default());
    let stats = Arc::new(Stats::new());
    let render = RenderLoop::spawn(
        RecordingGpu::factory(&gpu),
        options(),
        Arc::clone(&stats),
        |_| {},
    )
    .unwrap();
    let handle = render.handle();
    let target = handle.create_surface().unwrap();

    let started = Instant::now();
    let mut ts = 0;
    while started.elapsed() < Duration::from_millis(1100) {
        ts += 1;
        target.push(&rgba_frame(8, 8, ts));
        handle.request_redraw();
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(wait_for(WAIT, || stats.fps() > 0));
    assert!(stats.fps() as usize <= gpu.draws());
}

#[test]
fn test_fps_counts_exactly_thirty_draws() {
    let start = Instant::now();
    let mut counter = FpsCounter::new(start);
    let mut emitted = None;
    for i in 1..=30u64 {
        let at = start + Duration::from_millis(i * 1000 / 30);
        emitted = counter.record(at);
    }
    assert_eq!(emitted, Some(30));
}
