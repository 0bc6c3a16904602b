//! Edgeview: camera preview with per-frame edge detection

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use edgeview::capture::{CameraBackend, SyntheticBackend, SyntheticCamera, V4l2Backend};
use edgeview::display::WgpuRenderer;
use edgeview::pipeline::{EdgeDetector, FeedPublisher};
use edgeview::{CaptureBackendKind, Config, Coordinator};

const DEFAULT_CONFIG: &str = "edgeview.toml";
const EDGE_THRESHOLD: u8 = 32;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edgeview=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

fn camera_backend(config: &Config) -> Arc<dyn CameraBackend> {
    match config.capture.backend {
        CaptureBackendKind::V4l2 => Arc::new(V4l2Backend::new(config.capture.clone())),
        CaptureBackendKind::Synthetic => Arc::new(SyntheticBackend::new(SyntheticCamera {
            width: config.capture.width,
            height: config.capture.height,
            fps: config.capture.fps,
            sensor_orientation: config.capture.sensor_orientation,
            ..SyntheticCamera::default()
        })),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("Edgeview launching...");

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.into());
    let config = Config::load(&path)?;
    debug!(?config, path = %path, "Configuration loaded");

    let backend = camera_backend(&config);
    info!(backend = backend.name(), "Using capture backend");

    let display_config = config.display.clone();
    let mut coordinator = Coordinator::new(
        config.clone(),
        backend,
        move || WgpuRenderer::new(&display_config),
        Arc::new(EdgeDetector::new(EDGE_THRESHOLD)),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.feed.enabled {
        let publisher = FeedPublisher::new(coordinator.stats_reader(), config.feed.clone());
        let mut feed = publisher.subscribe();
        tasks.push(tokio::spawn(publisher.run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(async move {
            while let Ok(message) = feed.recv().await {
                match message.to_json() {
                    Ok(json) => debug!(preview = message.preview.is_some(), "{}", json),
                    Err(e) => error!("Feed serialization failed: {}", e),
                }
            }
        }));
    } else {
        let reader = coordinator.stats_reader();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let s = reader.snapshot();
                        info!(
                            fps = s.fps,
                            resolution = %s.resolution,
                            latency_ms = s.last_processing_latency_ms,
                            frames = s.frame_count,
                            state = ?s.pipeline_state,
                            "Pipeline stats"
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    // Coordinator calls wait on the camera and render threads
    let started = task::block_in_place(|| {
        coordinator.create_surface()?;
        coordinator.on_authorization_granted()
    });
    if let Err(e) = started {
        error!("Pipeline failed to start: {}", e);
        let _ = shutdown_tx.send(true);
        task::block_in_place(|| coordinator.shutdown());
        return Err(e.into());
    }

    info!(
        rotation = coordinator.total_rotation().map(|r| r.degrees()),
        "Streaming; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    info!("Edgeview shutting down");
    let _ = shutdown_tx.send(true);
    task::block_in_place(move || drop(coordinator));
    for task in tasks {
        task.abort();
    }
    Ok(())
}
