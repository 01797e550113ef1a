use anyhow::{Context, Result};
use facegate_core::{
    DetectingEmbedder, GalleryStore, LandmarkEyeDetector, OnnxFaceEmbedder, SampleStore,
    ScrfdFaceDetector, SqliteUserRecords, Vision,
};
use facegate_hw::manager::{CameraManager, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod annotate;
mod config;
mod enroll;
mod http;
mod identify;
mod modes;
mod service;
mod stream;

use annotate::Annotator;
use service::{Service, ServiceSettings, Stores};
use stream::StreamSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        bind = %config.bind_addr,
        models = %config.model_dir.display(),
        gallery = %config.gallery_path.display(),
        "facegated starting"
    );

    // Models and stores load up front so a misconfigured daemon fails fast.
    let load_detector = || {
        ScrfdFaceDetector::load(&config.detector_model_path()).context("loading face detector")
    };
    let vision = Vision {
        faces: Box::new(load_detector()?),
        eyes: Box::new(LandmarkEyeDetector),
        // Samples are re-detected before encoding, so the embedder gets its own session.
        embedder: Box::new(DetectingEmbedder::new(
            Box::new(load_detector()?),
            Box::new(
                OnnxFaceEmbedder::load(&config.embedder_model_path())
                    .context("loading face embedder")?,
            ),
        )),
    };
    let stores = Stores {
        gallery: Arc::new(GalleryStore::open(&config.gallery_path).context("loading gallery")?),
        samples: SampleStore::new(&config.samples_dir),
        records: Arc::new(SqliteUserRecords::open(&config.db_path).context("opening user records")?),
    };
    let cameras = CameraManager::v4l2(
        config.camera_device.clone(),
        DEFAULT_WIDTH,
        DEFAULT_HEIGHT,
        config.settle,
    );
    let settings = ServiceSettings {
        tunables: config.tunables,
        identify_every: config.identify_every,
        stream: StreamSettings {
            read_retry: config.read_retry,
            max_read_failures: config.max_read_failures,
            jpeg_quality: config.jpeg_quality,
        },
    };
    let annotator = Annotator::load(config.font_path.as_deref());

    let service = Arc::new(Service::new(settings, cameras, vision, stores, annotator));
    let app = http::router(Arc::clone(&service));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "facegated ready");

    // Streams never end on their own, so stop both modes before waiting on connections.
    let shutdown_service = Arc::clone(&service);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("facegated shutting down");
            let _ = tokio::task::spawn_blocking(move || {
                shutdown_service.stop_enrollment();
                shutdown_service.stop_identification();
            })
            .await;
        })
        .await?;

    Ok(())
}
