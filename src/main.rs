//! Watchtower camera monitoring service.
//!
//! Builds the camera registry, then runs three services over one fanout
//! event bus:
//!
//! ```text
//! HealthMonitor --> EventBus --> MotionDetector --> EventBus --> Recorder
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{RUN_MODE}.toml,
//!    then the file named by CONFIG_PATH)
//! 2. Environment variables (prefixed with WATCHTOWER__)
//!
//! See `config.rs` for detailed configuration options.

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watchtower::config::{LoggingConfig, WatchtowerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    init_logging(&config.logging)?;

    info!(
        service = "watchtower",
        version = env!("CARGO_PKG_VERSION"),
        cameras = config.cameras.len(),
        "Starting camera monitoring service"
    );

    config.validate()?;

    run(config).await
}

/// Load and validate configuration.
fn load_config() -> anyhow::Result<WatchtowerConfig> {
    // Try loading from files first, fall back to environment
    let config = WatchtowerConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        WatchtowerConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("watchtower={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

#[cfg(not(feature = "gstreamer"))]
async fn run(_config: WatchtowerConfig) -> anyhow::Result<()> {
    anyhow::bail!(
        "watchtower was built without a capture backend; rebuild with --features gstreamer"
    )
}

#[cfg(feature = "gstreamer")]
async fn run(config: WatchtowerConfig) -> anyhow::Result<()> {
    use std::sync::Arc;
    use tokio::signal;
    use tokio_util::sync::CancellationToken;
    use tracing::error;
    use watchtower::capture::{VideoCapture, VideoEncoder};
    use watchtower::gst::{GstCapture, GstEncoder};
    use watchtower::registry::{
        CameraDescriptor, CameraRegistry, DiscoveryProvider, NullDiscovery,
    };
    use watchtower::{EventBus, HealthMonitor, MotionDetector, Recorder};

    let capture: Arc<dyn VideoCapture> = Arc::new(GstCapture::new()?);
    let encoder: Arc<dyn VideoEncoder> = Arc::new(GstEncoder::new()?);

    // Build the camera registry once; it is immutable afterwards.
    let configured = config
        .cameras
        .iter()
        .map(CameraDescriptor::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let discovered = if config.auto_discover {
        info!("Running camera discovery");
        NullDiscovery.discover().await
    } else {
        Vec::new()
    };
    let registry = Arc::new(CameraRegistry::build(configured, discovered));
    info!(cameras = registry.len(), "Camera registry built");

    let bus = EventBus::new(config.events.capacity);
    let shutdown = CancellationToken::new();

    let health = Arc::new(HealthMonitor::new(
        registry.clone(),
        capture.clone(),
        bus.clone(),
        config.health.interval(),
    ));
    let motion = Arc::new(MotionDetector::new(
        registry.clone(),
        capture.clone(),
        bus.clone(),
        &config,
    ));
    let recorder = Arc::new(Recorder::new(
        registry,
        capture,
        encoder,
        bus.clone(),
        config.recording.clone(),
        &config.storage,
    ));

    // Subscribing services must be running before the first health tick.
    let motion_handle = tokio::spawn({
        let motion = motion.clone();
        let token = shutdown.child_token();
        async move { motion.run(token).await }
    });
    let recorder_handle = tokio::spawn({
        let recorder = recorder.clone();
        let token = shutdown.child_token();
        async move { recorder.run(token).await }
    });
    let health_handle = tokio::spawn({
        let health = health.clone();
        let token = shutdown.child_token();
        async move { health.run(token).await }
    });

    let shutdown_signal = async {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received shutdown signal");
    };

    // A subscribing service returning early means its bus connection
    // failed, which is fatal to the whole process.
    let result: anyhow::Result<()> = tokio::select! {
        _ = shutdown_signal => Ok(()),
        res = health_handle => res.map_err(anyhow::Error::from),
        res = motion_handle => res
            .map_err(anyhow::Error::from)
            .and_then(|r| r.map_err(anyhow::Error::from)),
        res = recorder_handle => res
            .map_err(anyhow::Error::from)
            .and_then(|r| r.map_err(anyhow::Error::from)),
    };

    shutdown.cancel();

    match &result {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!(error = %e, "Service failed"),
    }

    result
}
