//! Watchtower - camera monitoring, motion detection, and recording
//!
//! This library implements the event-driven core of a camera surveillance
//! system. It handles:
//!
//! - Building a canonical camera registry from configuration and discovery
//! - Periodic health polling with online/offline transition events
//! - Zone-based motion detection over consecutive frame pairs
//! - Continuous and event-triggered segment recording
//!
//! All services communicate through an in-process fanout event bus; none of
//! them call each other directly.
//!
//! # Example
//!
//! ```rust,no_run
//! use watchtower::{EventBus, WatchtowerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WatchtowerConfig::load()?;
//!     config.validate()?;
//!
//!     let bus = EventBus::new(config.events.capacity);
//!     let mut events = bus.subscribe();
//!
//!     while let Ok(event) = events.next().await {
//!         println!("{:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod capture;
pub mod config;
pub mod events;
pub mod health;
pub mod motion;
pub mod recorder;
pub mod registry;
pub mod tasks;

#[cfg(feature = "gstreamer")]
pub mod gst;

// Re-export main types
pub use config::{
    ConfigValidationError, HealthConfig, LoggingConfig, MotionConfig, OverlapPolicy,
    RecordingConfig, WatchtowerConfig, ZoneConfig,
};
pub use events::{BusError, Event, EventBus, EventKind, EventStream};
pub use health::{CameraStatus, HealthMonitor};
pub use motion::MotionDetector;
pub use recorder::{Recorder, RecordingSegment};
pub use registry::{CameraDescriptor, CameraKind, CameraRegistry, DiscoveryProvider, SourceLocator};
pub use tasks::{StartOutcome, TaskRegistry};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::capture::{Frame, FrameStream, VideoCapture, VideoEncoder, VideoSink};
    pub use crate::config::WatchtowerConfig;
    pub use crate::events::{Event, EventBus, EventKind};
    pub use crate::registry::{CameraDescriptor, CameraRegistry};
}
