//! Configuration management for the watchtower service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::registry::CameraKind;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the watchtower service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchtowerConfig {
    /// Configured cameras, in declaration order
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,

    /// Whether to merge discovery-provider results into the registry
    #[serde(default)]
    pub auto_discover: bool,

    /// Motion zones per camera name
    #[serde(default)]
    pub motion_zones: HashMap<String, Vec<ZoneConfig>>,

    /// Recording behavior
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Motion detection tuning
    #[serde(default)]
    pub motion: MotionConfig,

    /// Health polling configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Event bus configuration
    #[serde(default)]
    pub events: EventBusConfig,

    /// Recording storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A single configured camera.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Unique camera name, used as the key in events and filenames
    pub name: String,

    /// Camera kind (usb, rtsp, or onvif)
    pub kind: CameraKind,

    /// Stream URL for network cameras
    #[serde(default)]
    pub url: Option<String>,

    /// Device index for USB cameras
    #[serde(default)]
    pub device: Option<u32>,

    /// Optional control endpoint (e.g. an ONVIF device service URL)
    #[serde(default)]
    pub control_url: Option<String>,
}

/// A normalized motion zone inside a camera's frame.
///
/// Coordinates are fractions of the frame dimensions, so the same zone
/// definition applies regardless of the stream resolution.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ZoneConfig {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,

    /// Multiplier applied to the base contour-area threshold
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
}

/// Recording behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Record fixed-duration segments back-to-back for every camera
    #[serde(default)]
    pub continuous: bool,

    /// Start a bounded recording on each motion event
    #[serde(default = "default_true")]
    pub event_triggered: bool,

    /// Duration of an event-triggered recording in seconds
    #[serde(default = "default_event_duration")]
    pub duration_secs: u64,

    /// Duration of a continuous-mode segment in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u64,

    /// Pause between continuous-mode segments in seconds
    #[serde(default = "default_segment_pause")]
    pub segment_pause_secs: u64,

    /// What to do when a motion event arrives while an event-triggered
    /// recording for the same camera is still running
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

/// Policy for concurrent event-triggered recordings of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Every motion event starts an independent recording task
    #[default]
    Allow,
    /// Drop motion events while a recording for the camera is live
    Reject,
}

/// Motion detection tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    /// Minimum contour area (in pixels, before zone sensitivity scaling)
    /// that counts as motion
    #[serde(default = "default_base_threshold")]
    pub base_threshold: f64,

    /// Delay between detection iterations in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Health polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Interval between health-check ticks in seconds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    /// Per-subscriber buffer capacity before old events are dropped
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

/// Recording storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory where recording segments are written
    #[serde(default = "default_recordings_path")]
    pub recordings_path: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_sensitivity() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_event_duration() -> u64 {
    30
}
fn default_segment_duration() -> u64 {
    300
}
fn default_segment_pause() -> u64 {
    1
}
fn default_base_threshold() -> f64 {
    5000.0
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_health_interval() -> u64 {
    60
}
fn default_bus_capacity() -> usize {
    256
}
fn default_recordings_path() -> PathBuf {
    PathBuf::from("/data/recordings")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            event_triggered: default_true(),
            duration_secs: default_event_duration(),
            segment_duration_secs: default_segment_duration(),
            segment_pause_secs: default_segment_pause(),
            overlap: OverlapPolicy::default(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            base_threshold: default_base_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
        }
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recordings_path: default_recordings_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WatchtowerConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{RUN_MODE}.toml)
    /// 3. The file named by CONFIG_PATH, if set
    /// 4. Environment variables (prefixed with WATCHTOWER__)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Ok(path) = std::env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("WATCHTOWER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("WATCHTOWER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut names = HashSet::new();

        for (i, camera) in self.cameras.iter().enumerate() {
            if camera.name.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "cameras[{}].name",
                    i
                )));
            }
            if !names.insert(camera.name.as_str()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras[{}].name", i),
                    message: format!("duplicate camera name '{}'", camera.name),
                });
            }
            match camera.kind {
                CameraKind::Usb => {
                    if camera.device.is_none() {
                        return Err(ConfigValidationError::MissingField(format!(
                            "cameras[{}].device",
                            i
                        )));
                    }
                }
                CameraKind::Rtsp | CameraKind::Onvif => {
                    if camera.url.as_deref().unwrap_or("").is_empty() {
                        return Err(ConfigValidationError::MissingField(format!(
                            "cameras[{}].url",
                            i
                        )));
                    }
                }
            }
        }

        for (camera, zones) in &self.motion_zones {
            for (i, zone) in zones.iter().enumerate() {
                let field = format!("motion_zones.{}[{}]", camera, i);
                let in_unit = |v: f64| (0.0..=1.0).contains(&v);
                if !in_unit(zone.x) || !in_unit(zone.y) || !in_unit(zone.width) || !in_unit(zone.height)
                {
                    return Err(ConfigValidationError::InvalidValue {
                        field,
                        message: "zone coordinates must be within [0, 1]".to_string(),
                    });
                }
                if zone.width <= 0.0 || zone.height <= 0.0 {
                    return Err(ConfigValidationError::InvalidValue {
                        field,
                        message: "zone width and height must be greater than 0".to_string(),
                    });
                }
                if zone.sensitivity <= 0.0 {
                    return Err(ConfigValidationError::InvalidValue {
                        field,
                        message: "sensitivity must be greater than 0".to_string(),
                    });
                }
            }
        }

        if self.recording.duration_secs == 0 || self.recording.segment_duration_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recording.duration_secs/segment_duration_secs".to_string(),
                message: "recording durations must be greater than 0".to_string(),
            });
        }

        if self.motion.base_threshold <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.base_threshold".to_string(),
                message: "base threshold must be greater than 0".to_string(),
            });
        }

        if self.health.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "health.interval_secs".to_string(),
                message: "health interval must be greater than 0".to_string(),
            });
        }

        if self.events.capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "events.capacity".to_string(),
                message: "event bus capacity must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Motion zones configured for a camera, empty if none.
    pub fn zones_for(&self, camera: &str) -> &[ZoneConfig] {
        self.motion_zones
            .get(camera)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl RecordingConfig {
    /// Get event-triggered recording duration as Duration.
    pub fn event_duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Get continuous segment duration as Duration.
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    /// Get the pause between continuous segments as Duration.
    pub fn segment_pause(&self) -> Duration {
        Duration::from_secs(self.segment_pause_secs)
    }
}

impl MotionConfig {
    /// Get the detection loop delay as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl HealthConfig {
    /// Get the polling interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
