//! Camera registry construction and the discovery seam.
//!
//! The registry is built once at startup by merging configured cameras with
//! whatever a discovery provider returned. After that it is immutable and
//! shared read-only by every service.

use crate::config::CameraConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Errors building camera descriptors from configuration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("camera '{0}' has no url configured")]
    MissingUrl(String),

    #[error("usb camera '{0}' has no device index configured")]
    MissingDevice(String),
}

/// Kind of camera source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Usb,
    Rtsp,
    Onvif,
}

/// Where a camera's stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// Local capture device index
    Device(u32),
    /// Network stream URL
    Url(String),
}

impl SourceLocator {
    /// The stream URL, if this is a network source.
    pub fn url(&self) -> Option<&str> {
        match self {
            SourceLocator::Url(url) => Some(url),
            SourceLocator::Device(_) => None,
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Device(index) => write!(f, "device:{}", index),
            SourceLocator::Url(url) => write!(f, "{}", url),
        }
    }
}

/// An immutable camera definition in the merged registry.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraDescriptor {
    /// Unique camera name
    pub name: String,

    /// Camera kind
    pub kind: CameraKind,

    /// Stream source
    pub source: SourceLocator,

    /// Optional control endpoint (e.g. ONVIF device service)
    pub control_url: Option<String>,
}

impl TryFrom<&CameraConfig> for CameraDescriptor {
    type Error = RegistryError;

    fn try_from(config: &CameraConfig) -> Result<Self, Self::Error> {
        let source = match config.kind {
            CameraKind::Usb => SourceLocator::Device(
                config
                    .device
                    .ok_or_else(|| RegistryError::MissingDevice(config.name.clone()))?,
            ),
            CameraKind::Rtsp | CameraKind::Onvif => SourceLocator::Url(
                config
                    .url
                    .clone()
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| RegistryError::MissingUrl(config.name.clone()))?,
            ),
        };

        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            source,
            control_url: config.control_url.clone(),
        })
    }
}

/// Provider of discovered cameras.
///
/// Implementations are best-effort: network or device failures must be
/// logged and swallowed, yielding whatever was found (possibly nothing).
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn discover(&self) -> Vec<CameraDescriptor>;
}

/// Discovery provider that finds nothing, used when auto-discovery is off.
pub struct NullDiscovery;

#[async_trait]
impl DiscoveryProvider for NullDiscovery {
    async fn discover(&self) -> Vec<CameraDescriptor> {
        Vec::new()
    }
}

/// The canonical, deduplicated camera list.
#[derive(Debug, Clone)]
pub struct CameraRegistry {
    cameras: Vec<CameraDescriptor>,
}

impl CameraRegistry {
    /// Merge configured and discovered cameras into one registry.
    ///
    /// Names are unique in the result; on collision the configured
    /// descriptor wins and the discovered one is discarded.
    pub fn build(
        configured: Vec<CameraDescriptor>,
        discovered: Vec<CameraDescriptor>,
    ) -> Self {
        let mut names: HashSet<String> =
            configured.iter().map(|camera| camera.name.clone()).collect();
        let mut cameras = configured;

        for camera in discovered {
            if !names.insert(camera.name.clone()) {
                debug!(
                    camera = %camera.name,
                    "discovered camera shadowed by configuration, discarded"
                );
                continue;
            }
            info!(camera = %camera.name, source = %camera.source, "auto-discovered camera");
            cameras.push(camera);
        }

        Self { cameras }
    }

    /// All cameras in registry order (configured first, then discovered).
    pub fn cameras(&self) -> &[CameraDescriptor] {
        &self.cameras
    }

    /// Look up a camera by name.
    pub fn get(&self, name: &str) -> Option<&CameraDescriptor> {
        self.cameras.iter().find(|camera| camera.name == name)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}
