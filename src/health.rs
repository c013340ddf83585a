//! Periodic camera health polling.
//!
//! Every tick the monitor attempts to open each camera's stream and read one
//! frame. A camera is online iff the open succeeds and a non-empty frame
//! comes back. Transition events are published only when the observed value
//! differs from the stored one; unchanged observations are no-ops.

use crate::capture::VideoCapture;
use crate::events::{Event, EventBus};
use crate::registry::{CameraDescriptor, CameraRegistry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Last known status of one camera.
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub camera: String,
    pub online: bool,
    pub changed_at: DateTime<Utc>,
}

/// Polls every registered camera on a fixed interval and publishes
/// online/offline transitions.
pub struct HealthMonitor {
    registry: Arc<CameraRegistry>,
    capture: Arc<dyn VideoCapture>,
    bus: EventBus,
    interval: Duration,
    // Owned by this monitor; other services observe status only through
    // published events.
    statuses: Mutex<HashMap<String, CameraStatus>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<CameraRegistry>,
        capture: Arc<dyn VideoCapture>,
        bus: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            capture,
            bus,
            interval,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of all recorded statuses, sorted by camera name.
    pub fn snapshot(&self) -> Vec<CameraStatus> {
        let mut statuses: Vec<_> = self.statuses.lock().values().cloned().collect();
        statuses.sort_by(|a, b| a.camera.cmp(&b.camera));
        statuses
    }

    /// Run the polling loop: one pass immediately, then one per interval.
    /// Returns only on cancellation.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            cameras = self.registry.len(),
            interval_secs = self.interval.as_secs(),
            "health monitor started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_all().await;
                }
            }
        }
    }

    /// Check every camera once. Per-camera failures are absorbed.
    pub async fn check_all(&self) {
        for camera in self.registry.cameras() {
            self.check_camera(camera).await;
        }
    }

    async fn check_camera(&self, camera: &CameraDescriptor) {
        let online = self.probe(camera).await;

        let changed = {
            let mut statuses = self.statuses.lock();
            match statuses.get(&camera.name) {
                Some(status) if status.online == online => false,
                _ => {
                    statuses.insert(
                        camera.name.clone(),
                        CameraStatus {
                            camera: camera.name.clone(),
                            online,
                            changed_at: Utc::now(),
                        },
                    );
                    true
                }
            }
        };

        if !changed {
            debug!(
                camera = %camera.name,
                online,
                "camera status unchanged"
            );
            return;
        }

        let url = camera.source.url().map(String::from);
        let event = if online {
            Event::camera_online(&camera.name, url)
        } else {
            Event::camera_offline(&camera.name, url)
        };
        info!(camera = %camera.name, online, "camera status changed");
        self.bus.publish(event);
    }

    /// One open+read attempt. Any capture failure classifies offline.
    async fn probe(&self, camera: &CameraDescriptor) -> bool {
        match self.capture.open(&camera.source).await {
            Ok(mut stream) => match stream.read().await {
                Some(frame) if !frame.is_empty() => true,
                _ => false,
            },
            Err(e) => {
                error!(camera = %camera.name, error = %e, "health check failed to open stream");
                false
            }
        }
    }
}
