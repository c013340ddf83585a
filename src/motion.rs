//! Zone-based motion detection service.
//!
//! The service watches the event bus: a `camera_online` event starts a
//! detection task for that camera (if one is not already running), and a
//! `camera_offline` event cancels it cooperatively. A task also ends on its
//! own when the stream stops yielding frames.

use crate::analysis::{self, MotionZone};
use crate::capture::VideoCapture;
use crate::config::WatchtowerConfig;
use crate::events::{BusError, Event, EventBus, EventKind};
use crate::registry::{CameraDescriptor, CameraRegistry};
use crate::tasks::{StartOutcome, TaskRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a detection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorExit {
    /// The source could not be opened or stopped yielding frames
    StreamEnded,
    /// Cancelled after a camera_offline event or shutdown
    Cancelled,
}

/// Starts and supervises one detection task per online camera.
pub struct MotionDetector {
    registry: Arc<CameraRegistry>,
    capture: Arc<dyn VideoCapture>,
    bus: EventBus,
    zones: HashMap<String, Vec<MotionZone>>,
    base_threshold: f64,
    poll_interval: Duration,
    tasks: Arc<TaskRegistry>,
}

impl MotionDetector {
    pub fn new(
        registry: Arc<CameraRegistry>,
        capture: Arc<dyn VideoCapture>,
        bus: EventBus,
        config: &WatchtowerConfig,
    ) -> Self {
        let zones = config
            .motion_zones
            .iter()
            .map(|(camera, zones)| {
                (
                    camera.clone(),
                    zones.iter().map(MotionZone::from).collect(),
                )
            })
            .collect();

        Self {
            registry,
            capture,
            bus,
            zones,
            base_threshold: config.motion.base_threshold,
            poll_interval: config.motion.poll_interval(),
            tasks: Arc::new(TaskRegistry::new()),
        }
    }

    /// Registry of running detection tasks, one key per camera name.
    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Consume bus events until cancelled or the bus closes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut events = self.bus.subscribe();
        info!("motion detector started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("motion detector stopping");
                    self.tasks.cancel_all();
                    return Ok(());
                }
                event = events.next() => {
                    self.handle_event(event?);
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::CameraOnline => self.start_detection(&event.camera),
            EventKind::CameraOffline => {
                if self.tasks.cancel(&event.camera) {
                    info!(camera = %event.camera, "cancelling detection for offline camera");
                }
            }
            EventKind::MotionDetected => {}
        }
    }

    fn start_detection(&self, name: &str) {
        let Some(camera) = self.registry.get(name) else {
            warn!(camera = %name, "online event for unknown camera");
            return;
        };

        let zones = match self.zones.get(name) {
            Some(zones) if !zones.is_empty() => zones.clone(),
            _ => {
                warn!(camera = %name, "no motion zones configured, skipping detection");
                return;
            }
        };

        let session = DetectionSession {
            camera: camera.clone(),
            zones,
            capture: self.capture.clone(),
            bus: self.bus.clone(),
            base_threshold: self.base_threshold,
            poll_interval: self.poll_interval,
        };

        let outcome = self.tasks.try_start(name, move |token| async move {
            let camera = session.camera.name.clone();
            let exit = session.run(token).await;
            info!(camera = %camera, exit = ?exit, "detection task ended");
        });

        match outcome {
            StartOutcome::Started => info!(camera = %name, "detection task started"),
            StartOutcome::AlreadyRunning => {
                debug!(camera = %name, "detection already running")
            }
        }
    }
}

/// One camera's detection loop over a sliding pair of consecutive frames.
struct DetectionSession {
    camera: CameraDescriptor,
    zones: Vec<MotionZone>,
    capture: Arc<dyn VideoCapture>,
    bus: EventBus,
    base_threshold: f64,
    poll_interval: Duration,
}

impl DetectionSession {
    async fn run(self, token: CancellationToken) -> DetectorExit {
        let mut stream = match self.capture.open(&self.camera.source).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(camera = %self.camera.name, error = %e, "cannot open camera for detection");
                return DetectorExit::StreamEnded;
            }
        };

        // Prime the sliding pair.
        let Some(mut prev) = stream.read().await else {
            error!(camera = %self.camera.name, "cannot read first frame");
            return DetectorExit::StreamEnded;
        };
        let Some(mut current) = stream.read().await else {
            error!(camera = %self.camera.name, "cannot read second frame");
            return DetectorExit::StreamEnded;
        };

        loop {
            if token.is_cancelled() {
                return DetectorExit::Cancelled;
            }

            match analysis::detect(&prev, &current, &self.zones, self.base_threshold) {
                Ok(zones) if !zones.is_empty() => {
                    info!(camera = %self.camera.name, ?zones, "motion detected");
                    self.bus
                        .publish(Event::motion_detected(&self.camera.name, zones));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(camera = %self.camera.name, error = %e, "skipping unusable frame pair");
                }
            }

            // Advance the pair.
            prev = current;
            current = tokio::select! {
                _ = token.cancelled() => return DetectorExit::Cancelled,
                frame = stream.read() => match frame {
                    Some(frame) => frame,
                    None => return DetectorExit::StreamEnded,
                },
            };

            tokio::select! {
                _ = token.cancelled() => return DetectorExit::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fakes::{frame_with_rect, solid_frame, FakeCapture, SourceBehavior};
    use crate::config::ZoneConfig;
    use crate::registry::{CameraKind, SourceLocator};

    fn camera(name: &str) -> CameraDescriptor {
        CameraDescriptor {
            name: name.to_string(),
            kind: CameraKind::Rtsp,
            source: SourceLocator::Url(format!("rtsp://{}/stream", name)),
            control_url: None,
        }
    }

    fn full_zone() -> ZoneConfig {
        ZoneConfig {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            sensitivity: 1.0,
        }
    }

    fn detector_for(
        cameras: Vec<CameraDescriptor>,
        zones: Vec<(&str, Vec<ZoneConfig>)>,
    ) -> (MotionDetector, Arc<FakeCapture>, EventBus) {
        let capture = Arc::new(FakeCapture::new());
        let bus = EventBus::new(64);
        let mut config = WatchtowerConfig::default();
        for (name, list) in zones {
            config.motion_zones.insert(name.to_string(), list);
        }
        config.motion.poll_interval_ms = 1;
        let detector = MotionDetector::new(
            Arc::new(CameraRegistry::build(cameras, Vec::new())),
            capture.clone(),
            bus.clone(),
            &config,
        );
        (detector, capture, bus)
    }

    fn session(
        camera: CameraDescriptor,
        capture: Arc<FakeCapture>,
        bus: EventBus,
        zones: Vec<ZoneConfig>,
    ) -> DetectionSession {
        DetectionSession {
            camera,
            zones: zones.iter().map(MotionZone::from).collect(),
            capture,
            bus,
            base_threshold: 5000.0,
            poll_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_identical_frames_publish_nothing() {
        let front = camera("front");
        let capture = Arc::new(FakeCapture::new());
        let bus = EventBus::new(64);
        let frame = solid_frame(64, 64, 50);
        capture.set(
            &front.source,
            SourceBehavior::Frames(vec![frame.clone(), frame.clone(), frame.clone(), frame]),
        );

        let mut events = bus.subscribe();
        // Keep a bus handle alive past the session so an empty subscription
        // blocks instead of reporting the bus closed.
        let exit = session(front, capture, bus.clone(), vec![full_zone()])
            .run(CancellationToken::new())
            .await;

        assert_eq!(exit, DetectorExit::StreamEnded);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), events.next())
                .await
                .is_err(),
            "no motion event expected"
        );
    }

    #[tokio::test]
    async fn test_large_motion_publishes_single_event() {
        let front = camera("front");
        let capture = Arc::new(FakeCapture::new());
        let bus = EventBus::new(64);
        // The difference of this pair yields one contour of about 8000
        // pixels, fully inside the frame.
        capture.set(
            &front.source,
            SourceBehavior::Frames(vec![
                solid_frame(640, 480, 0),
                frame_with_rect(640, 480, 0, (200, 150, 100, 80), 255),
            ]),
        );

        let mut events = bus.subscribe();
        let exit = session(front, capture, bus, vec![full_zone()])
            .run(CancellationToken::new())
            .await;

        assert_eq!(exit, DetectorExit::StreamEnded);
        let event = events.next().await.unwrap();
        assert_eq!(event.kind, EventKind::MotionDetected);
        assert_eq!(event.camera, "front");
        assert_eq!(event.zones, Some(vec![0]));
    }

    #[tokio::test]
    async fn test_unreachable_camera_ends_task() {
        let front = camera("front");
        let capture = Arc::new(FakeCapture::new());
        let bus = EventBus::new(64);

        let exit = session(front, capture, bus, vec![full_zone()])
            .run(CancellationToken::new())
            .await;
        assert_eq!(exit, DetectorExit::StreamEnded);
    }

    #[tokio::test]
    async fn test_online_event_starts_one_task() {
        let front = camera("front");
        let (detector, capture, _bus) =
            detector_for(vec![front.clone()], vec![("front", vec![full_zone()])]);
        capture.set(
            &front.source,
            SourceBehavior::Endless(solid_frame(32, 32, 0)),
        );

        detector.handle_event(Event::camera_online("front", None));
        assert!(detector.tasks().is_running("front"));

        // A second online event while running is a no-op.
        detector.handle_event(Event::camera_online("front", None));
        assert_eq!(detector.tasks().running_count(), 1);

        detector.tasks().cancel_all();
    }

    #[tokio::test]
    async fn test_camera_without_zones_is_skipped() {
        let front = camera("front");
        let (detector, capture, _bus) = detector_for(vec![front.clone()], Vec::new());
        capture.set(
            &front.source,
            SourceBehavior::Endless(solid_frame(32, 32, 0)),
        );

        detector.handle_event(Event::camera_online("front", None));
        assert!(!detector.tasks().is_running("front"));
    }

    #[tokio::test]
    async fn test_offline_event_cancels_task() {
        let front = camera("front");
        let (detector, capture, _bus) =
            detector_for(vec![front.clone()], vec![("front", vec![full_zone()])]);
        capture.set(
            &front.source,
            SourceBehavior::Endless(solid_frame(32, 32, 0)),
        );

        detector.handle_event(Event::camera_online("front", None));
        assert!(detector.tasks().is_running("front"));

        detector.handle_event(Event::camera_offline("front", None));
        // Let the task observe the token and exit.
        for _ in 0..50 {
            if !detector.tasks().is_running("front") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!detector.tasks().is_running("front"));
    }
}
