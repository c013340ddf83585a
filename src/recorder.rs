//! Continuous and event-triggered segment recording.
//!
//! Continuous mode writes fixed-duration segments back-to-back for every
//! camera, regardless of events. Event-triggered mode starts one bounded
//! recording per motion_detected event, subject to the configured overlap
//! policy. Both modes copy frames from the camera source into an encoding
//! sink until the duration elapses or the stream ends.

use crate::capture::{EncodingProfile, VideoCapture, VideoEncoder};
use crate::config::{OverlapPolicy, RecordingConfig, StorageConfig};
use crate::events::{BusError, EventBus, EventKind};
use crate::registry::{CameraDescriptor, CameraRegistry};
use crate::tasks::{StartOutcome, TaskRegistry};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that end a recording task.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Capture(#[from] crate::capture::CaptureError),

    #[error(transparent)]
    Encode(#[from] crate::capture::EncodeError),
}

/// Errors that end the recorder service itself.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("cannot prepare recordings directory: {0}")]
    Storage(#[from] std::io::Error),
}

/// One completed (or in-progress) recording segment.
#[derive(Debug, Clone)]
pub struct RecordingSegment {
    pub camera: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub path: PathBuf,
}

/// Recording service: continuous segment loops plus event-triggered tasks.
pub struct Recorder {
    registry: Arc<CameraRegistry>,
    capture: Arc<dyn VideoCapture>,
    encoder: Arc<dyn VideoEncoder>,
    bus: EventBus,
    recording: RecordingConfig,
    output_dir: PathBuf,
    profile: EncodingProfile,
    event_tasks: Arc<TaskRegistry>,
    trigger_seq: AtomicU64,
}

impl Recorder {
    pub fn new(
        registry: Arc<CameraRegistry>,
        capture: Arc<dyn VideoCapture>,
        encoder: Arc<dyn VideoEncoder>,
        bus: EventBus,
        recording: RecordingConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            registry,
            capture,
            encoder,
            bus,
            recording,
            output_dir: storage.recordings_path.clone(),
            profile: EncodingProfile::default(),
            event_tasks: Arc::new(TaskRegistry::new()),
            trigger_seq: AtomicU64::new(0),
        }
    }

    /// Registry of live event-triggered recording tasks.
    pub fn event_tasks(&self) -> &TaskRegistry {
        &self.event_tasks
    }

    /// Run the recorder: start continuous loops if enabled, then consume
    /// motion events until cancelled or the bus closes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RecorderError> {
        std::fs::create_dir_all(&self.output_dir)?;

        if self.recording.continuous {
            for camera in self.registry.cameras() {
                self.spawn_continuous(camera.clone(), shutdown.child_token());
            }
        }

        let mut events = self.bus.subscribe();
        info!(
            continuous = self.recording.continuous,
            event_triggered = self.recording.event_triggered,
            output_dir = %self.output_dir.display(),
            "recorder started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("recorder stopping");
                    self.event_tasks.cancel_all();
                    return Ok(());
                }
                event = events.next() => {
                    let event = event?;
                    if event.kind == EventKind::MotionDetected && self.recording.event_triggered {
                        self.trigger(&event.camera);
                    }
                }
            }
        }
    }

    fn spawn_continuous(&self, camera: CameraDescriptor, token: CancellationToken) {
        let session = RecordSession {
            camera: camera.clone(),
            capture: self.capture.clone(),
            encoder: self.encoder.clone(),
            output_dir: self.output_dir.clone(),
            profile: self.profile.clone(),
        };
        let segment_duration = self.recording.segment_duration();
        let pause = self.recording.segment_pause();

        tokio::spawn(async move {
            info!(camera = %camera.name, "continuous recording started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                match session.record_segment(segment_duration).await {
                    Ok(segment) => info!(
                        camera = %camera.name,
                        path = %segment.path.display(),
                        "segment saved"
                    ),
                    Err(e) => {
                        error!(camera = %camera.name, error = %e, "segment recording failed")
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
            info!(camera = %camera.name, "continuous recording stopped");
        });
    }

    /// Start an event-triggered recording for a camera, honoring the
    /// overlap policy.
    fn trigger(&self, name: &str) {
        let Some(camera) = self.registry.get(name) else {
            warn!(camera = %name, "motion event for unknown camera");
            return;
        };

        let key = match self.recording.overlap {
            // Every trigger gets its own key, so recordings may overlap.
            OverlapPolicy::Allow => format!(
                "{}#{}",
                name,
                self.trigger_seq.fetch_add(1, Ordering::Relaxed)
            ),
            OverlapPolicy::Reject => name.to_string(),
        };

        let session = RecordSession {
            camera: camera.clone(),
            capture: self.capture.clone(),
            encoder: self.encoder.clone(),
            output_dir: self.output_dir.clone(),
            profile: self.profile.clone(),
        };
        let duration = self.recording.event_duration();

        let outcome = self.event_tasks.try_start(&key, move |token| async move {
            let camera = session.camera.name.clone();
            tokio::select! {
                _ = token.cancelled() => {
                    info!(camera = %camera, "recording cancelled");
                }
                result = session.record_segment(duration) => match result {
                    Ok(segment) => info!(
                        camera = %camera,
                        path = %segment.path.display(),
                        "recording saved"
                    ),
                    Err(e) => error!(camera = %camera, error = %e, "recording failed"),
                }
            }
        });

        match outcome {
            StartOutcome::Started => info!(camera = %name, "event-triggered recording started"),
            StartOutcome::AlreadyRunning => {
                debug!(camera = %name, "recording in progress, trigger dropped")
            }
        }
    }
}

/// Copies frames from one camera source into one segment file.
#[derive(Clone)]
struct RecordSession {
    camera: CameraDescriptor,
    capture: Arc<dyn VideoCapture>,
    encoder: Arc<dyn VideoEncoder>,
    output_dir: PathBuf,
    profile: EncodingProfile,
}

impl RecordSession {
    async fn record_segment(&self, duration: Duration) -> Result<RecordingSegment, RecordError> {
        let mut stream = self.capture.open(&self.camera.source).await?;

        let started_at = Utc::now();
        let started = Instant::now();
        let filename = format!(
            "{}_{}.{}",
            self.camera.name,
            started_at.format("%Y-%m-%d_%H-%M-%S"),
            self.profile.container
        );
        let path = self.output_dir.join(filename);

        let mut sink = self.encoder.create(&path, &self.profile).await?;
        let deadline = started + duration;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                frame = stream.read() => match frame {
                    Some(frame) => sink.write(&frame).await?,
                    None => {
                        warn!(
                            camera = %self.camera.name,
                            "stream ended before segment duration elapsed"
                        );
                        break;
                    }
                }
            }
        }

        sink.close().await?;

        Ok(RecordingSegment {
            camera: self.camera.name.clone(),
            started_at,
            duration: started.elapsed(),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fakes::{solid_frame, FakeCapture, FakeEncoder, SourceBehavior};
    use crate::config::WatchtowerConfig;
    use crate::events::Event;
    use crate::registry::{CameraKind, SourceLocator};

    fn camera(name: &str) -> CameraDescriptor {
        CameraDescriptor {
            name: name.to_string(),
            kind: CameraKind::Rtsp,
            source: SourceLocator::Url(format!("rtsp://{}/stream", name)),
            control_url: None,
        }
    }

    struct Fixture {
        recorder: Arc<Recorder>,
        capture: Arc<FakeCapture>,
        encoder: Arc<FakeEncoder>,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    fn fixture(cameras: Vec<CameraDescriptor>, recording: RecordingConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(FakeCapture::new());
        let encoder = Arc::new(FakeEncoder::new());
        let bus = EventBus::new(64);
        let storage = StorageConfig {
            recordings_path: dir.path().to_path_buf(),
        };
        let recorder = Arc::new(Recorder::new(
            Arc::new(CameraRegistry::build(cameras, Vec::new())),
            capture.clone(),
            encoder.clone(),
            bus.clone(),
            recording,
            &storage,
        ));
        Fixture {
            recorder,
            capture,
            encoder,
            bus,
            _dir: dir,
        }
    }

    fn endless() -> SourceBehavior {
        SourceBehavior::Endless(solid_frame(8, 8, 1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_mode_writes_segments() {
        let front = camera("front");
        let recording = RecordingConfig {
            continuous: true,
            event_triggered: false,
            segment_duration_secs: 1,
            segment_pause_secs: 0,
            ..RecordingConfig::default()
        };
        let fx = fixture(vec![front.clone()], recording);
        fx.capture.set(&front.source, endless());

        let shutdown = CancellationToken::new();
        let recorder = fx.recorder.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { recorder.run(token).await });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let closed = fx.encoder.closed.lock().clone();
        assert!(
            closed.len() >= 2,
            "expected at least 2 completed segments, got {}",
            closed.len()
        );
        for (path, frames) in &closed {
            assert!(path.exists());
            assert!(*frames > 0);
            assert!(path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("front_"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_triggers_start_independent_recordings() {
        let back = camera("back");
        let recording = RecordingConfig {
            event_triggered: true,
            duration_secs: 5,
            overlap: OverlapPolicy::Allow,
            ..RecordingConfig::default()
        };
        let fx = fixture(vec![back.clone()], recording);
        fx.capture.set(&back.source, endless());

        let shutdown = CancellationToken::new();
        let recorder = fx.recorder.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { recorder.run(token).await });
        tokio::task::yield_now().await;

        fx.bus.publish(Event::motion_detected("back", vec![0]));
        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.bus.publish(Event::motion_detected("back", vec![0]));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both recordings are live at once.
        assert_eq!(fx.recorder.event_tasks().running_count(), 2);
        assert_eq!(fx.encoder.open_sinks.load(std::sync::atomic::Ordering::SeqCst), 2);

        // After the first duration elapses, both complete independently.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fx.encoder.closed.lock().len(), 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_policy_drops_second_trigger() {
        let back = camera("back");
        let recording = RecordingConfig {
            event_triggered: true,
            duration_secs: 5,
            overlap: OverlapPolicy::Reject,
            ..RecordingConfig::default()
        };
        let fx = fixture(vec![back.clone()], recording);
        fx.capture.set(&back.source, endless());

        let shutdown = CancellationToken::new();
        let recorder = fx.recorder.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { recorder.run(token).await });
        tokio::task::yield_now().await;

        fx.bus.publish(Event::motion_detected("back", vec![0]));
        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.bus.publish(Event::motion_detected("back", vec![0]));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.recorder.event_tasks().running_count(), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_event_triggered_ignores_motion() {
        let back = camera("back");
        let recording = RecordingConfig {
            event_triggered: false,
            ..RecordingConfig::default()
        };
        let fx = fixture(vec![back.clone()], recording);
        fx.capture.set(&back.source, endless());

        let shutdown = CancellationToken::new();
        let recorder = fx.recorder.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { recorder.run(token).await });
        tokio::task::yield_now().await;

        fx.bus.publish(Event::motion_detected("back", vec![0]));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.recorder.event_tasks().running_count(), 0);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_aborts_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let session = RecordSession {
            camera: camera("front"),
            capture: Arc::new(FakeCapture::new()),
            encoder: Arc::new(FakeEncoder::new()),
            output_dir: dir.path().to_path_buf(),
            profile: EncodingProfile::default(),
        };

        let result = session.record_segment(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RecordError::Capture(_))));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_encoder_failure_aborts_segment() {
        let front = camera("front");
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(FakeCapture::new());
        capture.set(&front.source, endless());
        let session = RecordSession {
            camera: front,
            capture,
            encoder: Arc::new(FakeEncoder::failing()),
            output_dir: dir.path().to_path_buf(),
            profile: EncodingProfile::default(),
        };

        let result = session.record_segment(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RecordError::Encode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_closes_segment_early() {
        let front = camera("front");
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(FakeCapture::new());
        capture.set(
            &front.source,
            SourceBehavior::Frames(vec![solid_frame(8, 8, 1); 3]),
        );
        let encoder = Arc::new(FakeEncoder::new());
        let session = RecordSession {
            camera: front,
            capture,
            encoder: encoder.clone(),
            output_dir: dir.path().to_path_buf(),
            profile: EncodingProfile::default(),
        };

        let segment = session.record_segment(Duration::from_secs(60)).await.unwrap();
        assert!(segment.path.exists());
        let closed = encoder.closed.lock().clone();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1, 3);
    }

    #[tokio::test]
    async fn test_trigger_for_unknown_camera_is_ignored() {
        let config = WatchtowerConfig::default();
        let fx = fixture(Vec::new(), config.recording.clone());
        fx.recorder.trigger("ghost");
        assert_eq!(fx.recorder.event_tasks().running_count(), 0);
    }
}
