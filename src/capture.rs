//! Provider traits for the external video capture and encode library.
//!
//! The monitoring services never touch a camera or a codec directly; they go
//! through [`VideoCapture`] to read frames and [`VideoEncoder`] to write
//! segments. The GStreamer-backed implementations live in the `gst` module
//! (feature `gstreamer`); tests use in-memory fakes.

use crate::registry::SourceLocator;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;

/// Errors from a capture provider.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture backend init failed: {0}")]
    Init(String),

    #[error("failed to open source {0}: {1}")]
    OpenFailed(String, String),
}

/// Errors from an encode provider.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder init failed: {0}")]
    Init(String),

    #[error("failed to create sink {0}: {1}")]
    CreateFailed(String, String),

    #[error("failed to write frame: {0}")]
    WriteFailed(String),

    #[error("failed to close sink: {0}")]
    CloseFailed(String),
}

/// A single RGB24 video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn rgb(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            width,
            height,
        }
    }

    /// A frame with no pixel data; treated as a failed read by health checks.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encoding profile for recording sinks.
#[derive(Debug, Clone)]
pub struct EncodingProfile {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Container extension for segment filenames
    pub container: String,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            fps: 20.0,
            width: 640,
            height: 480,
            container: "avi".to_string(),
        }
    }
}

/// Opens camera sources and yields frame streams.
#[async_trait]
pub trait VideoCapture: Send + Sync {
    /// Open a source. The handle is released when the stream is dropped.
    async fn open(&self, locator: &SourceLocator) -> Result<Box<dyn FrameStream>, CaptureError>;
}

/// A stream of frames from an open source.
#[async_trait]
pub trait FrameStream: Send {
    /// Read the next frame. `None` means end of stream or source failure;
    /// the stream yields nothing further after that.
    async fn read(&mut self) -> Option<Frame>;
}

/// Creates encoding sinks for recording segments.
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn create(
        &self,
        path: &Path,
        profile: &EncodingProfile,
    ) -> Result<Box<dyn VideoSink>, EncodeError>;
}

/// An open segment file accepting frames.
#[async_trait]
pub trait VideoSink: Send {
    async fn write(&mut self, frame: &Frame) -> Result<(), EncodeError>;

    /// Finalize and close the segment file.
    async fn close(self: Box<Self>) -> Result<(), EncodeError>;
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[test]
    fn test_empty_frame() {
        let frame = Frame::rgb(0, 0, Vec::new());
        assert!(frame.is_empty());
        assert!(!solid_frame(2, 2, 0).is_empty());
    }

    #[test]
    fn test_default_profile() {
        let profile = EncodingProfile::default();
        assert_eq!(profile.fps, 20.0);
        assert_eq!((profile.width, profile.height), (640, 480));
        assert_eq!(profile.container, "avi");
    }

    #[tokio::test]
    async fn test_fake_capture_finite_stream() {
        let capture = FakeCapture::new();
        let locator = SourceLocator::Url("rtsp://cam/1".to_string());
        capture.set(
            &locator,
            SourceBehavior::Frames(vec![solid_frame(2, 2, 1), solid_frame(2, 2, 2)]),
        );

        let mut stream = capture.open(&locator).await.unwrap();
        assert!(stream.read().await.is_some());
        assert!(stream.read().await.is_some());
        assert!(stream.read().await.is_none());
    }

    #[tokio::test]
    async fn test_fake_capture_unreachable() {
        let capture = FakeCapture::new();
        let locator = SourceLocator::Device(0);
        assert!(matches!(
            capture.open(&locator).await,
            Err(CaptureError::OpenFailed(..))
        ));
    }

    #[test]
    fn test_frame_with_rect() {
        let frame = frame_with_rect(4, 4, 0, (1, 1, 2, 2), 255);
        // Pixel (1,1) is inside the rectangle, (0,0) is not.
        assert_eq!(frame.data[(1 * 4 + 1) * 3], 255);
        assert_eq!(frame.data[0], 0);
    }
}
