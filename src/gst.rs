//! GStreamer-backed capture and encode providers.
//!
//! Network cameras are read through an `rtspsrc` decode pipeline ending in
//! an appsink; USB cameras through `v4l2src`. Segments are written through
//! an appsrc pipeline ending in a filesink. Both sides hand raw RGB frames
//! across the provider traits, so the rest of the system never sees a
//! GStreamer type.

use crate::capture::{
    CaptureError, EncodeError, EncodingProfile, Frame, FrameStream, VideoCapture, VideoEncoder,
    VideoSink,
};
use crate::registry::SourceLocator;
use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::Path;
use tracing::{debug, warn};

/// How long to wait for a pipeline to reach the Playing state.
const STATE_CHANGE_TIMEOUT_SECS: u64 = 10;

/// How long a frame read waits before treating the stream as stalled.
const READ_TIMEOUT_SECS: u64 = 5;

/// Capture provider over GStreamer decode pipelines.
pub struct GstCapture;

impl GstCapture {
    pub fn new() -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::Init(e.to_string()))?;
        Ok(Self)
    }

    fn pipeline_description(locator: &SourceLocator) -> String {
        let source = match locator {
            SourceLocator::Url(url) => format!(
                "rtspsrc location={url} latency=200 \
                 ! rtph264depay ! h264parse ! avdec_h264"
            ),
            SourceLocator::Device(index) => format!("v4l2src device=/dev/video{index}"),
        };
        format!(
            "{source} ! videoconvert ! video/x-raw,format=RGB \
             ! appsink name=sink sync=false max-buffers=2 drop=true"
        )
    }
}

#[async_trait]
impl VideoCapture for GstCapture {
    async fn open(&self, locator: &SourceLocator) -> Result<Box<dyn FrameStream>, CaptureError> {
        let description = Self::pipeline_description(locator);
        debug!(pipeline = %description, "creating capture pipeline");

        let open_failed =
            |message: String| CaptureError::OpenFailed(locator.to_string(), message);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| open_failed(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_failed("not a pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_failed("appsink element missing".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_failed("could not cast to AppSink".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_failed(e.to_string()))?;

        // Wait for the stream to actually start.
        let (result, _state, _pending) =
            pipeline.state(gst::ClockTime::from_seconds(STATE_CHANGE_TIMEOUT_SECS));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_failed("timeout waiting for stream".to_string()));
        }

        Ok(Box::new(GstStream { pipeline, appsink }))
    }
}

struct GstStream {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

#[async_trait]
impl FrameStream for GstStream {
    async fn read(&mut self) -> Option<Frame> {
        let appsink = self.appsink.clone();
        let sample = tokio::task::spawn_blocking(move || {
            appsink.try_pull_sample(gst::ClockTime::from_seconds(READ_TIMEOUT_SECS))
        })
        .await
        .ok()??;

        let buffer = sample.buffer()?;
        let caps = sample.caps()?;
        let structure = caps.structure(0)?;
        let width = structure.get::<i32>("width").ok()? as u32;
        let height = structure.get::<i32>("height").ok()? as u32;

        let map = buffer.map_readable().ok()?;
        Some(Frame {
            data: Bytes::copy_from_slice(map.as_slice()),
            width,
            height,
        })
    }
}

impl Drop for GstStream {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Encode provider writing AVI segments through an appsrc pipeline.
pub struct GstEncoder;

impl GstEncoder {
    pub fn new() -> Result<Self, EncodeError> {
        gst::init().map_err(|e| EncodeError::Init(e.to_string()))?;
        Ok(Self)
    }

    fn pipeline_description(path: &Path) -> String {
        format!(
            "appsrc name=src is-live=true format=time \
             ! videoconvert ! x264enc tune=zerolatency ! avimux \
             ! filesink location={}",
            path.display()
        )
    }
}

#[async_trait]
impl VideoEncoder for GstEncoder {
    async fn create(
        &self,
        path: &Path,
        profile: &EncodingProfile,
    ) -> Result<Box<dyn VideoSink>, EncodeError> {
        let description = Self::pipeline_description(path);
        debug!(pipeline = %description, "creating encode pipeline");

        let create_failed =
            |message: String| EncodeError::CreateFailed(path.display().to_string(), message);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| create_failed(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| create_failed("not a pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| create_failed("appsrc element missing".to_string()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| create_failed("could not cast to AppSrc".to_string()))?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", profile.width as i32)
            .field("height", profile.height as i32)
            .field("framerate", gst::Fraction::new(profile.fps as i32, 1))
            .build();
        appsrc.set_caps(Some(&caps));

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| create_failed(e.to_string()))?;

        let frame_duration = gst::ClockTime::from_nseconds((1e9 / profile.fps) as u64);

        Ok(Box::new(GstSink {
            pipeline,
            appsrc,
            frame_duration,
            frames_written: 0,
        }))
    }
}

struct GstSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    frame_duration: gst::ClockTime,
    frames_written: u64,
}

#[async_trait]
impl VideoSink for GstSink {
    async fn write(&mut self, frame: &Frame) -> Result<(), EncodeError> {
        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(
                self.frame_duration.nseconds() * self.frames_written,
            ));
            buffer.set_duration(self.frame_duration);
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncodeError::WriteFailed(e.to_string()))?;
        self.frames_written += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), EncodeError> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| EncodeError::CloseFailed(e.to_string()))?;

        // Let the muxer flush before tearing the pipeline down.
        if let Some(bus) = self.pipeline.bus() {
            let message = tokio::task::spawn_blocking(move || {
                bus.timed_pop_filtered(
                    gst::ClockTime::from_seconds(READ_TIMEOUT_SECS),
                    &[gst::MessageType::Eos, gst::MessageType::Error],
                )
            })
            .await
            .ok()
            .flatten();

            if let Some(message) = message {
                if let gst::MessageView::Error(err) = message.view() {
                    warn!(error = %err.error(), "encode pipeline error on close");
                }
            }
        }

        let _ = self.pipeline.set_state(gst::State::Null);
        Ok(())
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
