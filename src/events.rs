//! Event types and the in-process fanout bus.
//!
//! Every component publishes to and subscribes from one [`EventBus`]. The bus
//! is fanout: each subscriber receives its own copy of every event published
//! after it subscribed, in publish order. There is no history replay and no
//! acknowledgment from subscribers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Errors that can occur on the event bus.
///
/// The bus lives in-process, so the only failure mode is a subscriber
/// outliving every bus handle. Per the error handling design this is fatal
/// to the owning service loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
}

/// Kind of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CameraOnline,
    CameraOffline,
    MotionDetected,
}

/// An immutable event passed through the bus.
///
/// The serde representation is a stable wire format, so serialized events
/// can be bridged to an external broker unchanged:
/// `{"type", "camera", "url"?, "zones"?, "timestamp"}` with the timestamp
/// in epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Camera name the event refers to
    pub camera: String,

    /// Stream URL, present for status events of network cameras
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Triggered zone indices, ascending, present for motion events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<usize>>,

    /// Epoch seconds at publish time
    pub timestamp: f64,
}

impl Event {
    /// Build a camera_online event.
    pub fn camera_online(camera: impl Into<String>, url: Option<String>) -> Self {
        Self {
            kind: EventKind::CameraOnline,
            camera: camera.into(),
            url,
            zones: None,
            timestamp: epoch_now(),
        }
    }

    /// Build a camera_offline event.
    pub fn camera_offline(camera: impl Into<String>, url: Option<String>) -> Self {
        Self {
            kind: EventKind::CameraOffline,
            camera: camera.into(),
            url,
            zones: None,
            timestamp: epoch_now(),
        }
    }

    /// Build a motion_detected event with the triggered zone indices.
    pub fn motion_detected(camera: impl Into<String>, zones: Vec<usize>) -> Self {
        Self {
            kind: EventKind::MotionDetected,
            camera: camera.into(),
            url: None,
            zones: Some(zones),
            timestamp: epoch_now(),
        }
    }
}

fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Fanout publish/subscribe bus over a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Fire-and-forget: returns
    /// once the event is handed to the channel, without waiting for any
    /// subscriber.
    ///
    /// Publishing never fails. The channel stays open as long as this bus
    /// (or any clone) exists, so the only send failure is the absence of
    /// subscribers, and that drops the event with a trace log.
    pub fn publish(&self, event: Event) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(kind = ?event.kind, camera = %event.camera, "no subscribers, event dropped");
        }
    }

    /// Create an independent subscription. Only events published after this
    /// call are delivered.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A single subscriber's view of the bus, delivering events in publish order.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Wait for the next event.
    ///
    /// If this subscriber fell behind the bus capacity, the skipped events
    /// are logged and delivery resumes from the oldest retained event.
    pub async fn next(&mut self) -> Result<Event, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fanout_delivery() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::camera_online("front", None));

        let ev_a = a.next().await.unwrap();
        let ev_b = b.next().await.unwrap();
        assert_eq!(ev_a, ev_b);
        assert_eq!(ev_a.kind, EventKind::CameraOnline);
        assert_eq!(ev_a.camera, "front");
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_later_events() {
        let bus = EventBus::new(16);
        let mut early = bus.subscribe();

        bus.publish(Event::camera_online("front", None));

        let mut late = bus.subscribe();
        bus.publish(Event::camera_offline("front", None));

        assert_eq!(early.next().await.unwrap().kind, EventKind::CameraOnline);
        assert_eq!(early.next().await.unwrap().kind, EventKind::CameraOffline);
        // The late subscriber never sees the first event.
        assert_eq!(late.next().await.unwrap().kind, EventKind::CameraOffline);
    }

    #[tokio::test]
    async fn test_publish_order_within_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();

        for name in ["a", "b", "c"] {
            bus.publish(Event::camera_online(name, None));
        }

        for name in ["a", "b", "c"] {
            assert_eq!(sub.next().await.unwrap().camera, name);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_drops_event() {
        let bus = EventBus::new(4);
        bus.publish(Event::camera_online("front", None));

        // The bus stays usable for later subscribers.
        let mut sub = bus.subscribe();
        bus.publish(Event::camera_offline("front", None));
        assert_eq!(sub.next().await.unwrap().kind, EventKind::CameraOffline);
    }

    #[tokio::test]
    async fn test_publish_after_last_subscriber_drops() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        drop(sub);

        // The send hits a channel with zero receivers; that is the benign
        // no-subscriber case, not a closed bus.
        bus.publish(Event::camera_online("front", None));

        let mut sub = bus.subscribe();
        bus.publish(Event::camera_offline("front", None));
        assert_eq!(sub.next().await.unwrap().kind, EventKind::CameraOffline);
    }

    #[test]
    fn test_wire_format_status_event() {
        let mut event = Event::camera_online("front", Some("rtsp://cam:554/s".to_string()));
        event.timestamp = 1700000000.5;

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "camera_online",
                "camera": "front",
                "url": "rtsp://cam:554/s",
                "timestamp": 1700000000.5,
            })
        );
    }

    #[test]
    fn test_wire_format_motion_event() {
        let mut event = Event::motion_detected("back", vec![0, 2]);
        event.timestamp = 1700000001.0;

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "motion_detected",
                "camera": "back",
                "zones": [0, 2],
                "timestamp": 1700000001.0,
            })
        );

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }
}
