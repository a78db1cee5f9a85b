//! Status event bus.
//!
//! Lifecycle events from imports, publishes and streams are sent upstream to
//! the Node's realtime channel and fanned out to local subscribers. Events the
//! Node relays back ("echoes") can carry stop transitions, which are enforced
//! on the matching tracker before being re-broadcast. The echo of a stop this
//! agent originated is not enforced on a newer run of the same video.

use crate::encode::{OutputFormat, Resolution};
use crate::tracker::{TrackerKind, Trackers};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Default channel capacity for local subscribers.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Why a live stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// A stop request ended it
    UserStopped,
    /// The encoder exited on its own
    ProcessExited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
}

/// A lifecycle transition for one video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum VideoEvent {
    Importing {
        video_id: String,
        progress: u8,
    },
    Imported {
        video_id: String,
        length_seconds: f64,
    },
    ImportingStopping {
        video_id: String,
    },
    ImportingStopped {
        video_id: String,
    },
    Publishing {
        video_id: String,
        format: OutputFormat,
        resolution: Resolution,
        progress: u8,
    },
    PublishingFailed {
        video_id: String,
        format: OutputFormat,
        resolution: Resolution,
        message: String,
    },
    Published {
        video_id: String,
        length_seconds: f64,
    },
    PublishingStopping {
        video_id: String,
    },
    PublishingStopped {
        video_id: String,
    },
    Streaming {
        video_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length_seconds: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bandwidth: Option<u64>,
    },
    StreamingStopping {
        video_id: String,
    },
    StreamingStopped {
        video_id: String,
        reason: StopReason,
    },
    Error {
        video_id: String,
        message: String,
    },
}

/// Stop phase carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopPhase {
    Stopping,
    Stopped,
}

impl VideoEvent {
    pub fn video_id(&self) -> &str {
        match self {
            VideoEvent::Importing { video_id, .. }
            | VideoEvent::Imported { video_id, .. }
            | VideoEvent::ImportingStopping { video_id }
            | VideoEvent::ImportingStopped { video_id }
            | VideoEvent::Publishing { video_id, .. }
            | VideoEvent::PublishingFailed { video_id, .. }
            | VideoEvent::Published { video_id, .. }
            | VideoEvent::PublishingStopping { video_id }
            | VideoEvent::PublishingStopped { video_id }
            | VideoEvent::Streaming { video_id, .. }
            | VideoEvent::StreamingStopping { video_id }
            | VideoEvent::StreamingStopped { video_id, .. }
            | VideoEvent::Error { video_id, .. } => video_id,
        }
    }

    /// Stop transition this event denotes, with the tracker it targets
    pub fn stop_transition(&self) -> Option<(TrackerKind, StopPhase)> {
        match self {
            VideoEvent::ImportingStopping { .. } => Some((TrackerKind::Import, StopPhase::Stopping)),
            VideoEvent::ImportingStopped { .. } => Some((TrackerKind::Import, StopPhase::Stopped)),
            VideoEvent::PublishingStopping { .. } => {
                Some((TrackerKind::Encoding, StopPhase::Stopping))
            }
            VideoEvent::PublishingStopped { .. } => Some((TrackerKind::Encoding, StopPhase::Stopped)),
            VideoEvent::StreamingStopping { .. } => Some((TrackerKind::Stream, StopPhase::Stopping)),
            VideoEvent::StreamingStopped { .. } => Some((TrackerKind::Stream, StopPhase::Stopped)),
            _ => None,
        }
    }
}

/// What local subscribers receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Relayed back by the Node rather than originated here
    pub echoed: bool,
    pub event: VideoEvent,
}

/// Realtime channel frame exchanged with the Node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeFrame {
    pub event_name: String,
    pub data: serde_json::Value,
}

impl RealtimeFrame {
    pub const ECHO: &'static str = "echo";

    pub fn echo(event: &VideoEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_name: Self::ECHO.to_string(),
            data: serde_json::to_value(event)?,
        })
    }

    /// The lifecycle event inside an echo frame, if this is one
    pub fn into_echoed_event(self) -> Option<VideoEvent> {
        if self.event_name != Self::ECHO {
            return None;
        }
        serde_json::from_value(self.data).ok()
    }
}

type StopKey = (TrackerKind, String, StopPhase);

/// Fan-out point for lifecycle events
pub struct StatusBus {
    local: broadcast::Sender<BusMessage>,
    upstream: mpsc::UnboundedSender<VideoEvent>,
    trackers: Arc<Trackers>,
    /// Entry generation of each stop sent upstream, until its echo returns
    sent_stops: Mutex<HashMap<StopKey, u64>>,
}

impl StatusBus {
    /// Create a bus; the receiver yields every event bound for the Node.
    pub fn new(trackers: Arc<Trackers>) -> (Self, mpsc::UnboundedReceiver<VideoEvent>) {
        Self::with_capacity(trackers, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        trackers: Arc<Trackers>,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<VideoEvent>) {
        let (local, _) = broadcast::channel(capacity);
        let (upstream, upstream_rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                upstream,
                trackers,
                sent_stops: Mutex::new(HashMap::new()),
            },
            upstream_rx,
        )
    }

    /// Subscribe to every event, local and echoed.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.local.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.local.receiver_count()
    }

    /// Send an originated event upstream and to local subscribers.
    pub fn publish(&self, event: VideoEvent) {
        debug!(video_id = %event.video_id(), ?event, "Publishing status event");
        if let Some((kind, phase)) = event.stop_transition() {
            let video_id = event.video_id();
            if let Some(entry) = self.trackers.get(kind).get(video_id) {
                self.sent_stops
                    .lock()
                    .insert((kind, video_id.to_string(), phase), entry.generation());
            }
        }
        if self.upstream.send(event.clone()).is_err() {
            debug!("Realtime link closed; event not forwarded upstream");
        }
        // no subscribers is fine
        let _ = self.local.send(BusMessage {
            echoed: false,
            event,
        });
    }

    /// Handle an event relayed back by the Node.
    pub fn receive_echo(&self, event: VideoEvent) {
        if let Some((kind, phase)) = event.stop_transition() {
            let video_id = event.video_id();
            let sent = self
                .sent_stops
                .lock()
                .remove(&(kind, video_id.to_string(), phase));
            let entry = self
                .trackers
                .get(kind)
                .get(video_id)
                .filter(|entry| sent.map_or(true, |generation| generation == entry.generation()));
            if sent.is_some() && entry.is_none() {
                debug!(video_id, %kind, "Echo of a stop for an earlier run");
            }
            if let Some(entry) = entry {
                match phase {
                    StopPhase::Stopping => {
                        if entry.cancellation().request_stop() {
                            info!(video_id = %event.video_id(), %kind, "Stop requested via echo");
                        }
                    }
                    StopPhase::Stopped => {
                        entry.cancellation().request_stop();
                        entry.cancellation().terminate();
                    }
                }
            }
        }

        let _ = self.local.send(BusMessage {
            echoed: true,
            event,
        });
    }
}
