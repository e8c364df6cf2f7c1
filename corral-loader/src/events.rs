//! Lifecycle notifications published by the reconciliation engine.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Capacity of the lifecycle broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    /// An entry is about to be resolved and instantiated
    Apply { id: String, name: String },
    /// A live entry is being torn down
    Unload { id: String, name: String },
    /// A live entry finished applying a new config
    Reload { id: String, name: String },
    /// The declared list was persisted
    ConfigWritten,
    /// Initial reconciliation finished
    Ready,
    /// The worker is about to exit for a restart
    FullReload { code: i32 },
}

impl LoaderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderEvent::Apply { .. } => "apply",
            LoaderEvent::Unload { .. } => "unload",
            LoaderEvent::Reload { .. } => "reload",
            LoaderEvent::ConfigWritten => "config",
            LoaderEvent::Ready => "ready",
            LoaderEvent::FullReload { .. } => "full-reload",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderEventMessage {
    pub event: LoaderEvent,
    pub timestamp: DateTime<Utc>,
}

impl LoaderEventMessage {
    pub fn new(event: LoaderEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }
}

pub type LoaderEventSender = broadcast::Sender<LoaderEventMessage>;
pub type LoaderEventReceiver = broadcast::Receiver<LoaderEventMessage>;

pub fn loader_event_channel() -> (LoaderEventSender, LoaderEventReceiver) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
