//! Event system for the Chorale playback engine.
//!
//! # Architecture
//!
//! Chorale uses hybrid communication:
//! - **EventBus** (tokio::broadcast): one-to-many notification broadcasting
//! - **Command methods** on the engine: caller → engine, processed in order
//! - **Shared state** (Arc<RwLock<T>>): read-heavy access
//!
//! The engine emits every externally visible notification through the bus;
//! collaborators (UI, visualisers, scrobblers) subscribe and filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::metadata::MetaBundle;

/// Logical playback state of the engine
///
/// `StateChanged` fires exactly on transitions between these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// No stream, or nothing loaded
    Empty,
    /// A stream exists and media is set, but nothing is playing
    Idle,
    Playing,
    Paused,
}

/// Notifications emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// The logical playback state changed
    StateChanged {
        state: EngineState,
        timestamp: DateTime<Utc>,
    },

    /// The current track finished playing on its own
    TrackEnded { timestamp: DateTime<Utc> },

    /// New metadata for the current stream (title or artist changed)
    MetaData {
        bundle: MetaBundle,
        timestamp: DateTime<Utc>,
    },

    /// A failure that aborted a command
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Short transient status line (buffering progress, redirects)
    StatusText {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Advisory message with user-facing body, rate limited by the engine
    InfoMessage {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn state_changed(state: EngineState) -> Self {
        EngineEvent::StateChanged {
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn track_ended() -> Self {
        EngineEvent::TrackEnded {
            timestamp: Utc::now(),
        }
    }

    pub fn metadata(bundle: MetaBundle) -> Self {
        EngineEvent::MetaData {
            bundle,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        EngineEvent::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status_text(message: impl Into<String>) -> Self {
        EngineEvent::StatusText {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info_message(message: impl Into<String>) -> Self {
        EngineEvent::InfoMessage {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast bus carrying engine notifications
///
/// Thin wrapper over `tokio::sync::broadcast` so emitters do not have to
/// care whether anyone is listening.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, returning the number of subscribers that received it
    pub fn emit(&self, event: EngineEvent) -> crate::Result<usize> {
        self.tx
            .send(event)
            .map_err(|e| crate::Error::NoSubscribers(format!("{:?}", e.0)))
    }

    /// Emit an event, silently dropping it when nobody is listening
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_eventbus_subscribe() {
        let bus = EventBus::new(100);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_eventbus_emit_no_subscribers() {
        let bus = EventBus::new(100);
        assert!(bus.emit(EngineEvent::track_ended()).is_err());
    }

    #[tokio::test]
    async fn test_eventbus_emit_with_subscriber() {
        let bus = Arc::new(EventBus::new(100));
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::state_changed(EngineState::Playing))
            .unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::StateChanged { state, .. } => {
                assert_eq!(state, EngineState::Playing);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eventbus_emit_lossy() {
        let bus = EventBus::new(100);
        // Should not panic even without subscribers
        bus.emit_lossy(EngineEvent::status_text("Buffering 50%"));
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Playing, EngineState::Playing);
        assert_ne!(EngineState::Playing, EngineState::Paused);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&EngineEvent::error("boom")).unwrap();
        assert!(json.contains("\"type\":\"Error\""));
        assert!(json.contains("boom"));
    }
}
