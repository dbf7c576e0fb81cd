//! Event system for the playback session
//!
//! The session communicates outward through a broadcast bus:
//! - **EventBus** (tokio::broadcast): one-to-many lifecycle events for UI
//!   status indicators and animation glue
//! - **watch channel** (see `amplitude`): the continuous loudness signal
//!
//! Events are serializable so the surrounding client can forward them over
//! whatever surface it exposes.

use crate::types::UtteranceId;
use serde::Serialize;
use tokio::sync::broadcast;

/// Lifecycle events emitted by the playback session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Playback transitioned idle → active (first unit committed).
    PlaybackStarted {
        utterance: UtteranceId,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The last in-flight unit completed with nothing left buffered.
    PlaybackIdle {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The current utterance changed (new announcement accepted).
    UtteranceChanged {
        from: Option<UtteranceId>,
        to: UtteranceId,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The user barged in over assistant output.
    UtteranceInterrupted {
        utterance: UtteranceId,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The session was flushed (teardown, not barge-in).
    SessionFlushed {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for session events.
///
/// Subscribers that fall behind lose the oldest events; emission never
/// blocks the pipeline.
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the absence of subscribers.
    pub fn emit_lossy(&self, event: SessionEvent) {
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

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(64);
        assert_eq!(bus.capacity(), 64);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_without_subscribers_is_lossy() {
        let bus = EventBus::new(16);
        bus.emit_lossy(SessionEvent::PlaybackIdle {
            timestamp: chrono::Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit_lossy(SessionEvent::PlaybackStarted {
            utterance: "u1".into(),
            timestamp: chrono::Utc::now(),
        });

        match rx.recv().await.unwrap() {
            SessionEvent::PlaybackStarted { utterance, .. } => {
                assert_eq!(utterance.as_str(), "u1");
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::UtteranceChanged {
            from: None,
            to: "u2".into(),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("UtteranceChanged"));
        assert!(json.contains("u2"));
    }
}
