//! Core event bus
//!
//! Broadcast channel of domain events so collaborators (the RPC layer, a
//! future WS feed) can subscribe instead of polling processing status.

use serde::Serialize;
use tokio::sync::broadcast;

/// Domain events emitted by the core
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    ReminderScheduled { reminder_id: String, user_id: String, scheduled_time: String },
    ReminderSent { reminder_id: String, user_id: String },
    ReminderEscalated { reminder_id: String, user_id: String, level: i64 },
    ReminderAcknowledged { reminder_id: String, user_id: String },
    ReminderCompleted { reminder_id: String, user_id: String },
    ReminderMissed { reminder_id: String, user_id: String },
    FollowUpsAdded { reminder_id: String, user_id: String, count: usize },
    ResponseQueued { response_id: String, user_id: String },
    ResponseCompleted { response_id: String, user_id: String },
    ResponseFailed { response_id: String, user_id: String, error: String },
    SessionConsolidated { reminder_id: String, user_id: String },
}

/// Cloneable handle to the broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget: no subscribers is not an error
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::ResponseQueued {
            response_id: "r1".into(),
            user_id: "u1".into(),
        });
        match rx.recv().await.unwrap() {
            CoreEvent::ResponseQueued { response_id, .. } => assert_eq!(response_id, "r1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(CoreEvent::ReminderMissed { reminder_id: "x".into(), user_id: "u".into() });
    }
}
