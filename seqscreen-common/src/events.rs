//! Event types for the SeqScreen event system
//!
//! The orchestrator broadcasts run progress over an [`EventBus`] so hosts
//! (HTTP SSE, CLI progress output) can observe a run without polling.
//! Emission is lossy: a run never fails because nobody is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{Decision, StageName};

/// Validation run lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ValidationEvent {
    /// A validation run started
    ValidationStarted {
        validation_id: Uuid,
        dataset_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A pipeline stage started executing
    StageStarted {
        validation_id: Uuid,
        stage: StageName,
        timestamp: DateTime<Utc>,
    },

    /// A pipeline stage finished
    StageCompleted {
        validation_id: Uuid,
        stage: StageName,
        passed: bool,
        issue_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// The run finished and a report was assembled
    ValidationCompleted {
        validation_id: Uuid,
        decision: Decision,
        execution_time_seconds: f64,
        short_circuited: bool,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`ValidationEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ValidationEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events. Events emitted before subscription
    /// are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ValidationEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the case where no subscribers are listening.
    pub fn emit_lossy(&self, event: ValidationEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
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

    #[test]
    fn emit_lossy_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit_lossy(ValidationEvent::ValidationStarted {
            validation_id: Uuid::new_v4(),
            dataset_id: "ds".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.emit_lossy(ValidationEvent::StageStarted {
            validation_id: id,
            stage: StageName::Schema,
            timestamp: Utc::now(),
        });
        bus.emit_lossy(ValidationEvent::StageCompleted {
            validation_id: id,
            stage: StageName::Schema,
            passed: true,
            issue_count: 0,
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            ValidationEvent::StageStarted { stage, .. } => assert_eq!(stage, StageName::Schema),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ValidationEvent::StageCompleted { passed, .. } => assert!(passed),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ValidationEvent::ValidationCompleted {
            validation_id: Uuid::new_v4(),
            decision: Decision::Accepted,
            execution_time_seconds: 0.5,
            short_circuited: false,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ValidationCompleted");
        assert_eq!(json["decision"], "accepted");
    }
}
