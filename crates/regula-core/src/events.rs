//! Change notifications and the event bus that fans them out.
//!
//! Record transitions reach the bus from two places: the scan worker emits
//! directly after each write, and the PostgreSQL `LISTEN` bridge in
//! `regula-db` republishes transitions made by other writers. Every open
//! status stream holds its own subscription.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::CheckStatus;

/// A change notification.
///
/// Serialized as JSON with a `type` tag, e.g.
/// `{"type":"check_updated","check_id":"...","organization_id":"...","status":"processing"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A check record changed status (or sub-status).
    CheckUpdated {
        check_id: Uuid,
        organization_id: Uuid,
        status: CheckStatus,
        #[serde(default = "Utc::now")]
        occurred_at: DateTime<Utc>,
    },
}

impl ServerEvent {
    pub fn check_updated(check_id: Uuid, organization_id: Uuid, status: CheckStatus) -> Self {
        ServerEvent::CheckUpdated {
            check_id,
            organization_id,
            status,
            occurred_at: Utc::now(),
        }
    }

    /// Event type name used in logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::CheckUpdated { .. } => "check.updated",
        }
    }

    pub fn check_id(&self) -> Uuid {
        match self {
            ServerEvent::CheckUpdated { check_id, .. } => *check_id,
        }
    }

    pub fn organization_id(&self) -> Uuid {
        match self {
            ServerEvent::CheckUpdated {
                organization_id, ..
            } => *organization_id,
        }
    }
}

/// Broadcast-based event bus for distributing change notifications.
///
/// Slow receivers that fall behind get a `Lagged` error and miss events;
/// stream consumers recover by recomputing from the store.
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, event: ServerEvent) {
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_type = event.event_type(),
            check_id = %event.check_id(),
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to receive events. Each subscriber gets its own independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let check_id = Uuid::new_v4();

        bus.emit(ServerEvent::check_updated(
            check_id,
            Uuid::nil(),
            CheckStatus::Processing,
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.check_id(), check_id);
        assert_eq!(event.event_type(), "check.updated");
    }

    #[tokio::test]
    async fn test_event_bus_no_subscribers_ok() {
        let bus = EventBus::new(32);
        bus.emit(ServerEvent::check_updated(
            Uuid::nil(),
            Uuid::nil(),
            CheckStatus::Failed,
        ));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_count_tracks_drops() {
        let bus = EventBus::new(8);
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx2);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_parses_notify_payload_without_timestamp() {
        let payload = r#"{"type":"check_updated","check_id":"00000000-0000-0000-0000-000000000001","organization_id":"00000000-0000-0000-0000-000000000002","status":"completed"}"#;
        let event: ServerEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.check_id(), Uuid::from_u128(1));
        assert_eq!(event.organization_id(), Uuid::from_u128(2));
        assert!(matches!(
            event,
            ServerEvent::CheckUpdated {
                status: CheckStatus::Completed,
                ..
            }
        ));
    }
}
