//! Broadcast sink for operation state deltas.
//!
//! The engine has one authoritative state (the operation tree) and one
//! broadcast channel. Delivery is best-effort and non-blocking: a slow
//! subscriber drops messages rather than stalling the orchestrator. For a
//! given operation id, events reach each subscriber in emission order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Kind of state delta being broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new operation was created; subscribers should drop stale state.
    OperationReset,
    /// The operation-level status changed.
    OperationStatus,
    /// A step changed status or made progress.
    StepProgress,
    /// The operation reached a terminal state. Always the last event
    /// carrying this operation's id.
    OperationComplete,
    /// Out-of-band hint that a named component should re-fetch. Carries
    /// no operation id and may interleave with per-operation events.
    Refresh,
}

/// A single broadcast event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl OperationEvent {
    fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            operation_id: None,
            step_id: None,
            status: None,
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn reset(operation_id: &str) -> Self {
        let mut event = Self::new(EventType::OperationReset);
        event.operation_id = Some(operation_id.to_string());
        event
    }

    pub fn operation_status(operation_id: &str, status: &str) -> Self {
        let mut event = Self::new(EventType::OperationStatus);
        event.operation_id = Some(operation_id.to_string());
        event.status = Some(status.to_string());
        event
    }

    pub fn step_progress(
        operation_id: &str,
        step_id: &str,
        status: &str,
        metadata: serde_json::Value,
    ) -> Self {
        let mut event = Self::new(EventType::StepProgress);
        event.operation_id = Some(operation_id.to_string());
        event.step_id = Some(step_id.to_string());
        event.status = Some(status.to_string());
        event.metadata = metadata;
        event
    }

    pub fn complete(operation_id: &str, status: &str, metadata: serde_json::Value) -> Self {
        let mut event = Self::new(EventType::OperationComplete);
        event.operation_id = Some(operation_id.to_string());
        event.status = Some(status.to_string());
        event.metadata = metadata;
        event
    }

    pub fn refresh(source: &str, components: &[String]) -> Self {
        let mut event = Self::new(EventType::Refresh);
        event.metadata = serde_json::json!({
            "source": source,
            "components": components,
        });
        event
    }
}

/// Abstract channel for pushing state deltas to subscribers.
///
/// Implementations must not block the caller; the orchestrator invokes
/// this outside of any state lock.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, event: OperationEvent);

    fn refresh(&self, source: &str, components: &[String]) {
        self.broadcast(OperationEvent::refresh(source, components));
    }
}

/// Broadcaster over a `tokio::sync::broadcast` channel of JSON strings.
///
/// Subscribers that fall behind see `Lagged` and skip ahead; nobody
/// blocks the sender. Sending with no subscribers is a no-op.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<String>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: OperationEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize broadcast event");
            }
        }
    }
}

/// Discards every event. For callers that do not need status streaming.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _event: OperationEvent) {}
}

/// Records every event in memory. Used by the test suites to assert on
/// emission order.
#[derive(Default)]
pub struct MemoryBroadcaster {
    events: std::sync::Mutex<Vec<OperationEvent>>,
}

impl MemoryBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<OperationEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    /// Events carrying the given operation id, in emission order.
    pub fn events_for(&self, operation_id: &str) -> Vec<OperationEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.operation_id.as_deref() == Some(operation_id))
            .collect()
    }
}

impl Broadcaster for MemoryBroadcaster {
    fn broadcast(&self, event: OperationEvent) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_snake_case() {
        let event = OperationEvent::step_progress(
            "op-1",
            "scrape",
            "running",
            serde_json::json!({"progress": 40, "message": "downloading"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"step_progress\""));
        assert!(json.contains("\"operation_id\":\"op-1\""));
        assert!(json.contains("\"progress\":40"));
    }

    #[test]
    fn refresh_event_has_no_operation_id() {
        let event = OperationEvent::refresh("license_monitor", &["license".to_string()]);
        assert!(event.operation_id.is_none());
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("operation_id"));
        assert!(json.contains("license_monitor"));
    }

    #[tokio::test]
    async fn channel_broadcaster_delivers_in_order() {
        let broadcaster = ChannelBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(OperationEvent::reset("op-1"));
        broadcaster.broadcast(OperationEvent::operation_status("op-1", "running"));
        broadcaster.broadcast(OperationEvent::complete(
            "op-1",
            "completed",
            serde_json::Value::Null,
        ));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert!(first.contains("operation_reset"));
        assert!(second.contains("operation_status"));
        assert!(third.contains("operation_complete"));
    }

    #[test]
    fn channel_broadcaster_without_subscribers_does_not_panic() {
        let broadcaster = ChannelBroadcaster::new(16);
        broadcaster.broadcast(OperationEvent::reset("op-1"));
    }

    #[test]
    fn memory_broadcaster_filters_by_operation() {
        let broadcaster = MemoryBroadcaster::new();
        broadcaster.broadcast(OperationEvent::reset("op-1"));
        broadcaster.broadcast(OperationEvent::reset("op-2"));
        broadcaster.refresh("test", &[]);

        assert_eq!(broadcaster.events().len(), 3);
        assert_eq!(broadcaster.events_for("op-1").len(), 1);
    }
}
