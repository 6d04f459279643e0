//! Notification channel shared by every component
//!
//! Events are fire-and-forget: emitting never blocks and never fails, even
//! when nobody listens. Slow subscribers observe `RecvError::Lagged` and
//! miss the oldest events instead of stalling the emitter.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::circuit_breaker::CircuitState;

/// Default number of undelivered events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Everything the client reports to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NetEvent {
    ConnectionCreated { connection_id: String, endpoint: String },
    ConnectionReleased { connection_id: String, endpoint: String },
    ConnectionClosed { connection_id: String, endpoint: String },
    /// Establishing or closing a connection failed
    ConnectionError { connection_id: Option<String>, endpoint: String, error: String },

    RequestAdded { request_id: String, url: String, priority: usize },
    /// A duplicate read was attached to an already queued request
    RequestCoalesced { request_id: String, url: String, waiters: usize },
    RequestRetry { request_id: String, retry_count: u32, error: String },
    RequestFailure { request_id: String, error: String },

    BatchCompleted { batch_id: String, size: usize, duration_ms: u64 },
    BatchError { batch_id: String, size: usize, error: String },

    StateChange { from: CircuitState, to: CircuitState },

    RetryAttempt { operation_id: String, attempt: u32, delay_ms: u64, error: String },
    RetrySuccess { operation_id: String, attempts: u32 },
    RetryFailure { operation_id: String, attempts: u32, error: String },
    BudgetExceeded { operation_id: String, budget: u32, window_ms: u64 },

    MaintenanceCompleted { closed: usize, remaining: usize },
}

impl NetEvent {
    /// Stable event name, identical to the serialized `event` tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionCreated { .. } => "connectionCreated",
            Self::ConnectionReleased { .. } => "connectionReleased",
            Self::ConnectionClosed { .. } => "connectionClosed",
            Self::ConnectionError { .. } => "connectionError",
            Self::RequestAdded { .. } => "requestAdded",
            Self::RequestCoalesced { .. } => "requestCoalesced",
            Self::RequestRetry { .. } => "requestRetry",
            Self::RequestFailure { .. } => "requestFailure",
            Self::BatchCompleted { .. } => "batchCompleted",
            Self::BatchError { .. } => "batchError",
            Self::StateChange { .. } => "stateChange",
            Self::RetryAttempt { .. } => "retryAttempt",
            Self::RetrySuccess { .. } => "retrySuccess",
            Self::RetryFailure { .. } => "retryFailure",
            Self::BudgetExceeded { .. } => "budgetExceeded",
            Self::MaintenanceCompleted { .. } => "maintenanceCompleted",
        }
    }
}

/// Cloneable handle to a broadcast channel of [`NetEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to current subscribers
    pub fn emit(&self, event: NetEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            trace!(event = name, "no event subscribers");
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates the serialized tag and field casing.
    ///
    /// Assertions:
    /// - The `event` tag uses the camelCase event name.
    /// - Payload fields are camelCase.
    #[test]
    fn test_event_serialization_shape() {
        let event = NetEvent::ConnectionCreated {
            connection_id: "c-1".to_string(),
            endpoint: "https://api.example.com".to_string(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "connectionCreated");
        assert_eq!(value["connectionId"], "c-1");
        assert_eq!(event.name(), "connectionCreated");
    }

    /// Validates `name()` agrees with the serde tag for a state change.
    #[test]
    fn test_state_change_name_matches_tag() {
        let event = NetEvent::StateChange { from: CircuitState::Closed, to: CircuitState::Open };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
        assert_eq!(value["to"], "open");
    }

    /// Validates emitting without subscribers is silent and subscribers get
    /// later events.
    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let bus = EventBus::default();
        bus.emit(NetEvent::MaintenanceCompleted { closed: 0, remaining: 0 });

        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.emit(NetEvent::MaintenanceCompleted { closed: 2, remaining: 1 });

        let event = rx.recv().await.unwrap();
        assert_eq!(event, NetEvent::MaintenanceCompleted { closed: 2, remaining: 1 });
    }
}
