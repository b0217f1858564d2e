#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-bus** – Core event bus abstraction backing live activity
//! subscription (§4.10).
//!
//! This crate carries no storage concern of its own; it is a thin,
//! broadcast-only pub/sub primitive that the Activity Journal layers
//! historical query on top of.

use std::sync::Arc;

use tokio::sync::broadcast;
use trinity_types::ActivityRecord;

/// Core event bus abstraction for publishing and subscribing to activity
/// records as they are appended.
pub trait EventBus: Send + Sync {
    /// Publish a record to all current subscribers. Best-effort: slow or
    /// absent subscribers do not block the publisher and may miss events.
    fn publish(&self, record: &ActivityRecord);

    /// Subscribe to the live stream of records appended after this call.
    fn subscribe(&self) -> broadcast::Receiver<ActivityRecord>;
}

/// Broadcast-channel-backed [`EventBus`].
#[derive(Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<ActivityRecord>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl InMemoryBus {
    /// Construct a bus with the given ring-buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Current number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, record: &ActivityRecord) {
        let _ = self.tx.send(record.clone());
    }

    fn subscribe(&self) -> broadcast::Receiver<ActivityRecord> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trinity_types::{ActivityKind, AgentName, Severity};

    fn sample(agent: &str) -> ActivityRecord {
        ActivityRecord {
            id: 1,
            timestamp: Utc::now(),
            kind: ActivityKind::StateTransition,
            agent_name: AgentName::new(agent).unwrap(),
            execution_id: None,
            peer_agent: None,
            payload: serde_json::json!({}),
            severity: Severity::Info,
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InMemoryBus::new(16);
        let mut rx = bus.subscribe();
        let record = sample("echo");
        bus.publish(&record);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.agent_name, record.agent_name);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = InMemoryBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        let record = sample("worker");
        bus.publish(&record);
        assert_eq!(a.recv().await.unwrap().agent_name, record.agent_name);
        assert_eq!(b.recv().await.unwrap().agent_name, record.agent_name);
    }
}
