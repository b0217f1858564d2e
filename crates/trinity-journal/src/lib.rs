#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-journal** – Activity Journal (§4.10).
//!
//! Every other component writes through this crate rather than touching
//! [`trinity_store_core::RecordStore`] activity methods directly, so that
//! "durable before observed" ordering (store write completes, then the bus
//! publishes) is enforced in one place.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::instrument;
use trinity_bus::{EventBus, InMemoryBus};
use trinity_store_core::{ActivityQuery, RecordStore, StoreError};
use trinity_types::{ActivityKind, ActivityRecord, AgentName, ExecutionId, Severity};

/// Append-only activity journal composed from a durable [`RecordStore`] and a
/// live [`EventBus`].
pub struct ActivityJournal {
    store: Arc<dyn RecordStore>,
    bus: InMemoryBus,
}

impl ActivityJournal {
    /// Construct a journal over the given store, with its own broadcast bus.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            bus: InMemoryBus::default(),
        }
    }

    /// Append a record: write-through to the store first, then publish so
    /// that subscribers never observe an event the store doesn't yet have.
    #[instrument(skip(self, payload), fields(agent = %agent_name, kind = ?kind))]
    pub async fn record(
        &self,
        agent_name: AgentName,
        kind: ActivityKind,
        severity: Severity,
        execution_id: Option<ExecutionId>,
        peer_agent: Option<AgentName>,
        payload: serde_json::Value,
    ) -> Result<ActivityRecord, StoreError> {
        let draft = ActivityRecord {
            id: 0,
            timestamp: Utc::now(),
            kind,
            agent_name,
            execution_id,
            peer_agent,
            payload,
            severity,
        };
        let committed = self.store.append_activity(draft).await?;
        self.bus.publish(&committed);
        Ok(committed)
    }

    /// Subscribe to the live stream of records appended from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityRecord> {
        self.bus.subscribe()
    }

    /// Historical query, delegated straight to the store.
    pub async fn query(&self, query: ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError> {
        self.store.query_activity(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinity_store_memory::InMemoryStore;

    #[tokio::test]
    async fn record_is_both_stored_and_published() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
        let journal = ActivityJournal::new(store);
        let mut rx = journal.subscribe();
        let agent = AgentName::new("echo").unwrap();

        let written = journal
            .record(
                agent.clone(),
                ActivityKind::StateTransition,
                Severity::Info,
                None,
                None,
                serde_json::json!({"to": "running"}),
            )
            .await
            .unwrap();

        let live = rx.recv().await.unwrap();
        assert_eq!(live.id, written.id);

        let historical = journal
            .query(ActivityQuery {
                agent_name: Some(agent),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(historical.len(), 1);
    }
}
