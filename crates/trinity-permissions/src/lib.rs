#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-permissions** – Permission Graph (§4.2).
//!
//! Maintains the directed edge set agents use to authorize calls to one
//! another. Absence of an edge means denied; there is no separate "deny"
//! edge. Reads go straight to the underlying store's lock-free map; writes
//! are linearizable because [`trinity_store_core::RecordStore`]'s `DashMap`
//! backing serializes per-key.

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;
use trinity_store_core::{RecordStore, StoreError};
use trinity_types::{AgentName, PermissionEdge, PrincipalId, TrinityError};

/// Permission Graph service.
pub struct PermissionGraph {
    store: Arc<dyn RecordStore>,
}

impl PermissionGraph {
    /// Construct a graph over the given record store.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Grant the directed edge `source -> target`.
    #[instrument(skip(self))]
    pub async fn set(
        &self,
        source: AgentName,
        target: AgentName,
        granted_by: PrincipalId,
    ) -> Result<(), TrinityError> {
        self.store
            .set_edge(PermissionEdge {
                source_agent: source,
                target_agent: target,
                granted_by,
                granted_at: Utc::now(),
            })
            .await
            .map_err(store_err)
    }

    /// Revoke the directed edge `source -> target`, if present.
    #[instrument(skip(self))]
    pub async fn clear(&self, source: &AgentName, target: &AgentName) -> Result<(), TrinityError> {
        self.store.clear_edge(source, target).await.map_err(store_err)
    }

    /// Whether `source` may currently call `target`.
    ///
    /// This is a pure graph query; callers that hold a system-scoped token
    /// (§4.8) bypass this check entirely rather than calling it.
    pub async fn may_call(&self, source: &AgentName, target: &AgentName) -> Result<bool, TrinityError> {
        self.store.has_edge(source, target).await.map_err(store_err)
    }

    /// All agents `source` currently has an outbound edge to.
    pub async fn list_out(&self, source: &AgentName) -> Result<Vec<AgentName>, TrinityError> {
        self.store.list_out_edges(source).await.map_err(store_err)
    }
}

fn store_err(e: StoreError) -> TrinityError {
    match e {
        StoreError::NotFound(m) => TrinityError::NotFound(m),
        StoreError::Conflict(m) => TrinityError::Internal(m),
        StoreError::Backend(m) => TrinityError::Internal(m),
    }
}
