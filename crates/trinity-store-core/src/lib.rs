#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-store-core** – Transactional record-store abstraction.
//!
//! This crate defines the storage contract from §6: "a record store exposing
//! transactional operations over the entities in §3, plus an append-only
//! activity store." It provides no concrete persistence; drivers (in-memory,
//! and eventually a durable backend) implement [`RecordStore`] in separate
//! crates, the way `toka-store-memory` implements `toka-store-core`'s
//! `StorageBackend` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trinity_types::{
    Agent, AgentName, ActivityKind, ActivityRecord, Execution, ExecutionId, PermissionEdge,
    PrincipalId, Schedule,
};
use uuid::Uuid;

/// Errors surfaced by a [`RecordStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record matched the requested key.
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint was violated (e.g. agent name already exists).
    #[error("conflict: {0}")]
    Conflict(String),
    /// The underlying backend failed in a way that isn't classifiable above.
    #[error("backend error: {0}")]
    Backend(String),
}

/// A filter over historical activity queries (§4.10).
#[derive(Debug, Clone, Default)]
pub struct ActivityQuery {
    /// Restrict to a single agent.
    pub agent_name: Option<AgentName>,
    /// Restrict to one or more kinds.
    pub kinds: Option<Vec<ActivityKind>>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of records to return, most recent first.
    pub limit: Option<usize>,
}

/// The transactional record-store contract every orchestration component is
/// built against.
///
/// Methods that touch more than one entity family (`delete_agent_cascade`)
/// are required to be atomic: either every constituent mutation lands, or
/// none does, matching the §4.1/§4.2/§8 cascade-delete invariant.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ---- agents ----

    /// Insert a brand-new agent record. Fails with [`StoreError::Conflict`]
    /// if `agent.name` is already in use (including by a deleted agent,
    /// since names are never recycled).
    async fn insert_agent(&self, agent: Agent) -> Result<(), StoreError>;

    /// Fetch an agent by name.
    async fn get_agent(&self, name: &AgentName) -> Result<Option<Agent>, StoreError>;

    /// List every agent, optionally narrowed to one owner.
    async fn list_agents(&self, owner: Option<&PrincipalId>) -> Result<Vec<Agent>, StoreError>;

    /// Replace the stored record for `agent.name` in full.
    async fn put_agent(&self, agent: Agent) -> Result<(), StoreError>;

    /// Atomically remove the agent record together with every permission
    /// edge and schedule that references it.
    async fn delete_agent_cascade(&self, name: &AgentName) -> Result<(), StoreError>;

    // ---- permission edges ----

    /// Insert or overwrite the edge `source -> target`.
    async fn set_edge(&self, edge: PermissionEdge) -> Result<(), StoreError>;

    /// Remove the edge `source -> target`, if present.
    async fn clear_edge(&self, source: &AgentName, target: &AgentName) -> Result<(), StoreError>;

    /// Whether an edge `source -> target` currently exists.
    async fn has_edge(&self, source: &AgentName, target: &AgentName) -> Result<bool, StoreError>;

    /// All agents `source` may call.
    async fn list_out_edges(&self, source: &AgentName) -> Result<Vec<AgentName>, StoreError>;

    // ---- schedules ----

    /// Insert or overwrite a schedule.
    async fn put_schedule(&self, schedule: Schedule) -> Result<(), StoreError>;

    /// Fetch a schedule by id.
    async fn get_schedule(&self, id: &Uuid) -> Result<Option<Schedule>, StoreError>;

    /// All schedules, enabled or not.
    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;

    /// All schedules owned by one agent.
    async fn list_schedules_for_agent(&self, agent: &AgentName) -> Result<Vec<Schedule>, StoreError>;

    /// Remove a schedule by id.
    async fn delete_schedule(&self, id: &Uuid) -> Result<(), StoreError>;

    // ---- executions ----

    /// Insert a brand-new execution record.
    async fn insert_execution(&self, execution: Execution) -> Result<(), StoreError>;

    /// Replace the stored record for `execution.id` in full.
    async fn put_execution(&self, execution: Execution) -> Result<(), StoreError>;

    /// Fetch an execution by id.
    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<Execution>, StoreError>;

    /// All executions for one agent, most recent first.
    async fn list_executions_for_agent(&self, agent: &AgentName) -> Result<Vec<Execution>, StoreError>;

    // ---- activity journal ----

    /// Append a new activity record, assigning it the next monotone id for
    /// its agent.
    async fn append_activity(&self, record: ActivityRecord) -> Result<ActivityRecord, StoreError>;

    /// Historical query over the activity journal.
    async fn query_activity(&self, query: ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError>;

    // ---- settings ----

    /// Fetch a raw settings value by key.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a raw settings value.
    async fn set_setting(&self, key: &str, value: String) -> Result<(), StoreError>;
}
