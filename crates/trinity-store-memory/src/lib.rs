#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-store-memory** – In-memory [`RecordStore`] driver.
//!
//! Reference implementation used for tests and local operation. Durable
//! backends would implement the same trait behind a different module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use trinity_store_core::{ActivityQuery, RecordStore, StoreError};
use trinity_types::{
    Agent, AgentName, ActivityRecord, Execution, ExecutionId, PermissionEdge, PrincipalId,
    Schedule,
};
use uuid::Uuid;

/// Thread-safe, process-local [`RecordStore`] backed by [`DashMap`]s.
///
/// Cross-entity cascades (`delete_agent_cascade`) take a single internal
/// mutex for the duration of the mutation so that concurrent readers never
/// observe a half-deleted agent; everyday single-entity reads stay lock-free
/// via `DashMap`'s sharded locking.
#[derive(Default)]
pub struct InMemoryStore {
    agents: DashMap<AgentName, Agent>,
    edges: DashMap<(AgentName, AgentName), PermissionEdge>,
    schedules: DashMap<Uuid, Schedule>,
    executions: DashMap<ExecutionId, Execution>,
    activity: DashMap<AgentName, Vec<ActivityRecord>>,
    activity_seq: DashMap<AgentName, AtomicU64>,
    settings: DashMap<String, String>,
    cascade_lock: Mutex<()>,
}

impl InMemoryStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_agent(&self, agent: Agent) -> Result<(), StoreError> {
        if self.agents.contains_key(&agent.name) {
            return Err(StoreError::Conflict(agent.name.to_string()));
        }
        self.agents.insert(agent.name.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, name: &AgentName) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.get(name).map(|r| r.clone()))
    }

    async fn list_agents(&self, owner: Option<&PrincipalId>) -> Result<Vec<Agent>, StoreError> {
        Ok(self
            .agents
            .iter()
            .map(|r| r.value().clone())
            .filter(|a| owner.map(|o| &a.owner == o).unwrap_or(true))
            .collect())
    }

    async fn put_agent(&self, agent: Agent) -> Result<(), StoreError> {
        self.agents.insert(agent.name.clone(), agent);
        Ok(())
    }

    async fn delete_agent_cascade(&self, name: &AgentName) -> Result<(), StoreError> {
        let _guard = self.cascade_lock.lock().expect("cascade lock poisoned");
        if self.agents.remove(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.edges
            .retain(|(src, dst), _| src != name && dst != name);
        self.schedules.retain(|_, s| &s.agent_name != name);
        Ok(())
    }

    async fn set_edge(&self, edge: PermissionEdge) -> Result<(), StoreError> {
        self.edges
            .insert((edge.source_agent.clone(), edge.target_agent.clone()), edge);
        Ok(())
    }

    async fn clear_edge(&self, source: &AgentName, target: &AgentName) -> Result<(), StoreError> {
        self.edges.remove(&(source.clone(), target.clone()));
        Ok(())
    }

    async fn has_edge(&self, source: &AgentName, target: &AgentName) -> Result<bool, StoreError> {
        Ok(self.edges.contains_key(&(source.clone(), target.clone())))
    }

    async fn list_out_edges(&self, source: &AgentName) -> Result<Vec<AgentName>, StoreError> {
        Ok(self
            .edges
            .iter()
            .filter(|r| &r.key().0 == source)
            .map(|r| r.key().1.clone())
            .collect())
    }

    async fn put_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: &Uuid) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.get(id).map(|r| r.clone()))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.schedules.iter().map(|r| r.value().clone()).collect())
    }

    async fn list_schedules_for_agent(&self, agent: &AgentName) -> Result<Vec<Schedule>, StoreError> {
        Ok(self
            .schedules
            .iter()
            .filter(|r| &r.agent_name == agent)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn delete_schedule(&self, id: &Uuid) -> Result<(), StoreError> {
        self.schedules.remove(id);
        Ok(())
    }

    async fn insert_execution(&self, execution: Execution) -> Result<(), StoreError> {
        if self.executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(execution.id.to_string()));
        }
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn put_execution(&self, execution: Execution) -> Result<(), StoreError> {
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.get(id).map(|r| r.clone()))
    }

    async fn list_executions_for_agent(&self, agent: &AgentName) -> Result<Vec<Execution>, StoreError> {
        let mut results: Vec<Execution> = self
            .executions
            .iter()
            .map(|r| r.value().clone())
            .filter(|e| &e.agent_name == agent)
            .collect();
        results.sort_by_key(|e| std::cmp::Reverse(e.started_at));
        Ok(results)
    }

    async fn append_activity(&self, mut record: ActivityRecord) -> Result<ActivityRecord, StoreError> {
        let counter = self
            .activity_seq
            .entry(record.agent_name.clone())
            .or_insert_with(|| AtomicU64::new(0));
        let id = counter.fetch_add(1, Ordering::SeqCst) + 1;
        record.id = id;
        self.activity
            .entry(record.agent_name.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn query_activity(&self, query: ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError> {
        let mut results: Vec<ActivityRecord> = if let Some(agent) = &query.agent_name {
            self.activity
                .get(agent)
                .map(|v| v.clone())
                .unwrap_or_default()
        } else {
            self.activity.iter().flat_map(|r| r.value().clone()).collect()
        };

        if let Some(kinds) = &query.kinds {
            results.retain(|r| kinds.contains(&r.kind));
        }
        if let Some(since) = query.since {
            results.retain(|r| r.timestamp >= since);
        }
        if let Some(until) = query.until {
            results.retain(|r| r.timestamp < until);
        }
        results.sort_by_key(|r| r.timestamp);
        if let Some(limit) = query.limit {
            let start = results.len().saturating_sub(limit);
            results = results.split_off(start);
        }
        Ok(results)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.settings.get(key).map(|r| r.clone()))
    }

    async fn set_setting(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.settings.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trinity_types::{
        ActivityKind, LifecycleState, ResourceLimits, RuntimeKind, Severity, SharedFolderConfig,
        TemplateRef,
    };

    fn sample_agent(name: &str, owner: &str) -> Agent {
        Agent {
            name: AgentName::new(name).unwrap(),
            template_ref: TemplateRef::parse("local:base").unwrap(),
            owner: PrincipalId::new(owner).unwrap(),
            sharing: vec![],
            resource_limits: ResourceLimits::default(),
            runtime_kind: RuntimeKind::ClaudeCode,
            model: "default".to_string(),
            autonomy: true,
            full_capabilities: false,
            state: LifecycleState::Created,
            system_protected: false,
            shared_folders: SharedFolderConfig::default(),
            container_id: None,
            port: None,
            created_at: Utc::now(),
            last_started_at: None,
        }
    }

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let store = InMemoryStore::new();
        let agent = sample_agent("echo", "alice");
        store.insert_agent(agent.clone()).await.unwrap();
        let fetched = store.get_agent(&agent.name).await.unwrap().unwrap();
        assert_eq!(fetched.owner, agent.owner);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = InMemoryStore::new();
        let agent = sample_agent("echo", "alice");
        store.insert_agent(agent.clone()).await.unwrap();
        let err = store.insert_agent(agent).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn cascade_delete_removes_edges_and_schedules() {
        let store = InMemoryStore::new();
        let a = sample_agent("alpha", "alice");
        let b = sample_agent("beta", "alice");
        store.insert_agent(a.clone()).await.unwrap();
        store.insert_agent(b.clone()).await.unwrap();

        store
            .set_edge(PermissionEdge {
                source_agent: a.name.clone(),
                target_agent: b.name.clone(),
                granted_by: a.owner.clone(),
                granted_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .put_schedule(Schedule {
                id: Uuid::new_v4(),
                agent_name: a.name.clone(),
                trigger: trinity_types::ScheduleTrigger::OneShot { at: Utc::now() },
                message: "hi".to_string(),
                enabled: true,
                owner_principal: a.owner.clone(),
            })
            .await
            .unwrap();

        store.delete_agent_cascade(&a.name).await.unwrap();

        assert!(store.get_agent(&a.name).await.unwrap().is_none());
        assert!(!store.has_edge(&a.name, &b.name).await.unwrap());
        assert!(store.list_schedules_for_agent(&a.name).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn activity_ids_are_monotone_per_agent() {
        let store = InMemoryStore::new();
        let agent = AgentName::new("echo").unwrap();
        for _ in 0..3 {
            store
                .append_activity(ActivityRecord {
                    id: 0,
                    timestamp: Utc::now(),
                    kind: ActivityKind::StateTransition,
                    agent_name: agent.clone(),
                    execution_id: None,
                    peer_agent: None,
                    payload: serde_json::json!({}),
                    severity: Severity::Info,
                })
                .await
                .unwrap();
        }
        let records = store
            .query_activity(ActivityQuery {
                agent_name: Some(agent),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
