#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-lifecycle** – Lifecycle State Machine (§4.5).
//!
//! Owns every `state` transition on [`Agent`] and the side effects that
//! accompany it: container create/start/stop, running the Injection
//! Pipeline on every `starting -> running` edge, and a bounded health probe
//! before a start is considered successful.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use trinity_container::{build_spec, ContainerController, ContainerError, ContainerId, ContainerStatus};
use trinity_injection::{InjectionInput, InjectionPipeline, WorkspaceError, WorkspaceWriter};
use trinity_store_core::{RecordStore, StoreError};
use trinity_types::{Agent, AgentName, LifecycleState, TrinityError};

/// Maximum number of health-probe attempts before a start is abandoned.
pub const HEALTH_PROBE_MAX_ATTEMPTS: u32 = 10;
/// Ceiling on total time spent health-probing a single start.
pub const HEALTH_PROBE_CEILING: Duration = Duration::from_secs(60);
/// Initial delay between health-probe attempts; doubles each retry.
pub const HEALTH_PROBE_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Errors specific to lifecycle orchestration, before conversion to
/// [`TrinityError`] at the public boundary.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `from -> to` is not a legal transition per [`LifecycleState::can_transition_to`].
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// Originating state.
        from: LifecycleState,
        /// Attempted state.
        to: LifecycleState,
    },
    /// No agent with the given name.
    #[error("no such agent: {0}")]
    NotFound(AgentName),
    /// The container failed to become healthy within the probe ceiling.
    #[error("agent did not become healthy in time: {0}")]
    HealthProbeFailed(AgentName),
    /// The underlying record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The container runtime collaborator failed.
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// The injection pipeline failed partway through.
    #[error(transparent)]
    Injection(#[from] WorkspaceError),
}

impl From<LifecycleError> for TrinityError {
    fn from(value: LifecycleError) -> Self {
        match value {
            LifecycleError::IllegalTransition { from, to } => {
                TrinityError::AgentNotRunning(format!("cannot go from {from:?} to {to:?}"))
            }
            LifecycleError::NotFound(name) => TrinityError::NotFound(name.to_string()),
            LifecycleError::HealthProbeFailed(name) => {
                TrinityError::ContainerUnavailable(format!("{name} never became healthy"))
            }
            LifecycleError::Store(e) => TrinityError::Internal(e.to_string()),
            LifecycleError::Container(e) => TrinityError::ContainerUnavailable(e.to_string()),
            LifecycleError::Injection(e) => TrinityError::InjectionFailed(e.to_string()),
        }
    }
}

/// Produces a [`WorkspaceWriter`] bound to a given agent's mounted volume.
/// Supplied by the composition root; a real deployment binds this to the
/// container's workspace bind mount, tests bind it to an in-memory double.
pub trait WorkspaceFactory: Send + Sync {
    /// Obtain the workspace writer for `agent_name`.
    fn workspace_for(&self, agent_name: &AgentName) -> Arc<dyn WorkspaceWriter>;
}

/// Everything the Injection Pipeline needs that lifecycle itself cannot
/// derive from stored agent/permission state: credentials and config
/// templates. Sourced externally (e.g. a secrets vault) by the caller.
#[derive(Debug, Clone, Default)]
pub struct InjectionMaterial {
    /// Resolved `KEY=VALUE` credential pairs for `.env`.
    pub credentials: BTreeMap<String, String>,
    /// Template-referenced config files awaiting `${NAME}` interpolation.
    pub config_templates: Vec<(String, String)>,
    /// Agent instruction-file body rendered from the agent's template.
    pub template_body: String,
    /// `settings.trinity_prompt` suffix, empty if unset.
    pub trinity_prompt: String,
}

/// Orchestrates agent lifecycle transitions.
pub struct LifecycleManager {
    store: Arc<dyn RecordStore>,
    controller: Arc<dyn ContainerController>,
    workspaces: Arc<dyn WorkspaceFactory>,
}

impl LifecycleManager {
    /// Construct a manager over the given collaborators.
    pub fn new(
        store: Arc<dyn RecordStore>,
        controller: Arc<dyn ContainerController>,
        workspaces: Arc<dyn WorkspaceFactory>,
    ) -> Self {
        Self {
            store,
            controller,
            workspaces,
        }
    }

    async fn require_agent(&self, name: &AgentName) -> Result<Agent, LifecycleError> {
        self.store
            .get_agent(name)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(name.clone()))
    }

    async fn transition(&self, agent: &mut Agent, next: LifecycleState) -> Result<(), LifecycleError> {
        if !agent.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                from: agent.state,
                to: next,
            });
        }
        agent.state = next;
        self.store.put_agent(agent.clone()).await?;
        Ok(())
    }

    /// Which peers' `shared-out/` this agent should mount, per its own
    /// `shared_folders.consume` flag and the mesh of outbound call edges.
    async fn resolve_exposed_peers(&self, agent: &Agent) -> Result<Vec<AgentName>, LifecycleError> {
        if !agent.shared_folders.consume {
            return Ok(Vec::new());
        }
        let mut exposed = Vec::new();
        for peer_name in self.store.list_out_edges(&agent.name).await? {
            if let Some(peer) = self.store.get_agent(&peer_name).await? {
                if peer.shared_folders.expose {
                    exposed.push(peer_name);
                }
            }
        }
        Ok(exposed)
    }

    /// `created|stopped|error -> starting -> running`. Builds (or reuses)
    /// the container, runs the Injection Pipeline, then health-probes
    /// before the transition to `running` is committed.
    #[tracing::instrument(skip(self, material), fields(agent = %name))]
    pub async fn start(
        &self,
        name: &AgentName,
        image: impl Into<String> + Send,
        material: InjectionMaterial,
    ) -> Result<Agent, TrinityError> {
        self.start_inner(name, image, material).await.map_err(Into::into)
    }

    async fn start_inner(
        &self,
        name: &AgentName,
        image: impl Into<String> + Send,
        material: InjectionMaterial,
    ) -> Result<Agent, LifecycleError> {
        let mut agent = self.require_agent(name).await?;
        self.transition(&mut agent, LifecycleState::Starting).await?;
        agent.last_started_at = Some(Utc::now());
        self.store.put_agent(agent.clone()).await?;

        if let Err(err) = self.bring_up(&mut agent, image, material).await {
            agent.state = LifecycleState::Error;
            let _ = self.store.put_agent(agent.clone()).await;
            return Err(err);
        }

        self.transition(&mut agent, LifecycleState::Running).await?;
        Ok(agent)
    }

    async fn bring_up(
        &self,
        agent: &mut Agent,
        image: impl Into<String> + Send,
        material: InjectionMaterial,
    ) -> Result<(), LifecycleError> {
        let exposed_peers = self.resolve_exposed_peers(agent).await?;

        let container_id = match &agent.container_id {
            Some(existing) => existing.clone(),
            None => {
                let spec = build_spec(
                    &agent.name,
                    &agent.template_ref,
                    agent.resource_limits,
                    image,
                    agent.port.unwrap_or(trinity_container::DEFAULT_PORT_BASE),
                    Vec::new(),
                );
                let id = self.controller.create(spec).await?;
                agent.container_id = Some(id.clone());
                id
            }
        };

        let workspace = self.workspaces.workspace_for(&agent.name);
        InjectionPipeline::run(
            workspace.as_ref(),
            InjectionInput {
                agent_name: &agent.name,
                runtime_kind: &agent.runtime_kind,
                template_body: &material.template_body,
                trinity_prompt: &material.trinity_prompt,
                credentials: &material.credentials,
                config_templates: &material.config_templates,
                exposed_peers: &exposed_peers,
            },
        )
        .await?;

        self.controller.start(&container_id).await?;
        self.wait_healthy(&container_id, &agent.name).await?;
        Ok(())
    }

    async fn wait_healthy(
        &self,
        container_id: &ContainerId,
        agent_name: &AgentName,
    ) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + HEALTH_PROBE_CEILING;
        let mut delay = HEALTH_PROBE_INITIAL_DELAY;
        for attempt in 1..=HEALTH_PROBE_MAX_ATTEMPTS {
            if let Ok(ContainerStatus::Running) = self.controller.inspect(container_id).await {
                return Ok(());
            }
            if attempt == HEALTH_PROBE_MAX_ATTEMPTS || Instant::now() >= deadline {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(delay.min(remaining)).await;
            delay = (delay * 2).min(HEALTH_PROBE_CEILING);
        }
        Err(LifecycleError::HealthProbeFailed(agent_name.clone()))
    }

    /// `running -> stopping -> stopped`.
    #[tracing::instrument(skip(self), fields(agent = %name))]
    pub async fn stop(&self, name: &AgentName, grace: Duration) -> Result<Agent, TrinityError> {
        self.stop_inner(name, grace).await.map_err(Into::into)
    }

    async fn stop_inner(&self, name: &AgentName, grace: Duration) -> Result<Agent, LifecycleError> {
        let mut agent = self.require_agent(name).await?;
        self.transition(&mut agent, LifecycleState::Stopping).await?;
        if let Some(container_id) = &agent.container_id {
            self.controller.stop(container_id, grace).await?;
        }
        self.transition(&mut agent, LifecycleState::Stopped).await?;
        Ok(agent)
    }

    /// Stop (if running) then start again. Mounts and instruction files are
    /// always rebuilt from current state since `start` runs the Injection
    /// Pipeline unconditionally, so no separate code path is needed here.
    #[tracing::instrument(skip(self, material), fields(agent = %name))]
    pub async fn reinitialize(
        &self,
        name: &AgentName,
        image: impl Into<String> + Send,
        grace: Duration,
        material: InjectionMaterial,
    ) -> Result<Agent, TrinityError> {
        let current = self.require_agent(name).await.map_err(LifecycleError::from)?;
        if current.state == LifecycleState::Running {
            self.stop(name, grace).await?;
        }
        self.start(name, image, material).await
    }

    /// `created|stopped|error -> deleted`. Best-effort container teardown,
    /// then an atomic cascade delete of the agent record, its permission
    /// edges, and its schedules.
    #[tracing::instrument(skip(self), fields(agent = %name))]
    pub async fn delete(&self, name: &AgentName) -> Result<(), TrinityError> {
        self.delete_inner(name).await.map_err(Into::into)
    }

    async fn delete_inner(&self, name: &AgentName) -> Result<(), LifecycleError> {
        let mut agent = self.require_agent(name).await?;
        self.transition(&mut agent, LifecycleState::Deleted).await?;
        if let Some(container_id) = &agent.container_id {
            match self.controller.remove(container_id).await {
                Ok(()) | Err(ContainerError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store.delete_agent_cascade(name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinity_container::SimulatedContainerController;
    use trinity_store_memory::InMemoryStore;
    use trinity_types::{PrincipalId, ResourceLimits, RuntimeKind, SharedFolderConfig, TemplateRef};

    struct NullWorkspace;

    #[async_trait::async_trait]
    impl WorkspaceWriter for NullWorkspace {
        async fn ensure_dir(&self, _path: &str) -> Result<(), WorkspaceError> {
            Ok(())
        }
        async fn write_file(&self, _path: &str, _contents: Vec<u8>) -> Result<(), WorkspaceError> {
            Ok(())
        }
        async fn read_file(&self, _path: &str) -> Result<Option<Vec<u8>>, WorkspaceError> {
            Ok(None)
        }
        async fn remove_file(&self, _path: &str) -> Result<(), WorkspaceError> {
            Ok(())
        }
        async fn has_git_worktree(&self) -> Result<bool, WorkspaceError> {
            Ok(false)
        }
        async fn ensure_gitignore_line(&self, _line: &str) -> Result<(), WorkspaceError> {
            Ok(())
        }
    }

    struct NullWorkspaceFactory;

    impl WorkspaceFactory for NullWorkspaceFactory {
        fn workspace_for(&self, _agent_name: &AgentName) -> Arc<dyn WorkspaceWriter> {
            Arc::new(NullWorkspace)
        }
    }

    fn sample_agent(name: &str) -> Agent {
        Agent {
            name: AgentName::new(name).unwrap(),
            template_ref: TemplateRef::parse("local:base").unwrap(),
            owner: PrincipalId::new("alice").unwrap(),
            sharing: Vec::new(),
            resource_limits: ResourceLimits::default(),
            runtime_kind: RuntimeKind::ClaudeCode,
            model: "claude-sonnet-4".to_string(),
            autonomy: false,
            full_capabilities: false,
            state: LifecycleState::Created,
            system_protected: false,
            shared_folders: SharedFolderConfig::default(),
            container_id: None,
            port: Some(2290),
            created_at: Utc::now(),
            last_started_at: None,
        }
    }

    fn manager() -> (LifecycleManager, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::default());
        let controller: Arc<dyn ContainerController> = Arc::new(SimulatedContainerController::new());
        let workspaces: Arc<dyn WorkspaceFactory> = Arc::new(NullWorkspaceFactory);
        (
            LifecycleManager::new(store.clone(), controller, workspaces),
            store,
        )
    }

    #[tokio::test]
    async fn start_then_stop_then_delete_roundtrip() {
        let (mgr, store) = manager();
        let agent = sample_agent("echo");
        store.insert_agent(agent.clone()).await.unwrap();

        let started = mgr
            .start(&agent.name, "trinity/agent:latest", InjectionMaterial::default())
            .await
            .unwrap();
        assert_eq!(started.state, LifecycleState::Running);

        let stopped = mgr.stop(&agent.name, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stopped.state, LifecycleState::Stopped);

        mgr.delete(&agent.name).await.unwrap();
        assert!(store.get_agent(&agent.name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn starting_twice_reuses_existing_container() {
        let (mgr, store) = manager();
        let agent = sample_agent("echo");
        store.insert_agent(agent.clone()).await.unwrap();

        let first = mgr
            .start(&agent.name, "trinity/agent:latest", InjectionMaterial::default())
            .await
            .unwrap();
        mgr.stop(&agent.name, Duration::from_secs(5)).await.unwrap();
        let second = mgr
            .start(&agent.name, "trinity/agent:latest", InjectionMaterial::default())
            .await
            .unwrap();
        assert_eq!(first.container_id, second.container_id);
    }

    #[tokio::test]
    async fn delete_requires_stopped_or_error_or_created() {
        let (mgr, store) = manager();
        let agent = sample_agent("echo");
        store.insert_agent(agent.clone()).await.unwrap();
        mgr.start(&agent.name, "trinity/agent:latest", InjectionMaterial::default())
            .await
            .unwrap();

        let err = mgr.delete(&agent.name).await.unwrap_err();
        assert!(matches!(err, TrinityError::AgentNotRunning(_)));
    }

    #[tokio::test]
    async fn reinitialize_stops_a_running_agent_before_restarting() {
        let (mgr, store) = manager();
        let agent = sample_agent("echo");
        store.insert_agent(agent.clone()).await.unwrap();
        mgr.start(&agent.name, "trinity/agent:latest", InjectionMaterial::default())
            .await
            .unwrap();

        let reinitialized = mgr
            .reinitialize(
                &agent.name,
                "trinity/agent:latest",
                Duration::from_secs(5),
                InjectionMaterial::default(),
            )
            .await
            .unwrap();
        assert_eq!(reinitialized.state, LifecycleState::Running);
    }
}
