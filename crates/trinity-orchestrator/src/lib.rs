#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-orchestrator** – composition root.
//!
//! Wires every component crate behind a single [`Orchestrator`] facade: the
//! control-plane surface an API layer or CLI drives, plus the two
//! background loops (Scheduler tick, Supervisor sweep) that make the fleet
//! self-operating.

mod settings;
mod workspace;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trinity_auth::{InMemoryKeyStore, KeyScope};
use trinity_container::{ContainerController, SimulatedContainerController};
use trinity_execution::{ChatRequest, ExecutionEngine, TaskRequest};
use trinity_identity::IdentityService;
use trinity_injection::WorkspaceError;
use trinity_journal::ActivityJournal;
use trinity_lifecycle::{InjectionMaterial, LifecycleManager, WorkspaceFactory};
use trinity_llm_gateway::ModelResponse;
use trinity_mediator::{CallerContext, Mediator};
use trinity_permissions::PermissionGraph;
use trinity_scheduler::Scheduler;
use trinity_store_core::{ActivityQuery, RecordStore, StoreError};
use trinity_store_memory::InMemoryStore;
use trinity_supervisor::{RestartMaterialProvider, Supervisor};
use trinity_types::{
    Agent, AgentName, ActivityRecord, PrincipalId, ResourceLimits, RuntimeKind, TemplateRef,
    TrinityError,
};

pub use settings::Settings;
pub use workspace::{FsWorkspaceFactory, FsWorkspaceWriter};

/// Install a `tracing-subscriber` global default from `RUST_LOG`, falling
/// back to `settings.default_log_filter` when unset.
pub fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.default_log_filter.clone()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// A [`RestartMaterialProvider`] that always hands back the configured
/// default image and an empty [`InjectionMaterial`]. Suitable for the
/// reference in-memory deployment; a production composition root would
/// source credentials from a secrets vault instead.
struct DefaultRestartMaterials {
    default_image: String,
}

impl RestartMaterialProvider for DefaultRestartMaterials {
    fn image_for(&self, _agent_name: &AgentName) -> String {
        self.default_image.clone()
    }

    fn material_for(&self, _agent_name: &AgentName) -> InjectionMaterial {
        InjectionMaterial::default()
    }
}

/// Wires every Trinity component together behind one facade (§6).
pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    controller: Arc<dyn ContainerController>,
    keystore: Arc<InMemoryKeyStore>,
    identity: IdentityService,
    permissions: PermissionGraph,
    journal: Arc<ActivityJournal>,
    lifecycle: Arc<LifecycleManager>,
    execution: Arc<ExecutionEngine>,
    scheduler: Arc<Scheduler>,
    mediator: Mediator,
    supervisor: Arc<Supervisor>,
    settings: Settings,
}

impl Orchestrator {
    /// Build the reference in-memory deployment: [`InMemoryStore`] for
    /// durable state, [`SimulatedContainerController`] in place of a real
    /// container runtime, and workspaces rooted at `settings.workspace_root`.
    pub fn bootstrap(settings: Settings) -> Arc<Self> {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
        let controller: Arc<dyn ContainerController> =
            Arc::new(SimulatedContainerController::new());
        let workspaces: Arc<dyn WorkspaceFactory> =
            Arc::new(FsWorkspaceFactory::new(&settings.workspace_root));

        Self::assemble(store, controller, workspaces, settings)
    }

    /// Build over caller-supplied collaborators; used by tests and any
    /// deployment that needs a real container runtime or durable store.
    pub fn assemble(
        store: Arc<dyn RecordStore>,
        controller: Arc<dyn ContainerController>,
        workspaces: Arc<dyn WorkspaceFactory>,
        settings: Settings,
    ) -> Arc<Self> {
        let keystore = Arc::new(InMemoryKeyStore::new());
        let identity = IdentityService::new(store.clone());
        let permissions = PermissionGraph::new(store.clone());
        let journal = Arc::new(ActivityJournal::new(store.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            controller.clone(),
            workspaces.clone(),
        ));
        let execution = Arc::new(ExecutionEngine::with_caps(
            store.clone(),
            controller.clone(),
            journal.clone(),
            settings.task_agent_cap,
            settings.task_global_cap,
            trinity_execution::DEFAULT_MAX_EXECUTION,
        ));
        let scheduler = Arc::new(Scheduler::with_interval(
            store.clone(),
            execution.clone(),
            journal.clone(),
            Duration::from_secs(settings.scheduler_tick_secs),
        ));
        let mediator = Mediator::new(
            PermissionGraph::new(store.clone()),
            execution.clone(),
            journal.clone(),
            workspaces.clone(),
        );
        let materials: Arc<dyn RestartMaterialProvider> = Arc::new(DefaultRestartMaterials {
            default_image: settings.default_image.clone(),
        });
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            controller.clone(),
            lifecycle.clone(),
            execution.clone(),
            journal.clone(),
            materials,
        ));

        Arc::new(Self {
            store,
            controller,
            keystore,
            identity,
            permissions,
            journal,
            lifecycle,
            execution,
            scheduler,
            mediator,
            supervisor,
            settings,
        })
    }

    /// Spawn the Scheduler tick loop and Supervisor sweep loop as background
    /// tasks, both stopping when `cancel` fires.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let scheduler = self.scheduler.clone();
        let scheduler_cancel = cancel.clone();
        let scheduler_task = tokio::spawn(async move {
            scheduler.run(scheduler_cancel).await;
        });

        let supervisor = self.supervisor.clone();
        let interval = Duration::from_secs(self.settings.supervisor_tick_secs);
        let supervisor_task = tokio::spawn(async move {
            supervisor.run(interval, cancel).await;
        });

        vec![scheduler_task, supervisor_task]
    }

    /// The active configuration this orchestrator was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The container runtime collaborator, for callers (e.g. an admin CLI)
    /// that need direct access to logs/stats beyond the control-plane surface.
    pub fn container_controller(&self) -> &Arc<dyn ContainerController> {
        &self.controller
    }

    //───────────────────────
    //  Identity & ownership
    //───────────────────────

    /// Create a new agent, named and owned as given.
    pub async fn create_agent(
        &self,
        name: &str,
        owner: &str,
        template_ref: &str,
        runtime_kind: RuntimeKind,
    ) -> Result<Agent, TrinityError> {
        let name = AgentName::new(name)?;
        let owner = PrincipalId::new(owner)?;
        let template_ref = TemplateRef::parse(template_ref)?;
        self.identity
            .create(name, owner, template_ref, ResourceLimits::default(), runtime_kind)
            .await
    }

    /// Fetch an agent's current record.
    pub async fn get_agent(&self, name: &AgentName) -> Result<Agent, TrinityError> {
        self.identity.resolve(name).await
    }

    /// List every agent, optionally restricted to one owner.
    pub async fn list_agents(&self, owner: Option<&PrincipalId>) -> Result<Vec<Agent>, TrinityError> {
        self.store
            .list_agents(owner)
            .await
            .map_err(|e| TrinityError::Internal(e.to_string()))
    }

    //───────────────────────
    //  Lifecycle
    //───────────────────────

    /// `created|stopped|error -> starting -> running`, using the configured
    /// default image and the given injection material.
    pub async fn start_agent(
        &self,
        name: &AgentName,
        material: InjectionMaterial,
    ) -> Result<Agent, TrinityError> {
        self.lifecycle
            .start(name, self.settings.default_image.clone(), material)
            .await
    }

    /// `running -> stopping -> stopped`.
    pub async fn stop_agent(&self, name: &AgentName, grace: Duration) -> Result<Agent, TrinityError> {
        self.lifecycle.stop(name, grace).await
    }

    /// Stop (if running) then start again, rebuilding mounts from current
    /// permission/expose state.
    pub async fn reinitialize_agent(
        &self,
        name: &AgentName,
        grace: Duration,
        material: InjectionMaterial,
    ) -> Result<Agent, TrinityError> {
        self.lifecycle
            .reinitialize(name, self.settings.default_image.clone(), grace, material)
            .await
    }

    /// `created|stopped|error -> deleted`.
    pub async fn delete_agent(&self, name: &AgentName) -> Result<(), TrinityError> {
        self.lifecycle.delete(name).await
    }

    //───────────────────────
    //  Sharing & permission edges
    //───────────────────────

    /// Grant read/write access to another principal.
    pub async fn share_agent(&self, name: &AgentName, principal: PrincipalId) -> Result<(), TrinityError> {
        self.identity.share(name, principal).await
    }

    /// Revoke a previously shared principal's access.
    pub async fn unshare_agent(
        &self,
        name: &AgentName,
        principal: &PrincipalId,
    ) -> Result<(), TrinityError> {
        self.identity.unshare(name, principal).await
    }

    /// Grant a directed call permission `source -> target`.
    pub async fn grant_call(
        &self,
        source: AgentName,
        target: AgentName,
        granted_by: PrincipalId,
    ) -> Result<(), TrinityError> {
        self.permissions.set(source, target, granted_by).await
    }

    /// Revoke a directed call permission `source -> target`.
    pub async fn revoke_call(&self, source: &AgentName, target: &AgentName) -> Result<(), TrinityError> {
        self.permissions.clear(source, target).await
    }

    /// Every agent `source` may currently call.
    pub async fn list_peers(&self, source: &AgentName) -> Result<Vec<AgentName>, TrinityError> {
        self.mediator.list_peers(source).await
    }

    //───────────────────────
    //  Execution
    //───────────────────────

    /// Run one chat turn directly against `request.agent_name` (no caller
    /// indirection); used by an external API layer, not agent-to-agent calls.
    pub async fn chat(&self, request: ChatRequest) -> Result<ModelResponse, TrinityError> {
        self.execution.chat(request).await
    }

    /// Run one stateless task turn directly against `request.agent_name`.
    pub async fn task(&self, request: TaskRequest) -> Result<ModelResponse, TrinityError> {
        self.execution.task(request).await
    }

    /// Mediate an agent-to-agent chat call, authorized per the caller's
    /// token scope and the Permission Graph.
    pub async fn mediated_chat(
        &self,
        ctx: CallerContext,
        caller: AgentName,
        target: AgentName,
        message: String,
    ) -> Result<ModelResponse, TrinityError> {
        self.mediator.chat(ctx, caller, target, message).await
    }

    /// Mediate an agent-to-agent task call.
    pub async fn mediated_task(
        &self,
        ctx: CallerContext,
        caller: AgentName,
        target: AgentName,
        message: String,
    ) -> Result<ModelResponse, TrinityError> {
        self.mediator.task(ctx, caller, target, message).await
    }

    /// Mediate an elaborated task call: `target` receives a job folder in
    /// its workspace and the job context appended to its system prompt.
    pub async fn mediated_trigger_job(
        &self,
        ctx: CallerContext,
        caller: AgentName,
        target: AgentName,
        message: String,
    ) -> Result<ModelResponse, TrinityError> {
        self.mediator.trigger_job(ctx, caller, target, message).await
    }

    //───────────────────────
    //  Scheduling
    //───────────────────────

    /// Evaluate every enabled schedule once, outside the background loop.
    /// Exposed for operator-triggered "run now" and for tests.
    pub async fn tick_schedules(&self) {
        self.scheduler.tick().await;
    }

    //───────────────────────
    //  Activity
    //───────────────────────

    /// Subscribe to the live activity stream.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityRecord> {
        self.journal.subscribe()
    }

    /// Query historical activity.
    pub async fn query_activity(&self, query: ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError> {
        self.journal.query(query).await
    }

    //───────────────────────
    //  Privileged fleet ops
    //───────────────────────

    /// Suspend all schedule admission fleet-wide.
    pub async fn pause_all_schedules(&self) -> Result<(), StoreError> {
        self.supervisor.pause_all_schedules().await
    }

    /// Resume schedule admission fleet-wide.
    pub async fn resume_all_schedules(&self) -> Result<(), StoreError> {
        self.supervisor.resume_all_schedules().await
    }

    /// Stop every currently-running agent.
    pub async fn emergency_stop(&self) -> Result<(), StoreError> {
        self.supervisor.emergency_stop().await
    }

    /// Start every currently-stopped-or-errored agent.
    pub async fn restart_all(&self) -> Result<(), StoreError> {
        self.supervisor.restart_all().await
    }

    //───────────────────────
    //  Keys
    //───────────────────────

    /// Mint a new agent-scoped capability token.
    pub async fn issue_agent_key(&self, agent: AgentName) -> String {
        self.keystore.issue_agent_key(agent).await
    }

    /// Mint a new system-scoped capability token.
    pub async fn issue_system_key(&self) -> String {
        self.keystore.issue_system_key().await
    }

    /// Resolve a raw token to the scope it authorizes.
    pub async fn resolve_scope(&self, raw: &str) -> Result<KeyScope, TrinityError> {
        use trinity_auth::TokenValidator;
        self.keystore
            .validate(raw)
            .await
            .map(|claims| claims.scope)
            .map_err(|e| TrinityError::NotAuthorized(e.to_string()))
    }
}

impl From<WorkspaceError> for TrinityError {
    fn from(value: WorkspaceError) -> Self {
        TrinityError::InjectionFailed(value.to_string())
    }
}
