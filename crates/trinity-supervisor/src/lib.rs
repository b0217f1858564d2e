#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-supervisor** – Supervisor / Fleet Ops (§4.9).
//!
//! A periodic sweep (default every 60s) that keeps the fleet honest:
//! reaping execution records stuck in `running` past a reasonable ceiling,
//! enforcing each agent's daily cost limit, flagging agents nearing their
//! model's context window (a notice-only warning, then a forced session
//! reset once the critical threshold is crossed), and restarting agents
//! whose container has gone unhealthy with exponential backoff. Also
//! exposes the handful of privileged, fleet-wide operations an operator can
//! invoke directly.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tracing::instrument;
use trinity_container::{ContainerController, ContainerStatus};
use trinity_execution::ExecutionEngine;
use trinity_journal::ActivityJournal;
use trinity_lifecycle::{InjectionMaterial, LifecycleManager};
use trinity_store_core::{RecordStore, StoreError};
use trinity_types::{ActivityKind, AgentName, ExecutionStatus, LifecycleState, Severity};

/// Default tick interval for the supervisor loop.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
/// An execution still `running` past this age is considered stuck.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(35 * 60);
/// Default daily spend ceiling per agent, in USD.
pub const DEFAULT_DAILY_COST_LIMIT_USD: f64 = 10.0;
/// Context-window consumption, as a percentage, that triggers a notice-only
/// alert (`ops.context_warn_pct`).
pub const CONTEXT_WARN_THRESHOLD_PCT: f64 = 75.0;
/// Context-window consumption, as a percentage, that triggers a forced
/// session reset in addition to an alert (`ops.context_critical_pct`).
pub const CONTEXT_CRITICAL_THRESHOLD_PCT: f64 = 90.0;
/// Minimum gap between repeated alerts of the same kind for the same agent.
pub const ALERT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Restart attempts before a chronically unhealthy agent is given up on.
pub const MAX_RESTART_ATTEMPTS: u32 = 5;
/// Backoff delays between successive restart attempts (last value repeats).
pub const RESTART_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(5 * 60),
];
/// Settings key gating scheduled admission fleet-wide; shared with trinity-scheduler.
pub const FLEET_PAUSE_KEY: &str = "schedules_paused";

fn backoff_for(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(RESTART_BACKOFF.len() - 1);
    RESTART_BACKOFF[idx]
}

#[derive(Default)]
struct RestartState {
    attempts: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    gave_up: bool,
}

/// Provides the image reference and injection material needed to restart an
/// agent's container. Supplied by the composition root.
pub trait RestartMaterialProvider: Send + Sync {
    /// Image reference to use when (re)creating `agent_name`'s container.
    fn image_for(&self, agent_name: &AgentName) -> String;

    /// Injection material to use when (re)starting `agent_name`.
    fn material_for(&self, agent_name: &AgentName) -> InjectionMaterial;
}

fn alert_key(agent: &AgentName, kind: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    agent.as_str().hash(&mut hasher);
    kind.hash(&mut hasher);
    hasher.finish()
}

/// Periodic fleet supervision and privileged admin operations.
pub struct Supervisor {
    store: Arc<dyn RecordStore>,
    controller: Arc<dyn ContainerController>,
    lifecycle: Arc<LifecycleManager>,
    execution: Arc<ExecutionEngine>,
    journal: Arc<ActivityJournal>,
    materials: Arc<dyn RestartMaterialProvider>,
    stuck_threshold: Duration,
    daily_cost_limit_usd: f64,
    restart_state: DashMap<AgentName, RestartState>,
    alerted_budget: DashMap<AgentName, NaiveDate>,
    last_alert_at: DashMap<u64, DateTime<Utc>>,
}

impl Supervisor {
    /// Construct a supervisor with default thresholds.
    pub fn new(
        store: Arc<dyn RecordStore>,
        controller: Arc<dyn ContainerController>,
        lifecycle: Arc<LifecycleManager>,
        execution: Arc<ExecutionEngine>,
        journal: Arc<ActivityJournal>,
        materials: Arc<dyn RestartMaterialProvider>,
    ) -> Self {
        Self {
            store,
            controller,
            lifecycle,
            execution,
            journal,
            materials,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            daily_cost_limit_usd: DEFAULT_DAILY_COST_LIMIT_USD,
            restart_state: DashMap::new(),
            alerted_budget: DashMap::new(),
            last_alert_at: DashMap::new(),
        }
    }

    async fn alert(&self, agent_name: &AgentName, kind: &'static str, severity: Severity, payload: serde_json::Value) {
        let key = alert_key(agent_name, kind);
        let now = Utc::now();
        if let Some(last) = self.last_alert_at.get(&key) {
            if now.signed_duration_since(*last).to_std().unwrap_or_default() < ALERT_SUPPRESSION_WINDOW {
                return;
            }
        }
        self.last_alert_at.insert(key, now);
        let _ = self
            .journal
            .record(agent_name.clone(), ActivityKind::Alert, severity, None, None, payload)
            .await;
    }

    /// Run the periodic sweep loop until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: tokio_util::sync::CancellationToken) {
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Run one sweep across every agent. Exposed directly for tests.
    #[instrument(skip(self))]
    pub async fn tick(&self) {
        let agents = match self.store.list_agents(None).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "supervisor failed to list agents");
                return;
            }
        };
        for agent in agents {
            self.sweep_stuck_executions(&agent.name).await;
            self.enforce_cost_guard(&agent.name).await;
            self.check_context_exhaustion(&agent.name).await;
            if agent.state == LifecycleState::Running {
                self.check_container_health(&agent.name, agent.container_id.as_deref()).await;
            }
        }
    }

    async fn sweep_stuck_executions(&self, agent_name: &AgentName) {
        let executions = match self.store.list_executions_for_agent(agent_name).await {
            Ok(e) => e,
            Err(_) => return,
        };
        let now = Utc::now();
        for mut execution in executions {
            if execution.status != ExecutionStatus::Running {
                continue;
            }
            let age = now.signed_duration_since(execution.started_at).to_std().unwrap_or_default();
            if age < self.stuck_threshold {
                continue;
            }
            execution.status = ExecutionStatus::Cancelled;
            execution.ended_at = Some(now);
            execution.duration_ms = Some(age.as_millis() as u64);
            // Supervisor-cancelled executions never count against the daily
            // cost limit: whatever partial spend the runtime reported is
            // discarded along with the zombie record.
            execution.cost_usd = 0.0;
            execution.error = Some("supervisor: execution stuck past threshold".to_string());
            let _ = self.store.put_execution(execution.clone()).await;
            self.alert(
                agent_name,
                "stuck_execution",
                Severity::Warn,
                serde_json::json!({ "execution_id": execution.id }),
            )
            .await;
        }
    }

    async fn enforce_cost_guard(&self, agent_name: &AgentName) {
        let today = Utc::now().date_naive();
        if let Some(last) = self.alerted_budget.get(agent_name) {
            if *last == today {
                return;
            }
        }
        let executions = match self.store.list_executions_for_agent(agent_name).await {
            Ok(e) => e,
            Err(_) => return,
        };
        let spend: f64 = executions
            .iter()
            .filter(|e| e.ended_at.map(|t| t.date_naive() == today).unwrap_or(false))
            .map(|e| e.cost_usd)
            .sum();
        if spend <= self.daily_cost_limit_usd {
            return;
        }
        if let Ok(Some(mut agent)) = self.store.get_agent(agent_name).await {
            agent.autonomy = false;
            let _ = self.store.put_agent(agent).await;
        }
        self.alerted_budget.insert(agent_name.clone(), today);
        self.alert(
            agent_name,
            "budget_exceeded",
            Severity::Critical,
            serde_json::json!({ "spend_usd": spend, "limit_usd": self.daily_cost_limit_usd }),
        )
        .await;
    }

    async fn check_context_exhaustion(&self, agent_name: &AgentName) {
        let executions = match self.store.list_executions_for_agent(agent_name).await {
            Ok(e) => e,
            Err(_) => return,
        };
        let Some(latest) = executions
            .into_iter()
            .find(|e| e.status == ExecutionStatus::Completed)
        else {
            return;
        };
        let Ok(Some(agent)) = self.store.get_agent(agent_name).await else {
            return;
        };
        let window = trinity_llm_gateway::context_window_tokens(&agent.model);
        if window == 0 {
            return;
        }
        let pct = (latest.input_tokens + latest.output_tokens) as f64 / window as f64 * 100.0;
        if pct >= CONTEXT_CRITICAL_THRESHOLD_PCT {
            self.execution.reset_session(agent_name);
            self.alert(
                agent_name,
                "context_critical",
                Severity::Warn,
                serde_json::json!({ "context_pct": pct }),
            )
            .await;
        } else if pct >= CONTEXT_WARN_THRESHOLD_PCT {
            self.alert(
                agent_name,
                "context_warning",
                Severity::Info,
                serde_json::json!({ "context_pct": pct }),
            )
            .await;
        }
    }

    async fn check_container_health(&self, agent_name: &AgentName, container_id: Option<&str>) {
        let Some(container_id) = container_id else {
            return;
        };
        let healthy = matches!(
            self.controller.inspect(&container_id.to_string()).await,
            Ok(ContainerStatus::Running)
        );
        if healthy {
            self.restart_state.remove(agent_name);
            return;
        }

        let now = Utc::now();
        let mut state = self.restart_state.entry(agent_name.clone()).or_default();
        if state.gave_up {
            return;
        }
        if state.attempts >= MAX_RESTART_ATTEMPTS {
            state.gave_up = true;
            drop(state);
            if let Ok(Some(mut agent)) = self.store.get_agent(agent_name).await {
                agent.state = LifecycleState::Error;
                let _ = self.store.put_agent(agent).await;
            }
            self.alert(
                agent_name,
                "restart_exhausted",
                Severity::Critical,
                serde_json::json!({ "attempts": MAX_RESTART_ATTEMPTS }),
            )
            .await;
            return;
        }

        let required_delay = backoff_for(state.attempts);
        if let Some(last) = state.last_attempt_at {
            if now.signed_duration_since(last).to_std().unwrap_or_default() < required_delay {
                return;
            }
        }
        state.attempts += 1;
        state.last_attempt_at = Some(now);
        drop(state);

        let image = self.materials.image_for(agent_name);
        let material = self.materials.material_for(agent_name);
        let result = self.lifecycle.start(agent_name, image, material).await;
        match result {
            Ok(_) => {
                self.restart_state.remove(agent_name);
                self.alert(
                    agent_name,
                    "container_restarted",
                    Severity::Warn,
                    serde_json::json!({}),
                )
                .await;
            }
            Err(e) => {
                self.alert(
                    agent_name,
                    "container_restart_failed",
                    Severity::Warn,
                    serde_json::json!({ "error": e.to_string() }),
                )
                .await;
            }
        }
    }

    /// Pause scheduled admission fleet-wide. Running executions are
    /// unaffected.
    pub async fn pause_all_schedules(&self) -> Result<(), StoreError> {
        self.store
            .set_setting(FLEET_PAUSE_KEY.to_string(), "true".to_string())
            .await
    }

    /// Resume scheduled admission fleet-wide.
    pub async fn resume_all_schedules(&self) -> Result<(), StoreError> {
        self.store
            .set_setting(FLEET_PAUSE_KEY.to_string(), "false".to_string())
            .await
    }

    /// Stop every currently-running agent.
    pub async fn emergency_stop(&self) -> Result<(), StoreError> {
        let agents = self.store.list_agents(None).await?;
        for agent in agents {
            if agent.state == LifecycleState::Running {
                let _ = self.lifecycle.stop(&agent.name, Duration::from_secs(10)).await;
            }
        }
        Ok(())
    }

    /// Restart every agent currently `stopped` or `error`.
    pub async fn restart_all(&self) -> Result<(), StoreError> {
        let agents = self.store.list_agents(None).await?;
        for agent in agents {
            if matches!(agent.state, LifecycleState::Stopped | LifecycleState::Error) {
                let image = self.materials.image_for(&agent.name);
                let material = self.materials.material_for(&agent.name);
                let _ = self.lifecycle.start(&agent.name, image, material).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use trinity_container::SimulatedContainerController;
    use trinity_store_memory::InMemoryStore;
    use trinity_types::{
        Agent, Execution, ExecutionMode, ExecutionTrigger, PrincipalId, ResourceLimits,
        RuntimeKind, SharedFolderConfig, TemplateRef,
    };
    use uuid::Uuid;

    struct NullWorkspaceFactory;
    struct NullWorkspace;

    #[async_trait::async_trait]
    impl trinity_injection::WorkspaceWriter for NullWorkspace {
        async fn ensure_dir(&self, _path: &str) -> Result<(), trinity_injection::WorkspaceError> {
            Ok(())
        }
        async fn write_file(&self, _path: &str, _contents: Vec<u8>) -> Result<(), trinity_injection::WorkspaceError> {
            Ok(())
        }
        async fn read_file(&self, _path: &str) -> Result<Option<Vec<u8>>, trinity_injection::WorkspaceError> {
            Ok(None)
        }
        async fn remove_file(&self, _path: &str) -> Result<(), trinity_injection::WorkspaceError> {
            Ok(())
        }
        async fn has_git_worktree(&self) -> Result<bool, trinity_injection::WorkspaceError> {
            Ok(false)
        }
        async fn ensure_gitignore_line(&self, _line: &str) -> Result<(), trinity_injection::WorkspaceError> {
            Ok(())
        }
    }

    impl trinity_lifecycle::WorkspaceFactory for NullWorkspaceFactory {
        fn workspace_for(&self, _agent_name: &AgentName) -> Arc<dyn trinity_injection::WorkspaceWriter> {
            Arc::new(NullWorkspace)
        }
    }

    struct FixedMaterials;

    impl RestartMaterialProvider for FixedMaterials {
        fn image_for(&self, _agent_name: &AgentName) -> String {
            "trinity/agent:latest".to_string()
        }
        fn material_for(&self, _agent_name: &AgentName) -> InjectionMaterial {
            InjectionMaterial::default()
        }
    }

    fn sample_agent(name: &str, state: LifecycleState) -> Agent {
        Agent {
            name: AgentName::new(name).unwrap(),
            template_ref: TemplateRef::parse("local:base").unwrap(),
            owner: PrincipalId::new("alice").unwrap(),
            sharing: vec![],
            resource_limits: ResourceLimits::default(),
            runtime_kind: RuntimeKind::ClaudeCode,
            model: "claude-sonnet-4".to_string(),
            autonomy: true,
            full_capabilities: false,
            state,
            system_protected: false,
            shared_folders: SharedFolderConfig::default(),
            container_id: Some("sim-fixed".to_string()),
            port: Some(2290),
            created_at: Utc::now(),
            last_started_at: None,
        }
    }

    fn supervisor_harness() -> (Supervisor, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let controller: Arc<dyn ContainerController> = Arc::new(SimulatedContainerController::new());
        let journal = Arc::new(ActivityJournal::new(store.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            controller.clone(),
            Arc::new(NullWorkspaceFactory),
        ));
        let execution = Arc::new(trinity_execution::ExecutionEngine::new(
            store.clone(),
            controller.clone(),
            journal.clone(),
        ));
        let supervisor = Supervisor::new(
            store.clone(),
            controller,
            lifecycle,
            execution,
            journal,
            Arc::new(FixedMaterials),
        );
        (supervisor, store)
    }

    /// Like [`SimulatedContainerController`], but `exec` returns well-formed
    /// model-output JSON with a fresh `session_id`, so a supervisor test can
    /// observe whether the next chat turn resumed a prior session.
    struct ScriptedContainerController {
        inner: SimulatedContainerController,
        invocations: std::sync::Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedContainerController {
        fn new() -> Self {
            Self {
                inner: SimulatedContainerController::new(),
                invocations: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ContainerController for ScriptedContainerController {
        async fn create(
            &self,
            spec: trinity_container::ContainerSpec,
        ) -> Result<trinity_container::ContainerId, trinity_container::ContainerError> {
            self.inner.create(spec).await
        }
        async fn start(
            &self,
            id: &trinity_container::ContainerId,
        ) -> Result<(), trinity_container::ContainerError> {
            self.inner.start(id).await
        }
        async fn stop(
            &self,
            id: &trinity_container::ContainerId,
            grace: Duration,
        ) -> Result<(), trinity_container::ContainerError> {
            self.inner.stop(id, grace).await
        }
        async fn remove(
            &self,
            id: &trinity_container::ContainerId,
        ) -> Result<(), trinity_container::ContainerError> {
            self.inner.remove(id).await
        }
        async fn exec(
            &self,
            id: &trinity_container::ContainerId,
            argv: Vec<String>,
            env: std::collections::HashMap<String, String>,
            deadline: Duration,
            cancel: tokio_util::sync::CancellationToken,
        ) -> Result<trinity_container::ExecResult, trinity_container::ContainerError> {
            let _ = (&env, deadline, &cancel, id);
            self.invocations.lock().unwrap().push(argv);
            let body = serde_json::json!({
                "session_id": Uuid::new_v4(),
                "cost_usd": 0.01,
                "input_tokens": 10,
                "output_tokens": 5,
                "result": "ok",
            });
            Ok(trinity_container::ExecResult {
                exit_code: 0,
                stdout: serde_json::to_vec(&body).unwrap(),
                stderr: Vec::new(),
            })
        }
        async fn inspect(
            &self,
            id: &trinity_container::ContainerId,
        ) -> Result<trinity_container::ContainerStatus, trinity_container::ContainerError> {
            self.inner.inspect(id).await
        }
        async fn logs(
            &self,
            id: &trinity_container::ContainerId,
            tail: usize,
        ) -> Result<Vec<u8>, trinity_container::ContainerError> {
            self.inner.logs(id, tail).await
        }
        async fn stats(
            &self,
            id: &trinity_container::ContainerId,
        ) -> Result<trinity_container::ContainerStats, trinity_container::ContainerError> {
            self.inner.stats(id).await
        }
    }

    #[tokio::test]
    async fn stuck_execution_is_cancelled_with_zero_cost() {
        let (supervisor, store) = supervisor_harness();
        let agent = sample_agent("echo", LifecycleState::Running);
        store.insert_agent(agent.clone()).await.unwrap();

        let execution = Execution {
            id: Uuid::new_v4(),
            agent_name: agent.name.clone(),
            mode: ExecutionMode::Chat,
            trigger: ExecutionTrigger::Manual,
            initiator: "alice".to_string(),
            started_at: Utc::now() - ChronoDuration::hours(2),
            ended_at: None,
            status: ExecutionStatus::Running,
            session_id: None,
            cost_usd: 1.23,
            input_tokens: 10,
            output_tokens: 10,
            duration_ms: None,
            error: None,
        };
        store.insert_execution(execution.clone()).await.unwrap();

        supervisor.sweep_stuck_executions(&agent.name).await;

        let updated = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(updated.status, ExecutionStatus::Cancelled);
        assert_eq!(updated.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn cost_guard_disables_autonomy_over_limit() {
        let (supervisor, store) = supervisor_harness();
        let agent = sample_agent("echo", LifecycleState::Running);
        store.insert_agent(agent.clone()).await.unwrap();

        let execution = Execution {
            id: Uuid::new_v4(),
            agent_name: agent.name.clone(),
            mode: ExecutionMode::Task,
            trigger: ExecutionTrigger::Manual,
            initiator: "alice".to_string(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            status: ExecutionStatus::Completed,
            session_id: None,
            cost_usd: DEFAULT_DAILY_COST_LIMIT_USD + 1.0,
            input_tokens: 10,
            output_tokens: 10,
            duration_ms: Some(10),
            error: None,
        };
        store.insert_execution(execution).await.unwrap();

        supervisor.enforce_cost_guard(&agent.name).await;

        let updated = store.get_agent(&agent.name).await.unwrap().unwrap();
        assert!(!updated.autonomy);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let (supervisor, store) = supervisor_harness();
        supervisor.pause_all_schedules().await.unwrap();
        assert_eq!(
            store.get_setting(FLEET_PAUSE_KEY).await.unwrap(),
            Some("true".to_string())
        );
        supervisor.resume_all_schedules().await.unwrap();
        assert_eq!(
            store.get_setting(FLEET_PAUSE_KEY).await.unwrap(),
            Some("false".to_string())
        );
    }

    fn context_execution(agent_name: AgentName, input_tokens: u64, output_tokens: u64) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            agent_name,
            mode: ExecutionMode::Chat,
            trigger: ExecutionTrigger::Manual,
            initiator: "alice".to_string(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            status: ExecutionStatus::Completed,
            session_id: None,
            cost_usd: 0.01,
            input_tokens,
            output_tokens,
            duration_ms: Some(10),
            error: None,
        }
    }

    #[tokio::test]
    async fn context_warning_notice_does_not_reset_session() {
        let store = Arc::new(InMemoryStore::new());
        let controller = Arc::new(ScriptedContainerController::new());
        let journal = Arc::new(ActivityJournal::new(store.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            controller.clone(),
            Arc::new(NullWorkspaceFactory),
        ));
        let execution = Arc::new(trinity_execution::ExecutionEngine::new(
            store.clone(),
            controller.clone(),
            journal.clone(),
        ));
        let agent = sample_agent("echo", LifecycleState::Running);
        store.insert_agent(agent.clone()).await.unwrap();
        let supervisor = Supervisor::new(
            store.clone(),
            controller.clone(),
            lifecycle,
            execution.clone(),
            journal,
            Arc::new(FixedMaterials),
        );

        execution
            .chat(trinity_execution::ChatRequest {
                agent_name: agent.name.clone(),
                trigger: ExecutionTrigger::Manual,
                initiator: "alice".to_string(),
                message: "hi".to_string(),
                resume_session_id: None,
                deadline: Some(Duration::from_secs(5)),
                cancel: tokio_util::sync::CancellationToken::new(),
            })
            .await
            .unwrap();

        // 160_000 / 200_000 = 80%, above the warn line but below critical.
        store
            .insert_execution(context_execution(agent.name.clone(), 120_000, 40_000))
            .await
            .unwrap();

        supervisor.check_context_exhaustion(&agent.name).await;

        execution
            .chat(trinity_execution::ChatRequest {
                agent_name: agent.name.clone(),
                trigger: ExecutionTrigger::Manual,
                initiator: "alice".to_string(),
                message: "again".to_string(),
                resume_session_id: None,
                deadline: Some(Duration::from_secs(5)),
                cancel: tokio_util::sync::CancellationToken::new(),
            })
            .await
            .unwrap();

        let invocations = controller.invocations.lock().unwrap();
        assert!(invocations[1].iter().any(|a| a == "--resume"));
    }

    #[tokio::test]
    async fn context_critical_resets_session_for_next_chat() {
        let store = Arc::new(InMemoryStore::new());
        let controller = Arc::new(ScriptedContainerController::new());
        let journal = Arc::new(ActivityJournal::new(store.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            controller.clone(),
            Arc::new(NullWorkspaceFactory),
        ));
        let execution = Arc::new(trinity_execution::ExecutionEngine::new(
            store.clone(),
            controller.clone(),
            journal.clone(),
        ));
        let agent = sample_agent("echo", LifecycleState::Running);
        store.insert_agent(agent.clone()).await.unwrap();
        let supervisor = Supervisor::new(
            store.clone(),
            controller.clone(),
            lifecycle,
            execution.clone(),
            journal,
            Arc::new(FixedMaterials),
        );

        execution
            .chat(trinity_execution::ChatRequest {
                agent_name: agent.name.clone(),
                trigger: ExecutionTrigger::Manual,
                initiator: "alice".to_string(),
                message: "hi".to_string(),
                resume_session_id: None,
                deadline: Some(Duration::from_secs(5)),
                cancel: tokio_util::sync::CancellationToken::new(),
            })
            .await
            .unwrap();

        // 190_000 / 200_000 = 95%, above the critical line.
        store
            .insert_execution(context_execution(agent.name.clone(), 150_000, 40_000))
            .await
            .unwrap();

        supervisor.check_context_exhaustion(&agent.name).await;

        execution
            .chat(trinity_execution::ChatRequest {
                agent_name: agent.name.clone(),
                trigger: ExecutionTrigger::Manual,
                initiator: "alice".to_string(),
                message: "again".to_string(),
                resume_session_id: None,
                deadline: Some(Duration::from_secs(5)),
                cancel: tokio_util::sync::CancellationToken::new(),
            })
            .await
            .unwrap();

        let invocations = controller.invocations.lock().unwrap();
        assert!(!invocations[1].iter().any(|a| a == "--resume"));

        let alerts = store
            .query_activity(trinity_store_core::ActivityQuery {
                agent_name: Some(agent.name),
                kinds: Some(vec![ActivityKind::Alert]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(alerts.iter().any(|a| a.payload.get("context_pct").is_some()));
    }
}
