#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-execution** – Execution Engine (§4.6).
//!
//! Two entry points share one bookkeeping path: `chat`, serialized per agent
//! through a single-permit semaphore so conversational turns never
//! interleave, and with a resume session id the engine persists per agent so
//! multi-turn context survives across calls; and `task`, bounded by a
//! per-agent semaphore (default 5) and a fleet-wide semaphore (default 50).
//! Both task semaphores are acquired with `try_acquire_owned`: overflow is
//! rejected with `RateLimited` immediately rather than queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use trinity_container::ContainerController;
use trinity_journal::ActivityJournal;
use trinity_llm_gateway::{ModelRequest, ModelResponse, ModelRuntimeError};
use trinity_store_core::RecordStore;
use trinity_types::{
    ActivityKind, AgentName, Execution, ExecutionMode, ExecutionStatus, ExecutionTrigger,
    LifecycleState, Severity, SessionId, TrinityError,
};
use uuid::Uuid;

/// Default concurrent task executions permitted for a single agent.
pub const DEFAULT_TASK_AGENT_CAP: usize = 5;
/// Default concurrent task executions permitted fleet-wide.
pub const DEFAULT_TASK_GLOBAL_CAP: usize = 50;
/// Default ceiling on a single execution's wall-clock duration.
pub const DEFAULT_MAX_EXECUTION: Duration = Duration::from_secs(30 * 60);
/// Advisory retry-after handed back with a `RateLimited` task rejection.
pub const TASK_RATE_LIMIT_RETRY_AFTER_SECS: u64 = 2;

/// Errors raised while admitting or running an execution, before conversion
/// to [`TrinityError`] at the public boundary.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No such agent.
    #[error("no such agent: {0}")]
    NotFound(AgentName),
    /// The agent is not currently `running`.
    #[error("agent not running: {0}")]
    NotRunning(AgentName),
    /// A task-path concurrency cap (per-agent or fleet-wide) was full.
    #[error("task rate limited: {0}")]
    RateLimited(AgentName),
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] trinity_store_core::StoreError),
    /// The model runtime invocation failed.
    #[error(transparent)]
    Runtime(#[from] ModelRuntimeError),
}

impl From<ExecutionError> for TrinityError {
    fn from(value: ExecutionError) -> Self {
        match value {
            ExecutionError::NotFound(name) => TrinityError::NotFound(name.to_string()),
            ExecutionError::NotRunning(name) => TrinityError::AgentNotRunning(name.to_string()),
            ExecutionError::RateLimited(name) => TrinityError::RateLimited(
                format!("task cap full for {name}"),
                TASK_RATE_LIMIT_RETRY_AFTER_SECS,
            ),
            ExecutionError::Store(e) => TrinityError::Internal(e.to_string()),
            ExecutionError::Runtime(ModelRuntimeError::Container(e)) => {
                TrinityError::ContainerUnavailable(e.to_string())
            }
            ExecutionError::Runtime(e) => TrinityError::Internal(e.to_string()),
        }
    }
}

/// A request to run one chat turn.
pub struct ChatRequest {
    /// Target agent.
    pub agent_name: AgentName,
    /// What/who initiated this turn.
    pub trigger: ExecutionTrigger,
    /// Principal or agent name that requested the work.
    pub initiator: String,
    /// User-facing message.
    pub message: String,
    /// Prior session to resume, if continuing a conversation.
    pub resume_session_id: Option<SessionId>,
    /// Caller-supplied deadline; clamped to the engine's configured ceiling.
    pub deadline: Option<Duration>,
    /// Cooperative cancellation.
    pub cancel: CancellationToken,
}

/// A request to run one stateless task turn.
pub struct TaskRequest {
    /// Target agent.
    pub agent_name: AgentName,
    /// What/who initiated this turn.
    pub trigger: ExecutionTrigger,
    /// Principal or agent name that requested the work.
    pub initiator: String,
    /// Task prompt.
    pub message: String,
    /// Appended to the runtime's system prompt for this call only, e.g. to
    /// carry mediator-injected job context.
    pub append_system_prompt: Option<String>,
    /// Caller-supplied deadline; clamped to the engine's configured ceiling.
    pub deadline: Option<Duration>,
    /// Cooperative cancellation.
    pub cancel: CancellationToken,
}

/// Runs chat and task executions against running agents, enforcing the
/// concurrency caps from §4.6/§5.
pub struct ExecutionEngine {
    store: Arc<dyn RecordStore>,
    controller: Arc<dyn ContainerController>,
    journal: Arc<ActivityJournal>,
    chat_locks: DashMap<AgentName, Arc<Semaphore>>,
    chat_sessions: DashMap<AgentName, SessionId>,
    task_agent_locks: DashMap<AgentName, Arc<Semaphore>>,
    task_global: Arc<Semaphore>,
    task_agent_cap: usize,
    max_execution: Duration,
    execution_seq: AtomicU64,
}

impl ExecutionEngine {
    /// Construct an engine with default concurrency caps (§4.6).
    pub fn new(
        store: Arc<dyn RecordStore>,
        controller: Arc<dyn ContainerController>,
        journal: Arc<ActivityJournal>,
    ) -> Self {
        Self::with_caps(
            store,
            controller,
            journal,
            DEFAULT_TASK_AGENT_CAP,
            DEFAULT_TASK_GLOBAL_CAP,
            DEFAULT_MAX_EXECUTION,
        )
    }

    /// Construct an engine with explicit concurrency caps, for tests and
    /// operators who tune fleet-wide throughput.
    pub fn with_caps(
        store: Arc<dyn RecordStore>,
        controller: Arc<dyn ContainerController>,
        journal: Arc<ActivityJournal>,
        task_agent_cap: usize,
        task_global_cap: usize,
        max_execution: Duration,
    ) -> Self {
        Self {
            store,
            controller,
            journal,
            chat_locks: DashMap::new(),
            chat_sessions: DashMap::new(),
            task_agent_locks: DashMap::new(),
            task_global: Arc::new(Semaphore::new(task_global_cap)),
            task_agent_cap,
            max_execution,
            execution_seq: AtomicU64::new(0),
        }
    }

    fn chat_lock(&self, agent_name: &AgentName) -> Arc<Semaphore> {
        self.chat_locks
            .entry(agent_name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn task_agent_lock(&self, agent_name: &AgentName) -> Arc<Semaphore> {
        let cap = self.task_agent_cap;
        self.task_agent_locks
            .entry(agent_name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(cap)))
            .clone()
    }

    async fn require_running(
        &self,
        agent_name: &AgentName,
    ) -> Result<(String, String), ExecutionError> {
        let agent = self
            .store
            .get_agent(agent_name)
            .await?
            .ok_or_else(|| ExecutionError::NotFound(agent_name.clone()))?;
        if agent.state != LifecycleState::Running {
            return Err(ExecutionError::NotRunning(agent_name.clone()));
        }
        let container_id = agent
            .container_id
            .ok_or_else(|| ExecutionError::NotRunning(agent_name.clone()))?;
        Ok((container_id, agent.model))
    }

    fn clamp_deadline(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(d) => d.min(self.max_execution),
            None => self.max_execution,
        }
    }

    /// Run one chat turn, serialized against any other chat turn for the
    /// same agent.
    #[instrument(skip(self, request), fields(agent = %request.agent_name))]
    pub async fn chat(&self, request: ChatRequest) -> Result<ModelResponse, TrinityError> {
        self.chat_inner(request).await.map_err(Into::into)
    }

    async fn chat_inner(&self, request: ChatRequest) -> Result<ModelResponse, ExecutionError> {
        let lock = self.chat_lock(&request.agent_name);
        let _permit = lock.acquire_owned().await.expect("semaphore never closed");
        let (container_id, model) = self.require_running(&request.agent_name).await?;

        // The caller may explicitly resume a session; absent that, the
        // engine resumes whatever it last persisted for this agent so
        // multi-turn context survives across separate `chat` calls.
        let resume_session_id = request.resume_session_id.or_else(|| {
            self.chat_sessions
                .get(&request.agent_name)
                .map(|entry| *entry)
        });

        let deadline = self.clamp_deadline(request.deadline);
        let execution = self
            .begin_execution(
                &request.agent_name,
                ExecutionMode::Chat,
                request.trigger,
                &request.initiator,
                resume_session_id,
            )
            .await?;

        let model_request = ModelRequest {
            message: request.message,
            resume_session_id,
            append_system_prompt: None,
            allowed_tools: None,
        };

        let outcome = trinity_llm_gateway::invoke(
            self.controller.as_ref(),
            &container_id,
            &model,
            model_request,
            deadline,
            request.cancel,
        )
        .await;

        if let Ok(response) = &outcome {
            self.chat_sessions
                .insert(request.agent_name.clone(), response.session_id);
        }

        self.finish_execution(execution, outcome).await
    }

    /// Discards the persisted resume session for `agent_name`, forcing the
    /// next chat turn to start fresh (§4.9 context-exhaustion reset).
    pub fn reset_session(&self, agent_name: &AgentName) {
        self.chat_sessions.remove(agent_name);
    }

    /// Run one task turn, bounded by the agent's and the fleet's task
    /// semaphores.
    #[instrument(skip(self, request), fields(agent = %request.agent_name))]
    pub async fn task(&self, request: TaskRequest) -> Result<ModelResponse, TrinityError> {
        self.task_inner(request).await.map_err(Into::into)
    }

    async fn task_inner(&self, request: TaskRequest) -> Result<ModelResponse, ExecutionError> {
        // Overflow is rejected outright, never queued (§4.6): a blocking
        // `acquire` here would let task requests pile up across the cap.
        let agent_lock = self.task_agent_lock(&request.agent_name);
        let _agent_permit = agent_lock
            .try_acquire_owned()
            .map_err(|_| ExecutionError::RateLimited(request.agent_name.clone()))?;
        let _global_permit = self
            .task_global
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExecutionError::RateLimited(request.agent_name.clone()))?;

        let (container_id, model) = self.require_running(&request.agent_name).await?;
        let deadline = self.clamp_deadline(request.deadline);

        let execution = self
            .begin_execution(
                &request.agent_name,
                ExecutionMode::Task,
                request.trigger,
                &request.initiator,
                None,
            )
            .await?;

        let model_request = ModelRequest {
            message: request.message,
            resume_session_id: None,
            append_system_prompt: request.append_system_prompt,
            allowed_tools: None,
        };

        let outcome = trinity_llm_gateway::invoke(
            self.controller.as_ref(),
            &container_id,
            &model,
            model_request,
            deadline,
            request.cancel,
        )
        .await;

        self.finish_execution(execution, outcome).await
    }

    async fn begin_execution(
        &self,
        agent_name: &AgentName,
        mode: ExecutionMode,
        trigger: ExecutionTrigger,
        initiator: &str,
        session_id: Option<SessionId>,
    ) -> Result<Execution, ExecutionError> {
        let execution = Execution {
            id: Uuid::new_v4(),
            agent_name: agent_name.clone(),
            mode,
            trigger,
            initiator: initiator.to_string(),
            started_at: chrono::Utc::now(),
            ended_at: None,
            status: ExecutionStatus::Running,
            session_id,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: None,
            error: None,
        };
        self.store.insert_execution(execution.clone()).await?;
        self.execution_seq.fetch_add(1, Ordering::Relaxed);
        self.journal
            .record(
                agent_name.clone(),
                ActivityKind::ExecutionStarted,
                Severity::Info,
                Some(execution.id),
                None,
                serde_json::json!({ "mode": mode }),
            )
            .await?;
        Ok(execution)
    }

    async fn finish_execution(
        &self,
        mut execution: Execution,
        outcome: Result<ModelResponse, ModelRuntimeError>,
    ) -> Result<ModelResponse, ExecutionError> {
        let ended_at = chrono::Utc::now();
        execution.ended_at = Some(ended_at);
        execution.duration_ms = Some(
            (ended_at - execution.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );

        let result = match outcome {
            Ok(response) => {
                execution.status = ExecutionStatus::Completed;
                execution.cost_usd = response.cost_usd;
                execution.input_tokens = response.input_tokens;
                execution.output_tokens = response.output_tokens;
                Ok(response)
            }
            Err(err) => {
                execution.status = match &err {
                    ModelRuntimeError::Container(trinity_container::ContainerError::Timeout) => {
                        ExecutionStatus::TimedOut
                    }
                    ModelRuntimeError::Container(trinity_container::ContainerError::Cancelled) => {
                        ExecutionStatus::Cancelled
                    }
                    _ => ExecutionStatus::Failed,
                };
                execution.error = Some(err.to_string());
                Err(err)
            }
        };

        self.store.put_execution(execution.clone()).await?;
        self.journal
            .record(
                execution.agent_name.clone(),
                ActivityKind::ExecutionEnded,
                if execution.status == ExecutionStatus::Completed {
                    Severity::Info
                } else {
                    Severity::Warn
                },
                Some(execution.id),
                None,
                serde_json::json!({ "status": execution.status }),
            )
            .await?;

        result.map_err(ExecutionError::from)
    }
}
