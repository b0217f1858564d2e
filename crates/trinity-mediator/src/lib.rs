#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-mediator** – Inter-Agent Call Mediator (§4.8).
//!
//! The only place system-scope bypass of the Permission Graph is applied:
//! [`trinity_permissions::PermissionGraph::may_call`] is a pure graph query,
//! and a caller presenting [`KeyScope::System`] never reaches it. Also
//! enforces the call-chain depth bound so agent call graphs can't loop
//! forever through each other.
//!
//! `trigger_job` is the elaborated form of `task`: it materializes a job
//! folder (`request.json`/`status.json`/`output.json`) in the peer's
//! workspace via [`WorkspaceFactory`] before dispatch, so deployed
//! multi-agent systems have a durable record of what was asked and what came
//! back, independent of the activity journal.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use trinity_auth::KeyScope;
use trinity_execution::{ChatRequest, ExecutionEngine, TaskRequest};
use trinity_injection::WorkspaceError;
use trinity_journal::ActivityJournal;
use trinity_lifecycle::WorkspaceFactory;
use trinity_llm_gateway::ModelResponse;
use trinity_permissions::PermissionGraph;
use trinity_types::{ActivityKind, AgentName, ExecutionTrigger, Severity, TrinityError};
use uuid::Uuid;

/// Maximum number of hops permitted in a single agent call chain. A 4th hop
/// is rejected with [`TrinityError::DepthExceeded`].
pub const MAX_CALL_DEPTH: u8 = 3;

/// Errors raised mediating an inter-agent call, before conversion to
/// [`TrinityError`] at the public boundary.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// The call chain has already reached [`MAX_CALL_DEPTH`] hops.
    #[error("call chain depth exceeded at {0}")]
    DepthExceeded(AgentName),
    /// `caller` has no permission edge to `target`.
    #[error("{caller} may not call {target}")]
    PermissionDenied {
        /// The agent attempting the call.
        caller: AgentName,
        /// The agent being called.
        target: AgentName,
    },
    /// The caller's token scope does not authorize acting as `caller`.
    #[error("token scope does not authorize acting as {0}")]
    ScopeMismatch(AgentName),
    /// The underlying permission graph failed.
    #[error(transparent)]
    Permissions(#[from] TrinityError),
    /// Writing the job folder into the peer's workspace failed.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl From<MediatorError> for TrinityError {
    fn from(value: MediatorError) -> Self {
        match value {
            MediatorError::DepthExceeded(name) => TrinityError::DepthExceeded(name.to_string()),
            MediatorError::PermissionDenied { caller, target } => {
                TrinityError::PermissionDenied(format!("{caller} -> {target}"))
            }
            MediatorError::ScopeMismatch(name) => {
                TrinityError::NotAuthorized(format!("token does not authorize {name}"))
            }
            MediatorError::Permissions(e) => e,
            MediatorError::Workspace(e) => TrinityError::Internal(e.to_string()),
        }
    }
}

/// Context identifying the calling agent and its position in the current
/// call chain.
pub struct CallerContext {
    /// The token scope presented by the caller.
    pub scope: KeyScope,
    /// Hops already taken in the current chain (0 for a fresh, top-level call).
    pub call_depth: u8,
}

/// Authorizes and dispatches agent-to-agent calls (§4.8).
pub struct Mediator {
    permissions: PermissionGraph,
    execution: Arc<ExecutionEngine>,
    journal: Arc<ActivityJournal>,
    workspaces: Arc<dyn WorkspaceFactory>,
}

impl Mediator {
    /// Construct a mediator over the given collaborators.
    pub fn new(
        permissions: PermissionGraph,
        execution: Arc<ExecutionEngine>,
        journal: Arc<ActivityJournal>,
        workspaces: Arc<dyn WorkspaceFactory>,
    ) -> Self {
        Self {
            permissions,
            execution,
            journal,
            workspaces,
        }
    }

    /// All agents `caller` may currently call.
    pub async fn list_peers(&self, caller: &AgentName) -> Result<Vec<AgentName>, TrinityError> {
        self.permissions.list_out(caller).await
    }

    fn caller_agent(ctx: &CallerContext, caller: &AgentName) -> Result<(), MediatorError> {
        match &ctx.scope {
            KeyScope::System => Ok(()),
            KeyScope::Agent(bound) if bound == caller => Ok(()),
            KeyScope::Agent(_) => Err(MediatorError::ScopeMismatch(caller.clone())),
        }
    }

    async fn authorize(
        &self,
        ctx: &CallerContext,
        caller: &AgentName,
        target: &AgentName,
    ) -> Result<u8, MediatorError> {
        Self::caller_agent(ctx, caller)?;
        if ctx.call_depth >= MAX_CALL_DEPTH {
            return Err(MediatorError::DepthExceeded(caller.clone()));
        }
        if !ctx.scope.is_system() && !self.permissions.may_call(caller, target).await? {
            return Err(MediatorError::PermissionDenied {
                caller: caller.clone(),
                target: target.clone(),
            });
        }
        Ok(ctx.call_depth + 1)
    }

    /// Mediate a chat call from `caller` to `target`.
    #[instrument(skip(self, ctx, message), fields(caller = %caller, target = %target))]
    pub async fn chat(
        &self,
        ctx: CallerContext,
        caller: AgentName,
        target: AgentName,
        message: String,
    ) -> Result<ModelResponse, TrinityError> {
        let next_depth = self.authorize(&ctx, &caller, &target).await?;
        self.journal
            .record(
                caller.clone(),
                ActivityKind::AgentEdge,
                Severity::Info,
                None,
                Some(target.clone()),
                serde_json::json!({ "mode": "chat" }),
            )
            .await
            .map_err(|e| TrinityError::Internal(e.to_string()))?;

        self.execution
            .chat(ChatRequest {
                agent_name: target,
                trigger: ExecutionTrigger::AgentTriggered {
                    caller,
                    call_depth: next_depth,
                },
                initiator: "agent-mediator".to_string(),
                message,
                resume_session_id: None,
                deadline: None,
                cancel: CancellationToken::new(),
            })
            .await
    }

    /// Mediate a task call from `caller` to `target`.
    #[instrument(skip(self, ctx, message), fields(caller = %caller, target = %target))]
    pub async fn task(
        &self,
        ctx: CallerContext,
        caller: AgentName,
        target: AgentName,
        message: String,
    ) -> Result<ModelResponse, TrinityError> {
        let next_depth = self.authorize(&ctx, &caller, &target).await?;
        self.journal
            .record(
                caller.clone(),
                ActivityKind::AgentEdge,
                Severity::Info,
                None,
                Some(target.clone()),
                serde_json::json!({ "mode": "task" }),
            )
            .await
            .map_err(|e| TrinityError::Internal(e.to_string()))?;

        self.execution
            .task(TaskRequest {
                agent_name: target,
                trigger: ExecutionTrigger::AgentTriggered {
                    caller,
                    call_depth: next_depth,
                },
                initiator: "agent-mediator".to_string(),
                message,
                deadline: None,
                cancel: CancellationToken::new(),
            })
            .await
    }

    /// Mediate an elaborated task call: `caller` hands `target` a job. Before
    /// dispatch a job folder (`request.json`/`status.json`) is created in
    /// `target`'s workspace and the job context is appended to the runtime's
    /// system prompt; `status.json` and `output.json` (on success) are
    /// updated once the task completes.
    #[instrument(skip(self, ctx, message), fields(caller = %caller, target = %target))]
    pub async fn trigger_job(
        &self,
        ctx: CallerContext,
        caller: AgentName,
        target: AgentName,
        message: String,
    ) -> Result<ModelResponse, TrinityError> {
        let next_depth = self.authorize(&ctx, &caller, &target).await?;
        self.journal
            .record(
                caller.clone(),
                ActivityKind::AgentEdge,
                Severity::Info,
                None,
                Some(target.clone()),
                serde_json::json!({ "mode": "trigger_job" }),
            )
            .await
            .map_err(|e| TrinityError::Internal(e.to_string()))?;

        let job_id = Uuid::new_v4();
        let job_dir = format!("jobs/{job_id}");
        let workspace = self.workspaces.workspace_for(&target);
        workspace
            .ensure_dir(&job_dir)
            .await
            .map_err(MediatorError::from)?;
        workspace
            .write_file(
                &format!("{job_dir}/request.json"),
                serde_json::to_vec(&serde_json::json!({
                    "job_id": job_id,
                    "caller": caller,
                    "message": message,
                }))
                .expect("job request serializes"),
            )
            .await
            .map_err(MediatorError::from)?;
        workspace
            .write_file(
                &format!("{job_dir}/status.json"),
                serde_json::to_vec(&serde_json::json!({ "state": "running" }))
                    .expect("job status serializes"),
            )
            .await
            .map_err(MediatorError::from)?;

        let system_prompt = format!(
            "You have been dispatched job {job_id} by {caller}. Job request, status, and \
             output live under {job_dir} in your workspace; update status.json and write \
             output.json when you produce a result."
        );

        let outcome = self
            .execution
            .task(TaskRequest {
                agent_name: target,
                trigger: ExecutionTrigger::AgentTriggered {
                    caller: caller.clone(),
                    call_depth: next_depth,
                },
                initiator: "agent-mediator".to_string(),
                message,
                append_system_prompt: Some(system_prompt),
                deadline: None,
                cancel: CancellationToken::new(),
            })
            .await;

        match &outcome {
            Ok(response) => {
                workspace
                    .write_file(
                        &format!("{job_dir}/status.json"),
                        serde_json::to_vec(&serde_json::json!({
                            "state": "completed",
                            "session_id": response.session_id,
                        }))
                        .expect("job status serializes"),
                    )
                    .await
                    .map_err(MediatorError::from)?;
                workspace
                    .write_file(
                        &format!("{job_dir}/output.json"),
                        serde_json::to_vec(&serde_json::json!({ "result": response.result }))
                            .expect("job output serializes"),
                    )
                    .await
                    .map_err(MediatorError::from)?;
            }
            Err(e) => {
                workspace
                    .write_file(
                        &format!("{job_dir}/status.json"),
                        serde_json::to_vec(&serde_json::json!({
                            "state": "failed",
                            "error": e.to_string(),
                        }))
                        .expect("job status serializes"),
                    )
                    .await
                    .map_err(MediatorError::from)?;
            }
        }

        outcome
    }
}
