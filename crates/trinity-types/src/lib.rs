#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-types** – Shared primitive types for the Trinity agent orchestration engine.
//!
//! This crate sits at the bottom of the workspace dependency graph. It owns the
//! identifiers, validated newtypes, and small enums that every other component
//! agrees on, but contains no behavior of its own beyond validation and
//! conversion. Storage drivers, the execution engine, the scheduler, and the
//! composition root all depend on this crate rather than redefining these
//! shapes locally.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length, in bytes, of a validated [`AgentName`].
pub const MAX_AGENT_NAME_LEN: usize = 50;
/// Minimum length, in bytes, of a validated [`AgentName`].
pub const MIN_AGENT_NAME_LEN: usize = 3;
/// Maximum length of a principal identifier.
pub const MAX_PRINCIPAL_ID_LEN: usize = 128;
/// Maximum size, in bytes, of a single observation/tool-call payload blob.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024;

//─────────────────────────────
//  Agent name
//─────────────────────────────

/// A validated, globally unique agent identifier.
///
/// Construction is the only validation gate: once an `AgentName` exists it is
/// guaranteed to satisfy `^[a-z0-9][a-z0-9-]{1,48}[a-z0-9]$`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentName(String);

impl AgentName {
    /// Validate and construct a new agent name.
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.len() < MIN_AGENT_NAME_LEN || raw.len() > MAX_AGENT_NAME_LEN {
            return Err(ValidationError::InvalidName(raw));
        }
        let bytes = raw.as_bytes();
        let is_lower_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        let valid_ends = is_lower_alnum(bytes[0]) && is_lower_alnum(bytes[bytes.len() - 1]);
        let valid_body = bytes
            .iter()
            .all(|&b| is_lower_alnum(b) || b == b'-');
        if !valid_ends || !valid_body {
            return Err(ValidationError::InvalidName(raw));
        }
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentName {
    type Error = ValidationError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AgentName> for String {
    fn from(value: AgentName) -> Self {
        value.0
    }
}

/// Errors produced when constructing validated types in this crate.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The supplied agent name does not satisfy the naming pattern.
    #[error("invalid agent name: {0:?}")]
    InvalidName(String),
    /// The supplied principal id was empty or too long.
    #[error("invalid principal id: {0:?}")]
    InvalidPrincipalId(String),
    /// A payload exceeded [`MAX_PAYLOAD_LEN`].
    #[error("payload exceeds maximum size of {MAX_PAYLOAD_LEN} bytes")]
    PayloadTooLarge,
    /// A template reference did not match `local:<id>` or `github:<owner>/<repo>`.
    #[error("invalid template reference: {0:?}")]
    InvalidTemplateRef(String),
}

//─────────────────────────────
//  Principal
//─────────────────────────────

/// Identifier for a human user or automated system actor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Validate and construct a new principal id.
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_PRINCIPAL_ID_LEN {
            return Err(ValidationError::InvalidPrincipalId(raw));
        }
        Ok(Self(raw))
    }

    /// The well-known id of the platform's internal system principal.
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PrincipalId {
    type Error = ValidationError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PrincipalId> for String {
    fn from(value: PrincipalId) -> Self {
        value.0
    }
}

/// Role a [`Principal`] holds; `System` bypasses permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalRole {
    /// Full administrative control over the fleet.
    Admin,
    /// A regular user, scoped to agents they own or share.
    User,
    /// The platform's own supervisory actor. Bypasses permission checks.
    System,
}

/// A human user or automated system actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier.
    pub id: PrincipalId,
    /// Role determining default authorization.
    pub role: PrincipalRole,
}

impl Principal {
    /// Construct the well-known system principal.
    pub fn system() -> Self {
        Self {
            id: PrincipalId::system(),
            role: PrincipalRole::System,
        }
    }

    /// Whether this principal bypasses permission/ownership checks.
    pub fn is_system(&self) -> bool {
        matches!(self.role, PrincipalRole::System)
    }
}

/// The scope of access being requested against an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessScope {
    /// Read agent state and activity.
    Read,
    /// Mutate lifecycle/credentials/schedules.
    Write,
    /// Remove the agent record entirely.
    Delete,
}

//─────────────────────────────
//  Template reference
//─────────────────────────────

/// A reference to a workspace template, resolved externally by the Injection
/// Pipeline's collaborator. The core only parses and forwards this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateRef {
    /// A locally registered template, addressed by opaque id.
    Local(String),
    /// A GitHub-hosted template tree.
    Github {
        /// Repository owner / organization.
        owner: String,
        /// Repository name.
        repo: String,
    },
}

impl TemplateRef {
    /// Parse `local:<id>` or `github:<owner>/<repo>`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if let Some(id) = raw.strip_prefix("local:") {
            if id.is_empty() {
                return Err(ValidationError::InvalidTemplateRef(raw.to_string()));
            }
            return Ok(Self::Local(id.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("github:") {
            let mut parts = rest.splitn(2, '/');
            match (parts.next(), parts.next()) {
                (Some(owner), Some(repo)) if !owner.is_empty() && !repo.is_empty() => {
                    Ok(Self::Github {
                        owner: owner.to_string(),
                        repo: repo.to_string(),
                    })
                }
                _ => Err(ValidationError::InvalidTemplateRef(raw.to_string())),
            }
        } else {
            Err(ValidationError::InvalidTemplateRef(raw.to_string()))
        }
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local:{id}"),
            Self::Github { owner, repo } => write!(f, "github:{owner}/{repo}"),
        }
    }
}

//─────────────────────────────
//  Resource limits & runtime kind
//─────────────────────────────

/// Memory and CPU caps applied when the Container Controller builds a spec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard memory ceiling, in bytes.
    pub memory_bytes: u64,
    /// CPU core allotment (fractional cores permitted).
    pub cpu_cores: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_cores: 1.0,
        }
    }
}

/// Which language-model CLI runtime an agent's container runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Anthropic's Claude Code CLI runtime.
    ClaudeCode,
    /// Google's Gemini CLI runtime.
    Gemini,
    /// OpenAI's Codex CLI runtime.
    Codex,
    /// Any runtime not enumerated above, named by its instruction-file convention.
    Other(String),
}

impl RuntimeKind {
    /// The canonical instruction-file name the Injection Pipeline writes for
    /// this runtime.
    pub fn instruction_file_name(&self) -> &str {
        match self {
            Self::ClaudeCode => "CLAUDE.md",
            Self::Gemini => "GEMINI.md",
            Self::Codex => "AGENTS.md",
            Self::Other(_) => "AGENT.md",
        }
    }
}

//─────────────────────────────
//  Shared folders
//─────────────────────────────

/// Per-agent shared-folder posture (§3 "Shared Folder Config").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFolderConfig {
    /// Whether this agent's `shared-out/` is mountable by peers.
    pub expose: bool,
    /// Whether this agent consumes peers' exposed folders.
    pub consume: bool,
}

//─────────────────────────────
//  Lifecycle
//─────────────────────────────

/// Agent lifecycle state (§4.5). `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Record exists, no container.
    Created,
    /// Container creation in progress.
    Starting,
    /// Container up, injection complete, responsive.
    Running,
    /// Stop requested, container not yet exited.
    Stopping,
    /// Container exited cleanly.
    Stopped,
    /// A lifecycle step failed.
    Error,
    /// Terminal; name is reserved and will not be recycled.
    Deleted,
}

impl LifecycleState {
    /// Whether `self -> next` is a legal transition under §4.5.
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Running, Starting)
                | (Stopped, Starting)
                | (Error, Starting)
                | (Stopped, Deleted)
                | (Error, Deleted)
                | (Created, Deleted)
        )
    }
}

//─────────────────────────────
//  Agent
//─────────────────────────────

/// The full record Identity & Ownership, Lifecycle, and the Container
/// Controller all operate on (§3 "Agent").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable, globally unique name.
    pub name: AgentName,
    /// Immutable after creation.
    pub template_ref: TemplateRef,
    /// The principal that created this agent.
    pub owner: PrincipalId,
    /// Principals with co-access beyond the owner.
    pub sharing: Vec<PrincipalId>,
    /// Memory/CPU caps applied to the container spec.
    pub resource_limits: ResourceLimits,
    /// Which language-model CLI runtime this agent runs.
    pub runtime_kind: RuntimeKind,
    /// The selected model identifier, passed opaquely to the runtime.
    pub model: String,
    /// Master switch for scheduled and self-initiated activity.
    pub autonomy: bool,
    /// Host-privileged mode; grants the container elevated mounts.
    pub full_capabilities: bool,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Forbids deletion regardless of caller (e.g. the platform's own supervisor agent).
    pub system_protected: bool,
    /// Shared-folder posture.
    pub shared_folders: SharedFolderConfig,
    /// Most recent container id, if one has ever been created.
    pub container_id: Option<String>,
    /// Bootstrap shell port, assigned sequentially and stable across restarts.
    pub port: Option<u16>,
    /// When this agent record was created.
    pub created_at: DateTime<Utc>,
    /// When this agent last transitioned into `starting`.
    pub last_started_at: Option<DateTime<Utc>>,
}

//─────────────────────────────
//  Permission edges
//─────────────────────────────

/// A directed permission edge (§3 "Permission Edge"). Absence means denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEdge {
    /// The agent allowed to initiate calls.
    pub source_agent: AgentName,
    /// The agent that may be called.
    pub target_agent: AgentName,
    /// Principal that granted this edge.
    pub granted_by: PrincipalId,
    /// When this edge was granted.
    pub granted_at: DateTime<Utc>,
}

//─────────────────────────────
//  Executions
//─────────────────────────────

/// Execution identifier (UUID v4, monotone by creation order within a process).
pub type ExecutionId = Uuid;

/// Chat session identifier, opaque to the core; owned per-agent for chat,
/// per-call for task.
pub type SessionId = Uuid;

/// Which of the two Execution Engine entry points produced an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Serialized, session-preserving.
    Chat,
    /// Stateless, parallel.
    Task,
}

/// What caused an execution to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionTrigger {
    /// A human or control-plane caller.
    Manual,
    /// The Scheduler.
    Scheduled {
        /// The schedule that fired.
        schedule_id: Uuid,
    },
    /// The agent RPC/MCP surface.
    Mcp,
    /// Another agent, via the Inter-Agent Call Mediator.
    AgentTriggered {
        /// The calling agent.
        caller: AgentName,
        /// Hop count within the current call chain (1-based).
        call_depth: u8,
    },
}

/// Terminal or in-flight status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Aborted by timeout.
    TimedOut,
    /// Aborted by explicit cancellation.
    Cancelled,
}

/// A single execution record (§3 "Execution").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique id, assigned before work begins.
    pub id: ExecutionId,
    /// Target agent.
    pub agent_name: AgentName,
    /// Chat or task.
    pub mode: ExecutionMode,
    /// What triggered this execution.
    pub trigger: ExecutionTrigger,
    /// Principal or agent name that requested the work.
    pub initiator: String,
    /// When the engine accepted the request.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Chat session id; `None` for task executions.
    pub session_id: Option<SessionId>,
    /// Captured spend, in USD.
    pub cost_usd: f64,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Wall-clock duration once terminal.
    pub duration_ms: Option<u64>,
    /// Error kind name, if the execution failed.
    pub error: Option<String>,
}

//─────────────────────────────
//  Activity
//─────────────────────────────

/// Activity record identifier; monotone per agent.
pub type ActivityId = u64;

/// The category of an [`ActivityRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Agent lifecycle state changed.
    StateTransition,
    /// An execution began.
    ExecutionStarted,
    /// An execution reached a terminal status.
    ExecutionEnded,
    /// A tool invocation parsed from structured model output.
    ToolCall,
    /// An inter-agent call edge was exercised.
    AgentEdge,
    /// A supervisor or scheduler alert.
    Alert,
    /// A schedule evaluated and fired (or was skipped).
    ScheduleFired,
}

/// Severity attached to an [`ActivityRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine, informational.
    Info,
    /// Recoverable but noteworthy.
    Warn,
    /// Surfaced as an operational failure.
    Error,
    /// Requires operator attention.
    Critical,
}

/// An append-only activity record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Monotone id, scoped per agent.
    pub id: ActivityId,
    /// Wall-clock time the event was appended.
    pub timestamp: DateTime<Utc>,
    /// Category of event.
    pub kind: ActivityKind,
    /// Agent this record concerns.
    pub agent_name: AgentName,
    /// Associated execution, if any.
    pub execution_id: Option<ExecutionId>,
    /// Peer agent, for `AgentEdge` records.
    pub peer_agent: Option<AgentName>,
    /// Kind-specific structured payload.
    pub payload: serde_json::Value,
    /// Severity classification.
    pub severity: Severity,
}

//─────────────────────────────
//  Schedules
//─────────────────────────────

/// A cron or one-shot trigger definition owned by a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule id.
    pub id: Uuid,
    /// Agent this schedule fires chat executions against.
    pub agent_name: AgentName,
    /// The trigger expression.
    pub trigger: ScheduleTrigger,
    /// Prompt delivered to the agent when this schedule fires.
    pub message: String,
    /// Whether this schedule currently participates in tick evaluation.
    pub enabled: bool,
    /// Principal that owns (and may mutate) this schedule.
    pub owner_principal: PrincipalId,
}

/// Either a recurring cron expression or a single future instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleTrigger {
    /// Standard 5-field cron expression, evaluated in `timezone`.
    Cron {
        /// The cron expression, e.g. `"0 9 * * *"`.
        expression: String,
        /// IANA timezone name the expression is evaluated in.
        timezone: String,
    },
    /// Fires exactly once at the given UTC instant.
    OneShot {
        /// The instant this schedule fires at.
        at: DateTime<Utc>,
    },
}

//─────────────────────────────
//  Error taxonomy (§7)
//─────────────────────────────

/// The single error taxonomy shared across every Trinity component.
///
/// Each lower-level component defines its own error enum for internal
/// matching convenience, but every public boundary ultimately converts into
/// `TrinityError` so callers (and the control-plane transport layer) see one
/// consistent set of kinds.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TrinityError {
    /// No such agent, schedule, or execution.
    #[error("not found: {0}")]
    NotFound(String),
    /// Agent name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// Agent name already in use.
    #[error("name conflict: {0}")]
    NameConflict(String),
    /// Caller lacks ownership/sharing rights over the target agent.
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    /// Caller agent lacks a permission edge to the target agent.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A concurrency cap was exceeded; retry after the given number of seconds.
    #[error("rate limited, retry after {retry_after_secs}s: {0}", retry_after_secs = .1)]
    RateLimited(String, u64),
    /// The agent's daily cost limit has been reached.
    #[error("budget exceeded: {0}")]
    Budgeted(String),
    /// An inter-agent call chain exceeded the maximum hop count.
    #[error("call depth exceeded: {0}")]
    DepthExceeded(String),
    /// A lifecycle operation was attempted against an agent that is not running.
    #[error("agent not running: {0}")]
    AgentNotRunning(String),
    /// The agent's template reference could not be resolved.
    #[error("template resolve failed: {0}")]
    TemplateResolveFailed(String),
    /// The injection pipeline failed partway through.
    #[error("injection failed: {0}")]
    InjectionFailed(String),
    /// The container runtime collaborator is unreachable or erroring.
    #[error("container unavailable: {0}")]
    ContainerUnavailable(String),
    /// An execution exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
    /// An execution was explicitly cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// An unexpected internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TrinityError {
    /// Whether this kind carries a caller-facing advisory retry-after.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited(_, secs) => Some(*secs),
            _ => None,
        }
    }

    /// True for the 4xx-class kinds that are surfaced to callers unchanged.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidName(_)
                | Self::NameConflict(_)
                | Self::NotAuthorized(_)
                | Self::PermissionDenied(_)
                | Self::RateLimited(_, _)
                | Self::Budgeted(_)
                | Self::DepthExceeded(_)
        )
    }
}

impl From<ValidationError> for TrinityError {
    fn from(value: ValidationError) -> Self {
        match value {
            ValidationError::InvalidName(n) => TrinityError::InvalidName(n),
            ValidationError::InvalidPrincipalId(n) => TrinityError::NotAuthorized(n),
            ValidationError::PayloadTooLarge => {
                TrinityError::Internal("payload too large".to_string())
            }
            ValidationError::InvalidTemplateRef(n) => TrinityError::TemplateResolveFailed(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_name_accepts_valid_patterns() {
        assert!(AgentName::new("echo").is_ok());
        assert!(AgentName::new("daily-report").is_ok());
        assert!(AgentName::new("worker-01").is_ok());
    }

    #[test]
    fn agent_name_rejects_invalid_patterns() {
        assert!(AgentName::new("Echo").is_err());
        assert!(AgentName::new("-echo").is_err());
        assert!(AgentName::new("echo-").is_err());
        assert!(AgentName::new("e").is_err());
        assert!(AgentName::new("").is_err());
    }

    #[test]
    fn template_ref_roundtrips() {
        let local = TemplateRef::parse("local:base-python").unwrap();
        assert_eq!(local.to_string(), "local:base-python");

        let gh = TemplateRef::parse("github:acme/widgets").unwrap();
        assert_eq!(gh.to_string(), "github:acme/widgets");

        assert!(TemplateRef::parse("ftp:nope").is_err());
    }

    #[test]
    fn lifecycle_transitions_match_state_machine() {
        use LifecycleState::*;
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Error.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Deleted));
        assert!(Stopped.can_transition_to(Deleted));
    }

    #[test]
    fn principal_system_bypasses() {
        let p = Principal::system();
        assert!(p.is_system());
    }
}
