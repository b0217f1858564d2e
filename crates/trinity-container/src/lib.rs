#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-container** – Container Controller (§4.3).
//!
//! A thin adapter trait over whatever container runtime is actually
//! deployed; this crate ships only [`ContainerController`] and a simulated
//! reference implementation used for tests and local operation. A real
//! Docker/OCI-backed implementation is an external collaborator (§6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use trinity_types::{AgentName, ResourceLimits, TemplateRef};

/// Base port the controller assigns bootstrap shells from; skips in-use ports.
pub const DEFAULT_PORT_BASE: u16 = 2290;

/// Everything the Container Controller needs to create a container for an
/// agent.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference resolved from the agent's runtime kind.
    pub image: String,
    /// Agent this spec belongs to.
    pub agent_name: AgentName,
    /// Memory/CPU caps.
    pub resource_limits: ResourceLimits,
    /// Fixed labels identifying this container as a Trinity-managed agent.
    pub labels: HashMap<String, String>,
    /// Bootstrap shell port.
    pub port: u16,
    /// Read-only bind mounts layered on top of the writable workspace volume
    /// (peer shared-out directories, and for deployed workers, the
    /// `system/policies` and `system/processes` enforcement mounts).
    pub readonly_mounts: Vec<(String, String)>,
}

/// Build the canonical label set for an agent's container spec.
pub fn build_spec(
    agent_name: &AgentName,
    template_ref: &TemplateRef,
    resource_limits: ResourceLimits,
    image: impl Into<String>,
    port: u16,
    readonly_mounts: Vec<(String, String)>,
) -> ContainerSpec {
    let mut labels = HashMap::new();
    labels.insert("trinity.platform".to_string(), "agent".to_string());
    labels.insert("trinity.agent-name".to_string(), agent_name.to_string());
    labels.insert("trinity.template".to_string(), template_ref.to_string());
    ContainerSpec {
        image: image.into(),
        agent_name: agent_name.clone(),
        resource_limits,
        labels,
        port,
        readonly_mounts,
    }
}

/// Opaque container identifier handed back by the runtime collaborator.
pub type ContainerId = String;

/// Liveness classification returned by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Container process is running.
    Running,
    /// Container exited with status 0.
    ExitedClean,
    /// Container exited with a non-zero status.
    ExitedError,
    /// The container was killed by the out-of-memory killer.
    OomKilled,
    /// No such container (e.g. already removed).
    Unknown,
}

/// Point-in-time resource usage snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ContainerStats {
    /// CPU utilization, 0.0-100.0 per core-normalized percent.
    pub cpu_pct: f64,
    /// Resident memory, in bytes.
    pub mem_bytes: u64,
    /// Cumulative bytes received.
    pub net_rx: u64,
    /// Cumulative bytes sent.
    pub net_tx: u64,
    /// Time since the container started.
    pub uptime: Duration,
}

/// Result of an `exec` call.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

/// Errors surfaced by a [`ContainerController`] implementation.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime collaborator is unreachable or erroring.
    #[error("container unavailable: {0}")]
    Unavailable(String),
    /// The operation exceeded its deadline.
    #[error("exec timed out")]
    Timeout,
    /// The operation was cancelled via its [`CancellationToken`].
    #[error("exec cancelled")]
    Cancelled,
    /// No container with the given id.
    #[error("no such container: {0}")]
    NotFound(ContainerId),
}

/// Abstract operations over the container runtime collaborator (§4.3, §6).
///
/// Every blocking operation (`exec`, `start`, `stop`, `stats`) accepts a
/// deadline and a [`CancellationToken`] so the Execution Engine can always
/// make good on a caller or platform-ceiling timeout (§5).
#[async_trait]
pub trait ContainerController: Send + Sync {
    /// Allocate a new container from `spec`, returning its id.
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerId, ContainerError>;

    /// Start a previously created container.
    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError>;

    /// Stop a running container, allowing up to `grace` for clean shutdown.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), ContainerError>;

    /// Permanently remove a stopped container.
    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError>;

    /// Execute `argv` inside the container, with `env` merged into its
    /// environment, aborting if `deadline` elapses or `cancel` fires first.
    async fn exec(
        &self,
        id: &ContainerId,
        argv: Vec<String>,
        env: HashMap<String, String>,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecResult, ContainerError>;

    /// Current liveness classification.
    async fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus, ContainerError>;

    /// Tail of the container's combined log stream.
    async fn logs(&self, id: &ContainerId, tail: usize) -> Result<Vec<u8>, ContainerError>;

    /// Point-in-time resource usage.
    async fn stats(&self, id: &ContainerId) -> Result<ContainerStats, ContainerError>;
}

/// Sequentially assigns bootstrap-shell ports, skipping ones already in use.
pub struct PortAllocator {
    next: AtomicU16,
    in_use: DashMap<u16, ()>,
}

impl PortAllocator {
    /// Construct an allocator starting from `base` (default [`DEFAULT_PORT_BASE`]).
    pub fn new(base: u16) -> Self {
        Self {
            next: AtomicU16::new(base),
            in_use: DashMap::new(),
        }
    }

    /// Reserve and return the next free port.
    pub fn allocate(&self) -> u16 {
        loop {
            let candidate = self.next.fetch_add(1, Ordering::SeqCst);
            if self.in_use.insert(candidate, ()).is_none() {
                return candidate;
            }
        }
    }

    /// Mark a specific port as reserved (used to restore a persisted
    /// assignment across restarts of the same agent).
    pub fn reserve(&self, port: u16) {
        self.in_use.insert(port, ());
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_BASE)
    }
}

//─────────────────────────────
//  Simulated reference controller
//─────────────────────────────

struct SimulatedContainer {
    status: ContainerStatus,
    started_at: DateTime<Utc>,
}

/// In-process, simulated [`ContainerController`] for tests and local
/// operation without a real container runtime. `exec` always succeeds
/// instantly with exit code 0 and an empty result; callers that need
/// realistic structured output layer [`trinity_llm_gateway`] on top.
pub struct SimulatedContainerController {
    containers: DashMap<ContainerId, SimulatedContainer>,
    ports: PortAllocator,
}

impl Default for SimulatedContainerController {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedContainerController {
    /// Construct a fresh simulated controller.
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            ports: PortAllocator::default(),
        }
    }

    /// Allocate the next bootstrap-shell port.
    pub fn allocate_port(&self) -> u16 {
        self.ports.allocate()
    }

    /// Reserve a previously persisted port assignment.
    pub fn reserve_port(&self, port: u16) {
        self.ports.reserve(port);
    }

    /// Force a container into a given status, for supervisor/health tests.
    pub fn set_status(&self, id: &ContainerId, status: ContainerStatus) {
        if let Some(mut entry) = self.containers.get_mut(id) {
            entry.status = status;
        }
    }
}

#[async_trait]
impl ContainerController for SimulatedContainerController {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerId, ContainerError> {
        let id = format!("sim-{}-{}", spec.agent_name, uuid::Uuid::new_v4().simple());
        self.containers.insert(
            id.clone(),
            SimulatedContainer {
                status: ContainerStatus::ExitedClean,
                started_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let mut entry = self
            .containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::NotFound(id.clone()))?;
        entry.status = ContainerStatus::Running;
        entry.started_at = Utc::now();
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, _grace: Duration) -> Result<(), ContainerError> {
        let mut entry = self
            .containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::NotFound(id.clone()))?;
        entry.status = ContainerStatus::ExitedClean;
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.containers
            .remove(id)
            .ok_or_else(|| ContainerError::NotFound(id.clone()))?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &ContainerId,
        _argv: Vec<String>,
        _env: HashMap<String, String>,
        _deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecResult, ContainerError> {
        if !self.containers.contains_key(id) {
            return Err(ContainerError::NotFound(id.clone()));
        }
        if cancel.is_cancelled() {
            return Err(ContainerError::Cancelled);
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus, ContainerError> {
        Ok(self
            .containers
            .get(id)
            .map(|e| e.status)
            .unwrap_or(ContainerStatus::Unknown))
    }

    async fn logs(&self, id: &ContainerId, _tail: usize) -> Result<Vec<u8>, ContainerError> {
        if !self.containers.contains_key(id) {
            return Err(ContainerError::NotFound(id.clone()));
        }
        Ok(Vec::new())
    }

    async fn stats(&self, id: &ContainerId) -> Result<ContainerStats, ContainerError> {
        let entry = self
            .containers
            .get(id)
            .ok_or_else(|| ContainerError::NotFound(id.clone()))?;
        Ok(ContainerStats {
            cpu_pct: 0.0,
            mem_bytes: 0,
            net_rx: 0,
            net_tx: 0,
            uptime: (Utc::now() - entry.started_at)
                .to_std()
                .unwrap_or_default(),
        })
    }
}
