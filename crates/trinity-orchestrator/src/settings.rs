//! Ambient configuration (§6): a YAML file, overridable by environment
//! variables prefixed `TRINITY_`, the way operators expect to tune a
//! long-running service without rebuilding it.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Tunables for every background loop and default concurrency cap in the
/// orchestration engine. All fields have sane defaults; a deployment only
/// needs to override what it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Scheduler tick interval, in seconds.
    pub scheduler_tick_secs: u64,
    /// Supervisor sweep interval, in seconds.
    pub supervisor_tick_secs: u64,
    /// Default container image reference for agents that don't override it.
    pub default_image: String,
    /// Base port the Container Controller assigns bootstrap shells from.
    pub port_base: u16,
    /// Per-agent daily spend ceiling, in USD, before the Supervisor disables
    /// that agent's autonomy.
    pub daily_cost_limit_usd: f64,
    /// Maximum concurrent task executions for a single agent.
    pub task_agent_cap: usize,
    /// Maximum concurrent task executions fleet-wide.
    pub task_global_cap: usize,
    /// Filesystem root under which each agent's workspace directory is
    /// created (`<root>/<agent-name>/`).
    pub workspace_root: String,
    /// `RUST_LOG`-style filter directive used when tracing isn't otherwise
    /// configured by the environment.
    pub default_log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheduler_tick_secs: 15,
            supervisor_tick_secs: 60,
            default_image: "trinity/agent:latest".to_string(),
            port_base: trinity_container::DEFAULT_PORT_BASE,
            daily_cost_limit_usd: trinity_supervisor::DEFAULT_DAILY_COST_LIMIT_USD,
            task_agent_cap: trinity_execution::DEFAULT_TASK_AGENT_CAP,
            task_global_cap: trinity_execution::DEFAULT_TASK_GLOBAL_CAP,
            workspace_root: "./trinity-workspaces".to_string(),
            default_log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load from `path` if it exists, falling back to defaults, then apply
    /// `TRINITY_*` environment overrides on top.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&raw)?
            }
            _ => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRINITY_SCHEDULER_TICK_SECS") {
            if let Ok(parsed) = v.parse() {
                self.scheduler_tick_secs = parsed;
            }
        }
        if let Ok(v) = std::env::var("TRINITY_SUPERVISOR_TICK_SECS") {
            if let Ok(parsed) = v.parse() {
                self.supervisor_tick_secs = parsed;
            }
        }
        if let Ok(v) = std::env::var("TRINITY_DEFAULT_IMAGE") {
            self.default_image = v;
        }
        if let Ok(v) = std::env::var("TRINITY_WORKSPACE_ROOT") {
            self.workspace_root = v;
        }
        if let Ok(v) = std::env::var("TRINITY_DAILY_COST_LIMIT_USD") {
            if let Ok(parsed) = v.parse() {
                self.daily_cost_limit_usd = parsed;
            }
        }
    }
}
