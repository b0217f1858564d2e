#![forbid(unsafe_code)]

//! **trinity-cli** – command-line interface for the Trinity orchestration
//! engine.
//!
//! Boots the reference in-memory [`Orchestrator`] (in-memory store,
//! simulated container runtime) and drives it from a single subcommand per
//! invocation. `daemon` is the one long-running mode: it spawns the
//! Scheduler and Supervisor background loops and blocks until Ctrl+C.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use trinity_execution::{ChatRequest, TaskRequest};
use trinity_lifecycle::InjectionMaterial;
use trinity_orchestrator::{Orchestrator, Settings};
use trinity_types::{AgentName, ExecutionTrigger, PrincipalId, RuntimeKind};

#[derive(Parser)]
#[command(name = "trinity")]
#[command(about = "Trinity agent orchestration engine CLI")]
#[command(version)]
struct Cli {
    /// Path to a YAML settings file; falls back to built-in defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new agent record.
    CreateAgent {
        /// Agent name.
        name: String,
        /// Owning principal id.
        #[arg(long, default_value = "cli-user")]
        owner: String,
        /// Template reference, e.g. `local:base`.
        #[arg(long, default_value = "local:base")]
        template: String,
    },
    /// Start an agent: creates/reuses its container, injects its workspace,
    /// health-probes, then marks it running.
    Start {
        /// Agent name.
        name: String,
    },
    /// Stop a running agent.
    Stop {
        /// Agent name.
        name: String,
        /// Grace period, in seconds, before a forceful stop.
        #[arg(long, default_value_t = 10)]
        grace_secs: u64,
    },
    /// Stop (if running) then start again, rebuilding mounts.
    Reinitialize {
        /// Agent name.
        name: String,
        #[arg(long, default_value_t = 10)]
        grace_secs: u64,
    },
    /// Permanently remove an agent and its stored state.
    Delete {
        /// Agent name.
        name: String,
    },
    /// List every agent, optionally restricted to one owner.
    List {
        /// Owning principal id.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Send one chat turn to a running agent.
    Chat {
        /// Agent name.
        name: String,
        /// Message body.
        message: String,
    },
    /// Send one stateless task turn to a running agent.
    Task {
        /// Agent name.
        name: String,
        /// Task prompt.
        message: String,
    },
    /// Grant a directed call permission `source -> target`.
    Grant {
        /// Calling agent.
        source: String,
        /// Callable agent.
        target: String,
    },
    /// Revoke a directed call permission `source -> target`.
    Revoke {
        /// Calling agent.
        source: String,
        /// Callable agent.
        target: String,
    },
    /// Suspend schedule admission fleet-wide.
    PauseSchedules,
    /// Resume schedule admission fleet-wide.
    ResumeSchedules,
    /// Stop every currently-running agent.
    EmergencyStop,
    /// Start every currently-stopped-or-errored agent.
    RestartAll,
    /// Run the Scheduler and Supervisor loops until interrupted.
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    trinity_orchestrator::init_tracing(&settings);

    let orchestrator = Orchestrator::bootstrap(settings);
    info!("trinity-cli starting up");

    match cli.command {
        Commands::CreateAgent { name, owner, template } => {
            let agent = orchestrator
                .create_agent(&name, &owner, &template, RuntimeKind::ClaudeCode)
                .await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        Commands::Start { name } => {
            let agent_name = AgentName::new(name)?;
            let agent = orchestrator
                .start_agent(&agent_name, InjectionMaterial::default())
                .await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        Commands::Stop { name, grace_secs } => {
            let agent_name = AgentName::new(name)?;
            let agent = orchestrator
                .stop_agent(&agent_name, Duration::from_secs(grace_secs))
                .await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        Commands::Reinitialize { name, grace_secs } => {
            let agent_name = AgentName::new(name)?;
            let agent = orchestrator
                .reinitialize_agent(
                    &agent_name,
                    Duration::from_secs(grace_secs),
                    InjectionMaterial::default(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        Commands::Delete { name } => {
            let agent_name = AgentName::new(name)?;
            orchestrator.delete_agent(&agent_name).await?;
            println!("deleted");
        }
        Commands::List { owner } => {
            let owner = owner.map(PrincipalId::new).transpose()?;
            let agents = orchestrator.list_agents(owner.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&agents)?);
        }
        Commands::Chat { name, message } => {
            let agent_name = AgentName::new(name)?;
            let response = orchestrator
                .chat(ChatRequest {
                    agent_name,
                    trigger: ExecutionTrigger::Manual,
                    initiator: "trinity-cli".to_string(),
                    message,
                    resume_session_id: None,
                    deadline: None,
                    cancel: CancellationToken::new(),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Task { name, message } => {
            let agent_name = AgentName::new(name)?;
            let response = orchestrator
                .task(TaskRequest {
                    agent_name,
                    trigger: ExecutionTrigger::Manual,
                    initiator: "trinity-cli".to_string(),
                    message,
                    append_system_prompt: None,
                    deadline: None,
                    cancel: CancellationToken::new(),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Grant { source, target } => {
            orchestrator
                .grant_call(
                    AgentName::new(source)?,
                    AgentName::new(target)?,
                    PrincipalId::new("cli-user")?,
                )
                .await?;
            println!("granted");
        }
        Commands::Revoke { source, target } => {
            orchestrator
                .revoke_call(&AgentName::new(source)?, &AgentName::new(target)?)
                .await?;
            println!("revoked");
        }
        Commands::PauseSchedules => {
            orchestrator.pause_all_schedules().await?;
            println!("schedules paused");
        }
        Commands::ResumeSchedules => {
            orchestrator.resume_all_schedules().await?;
            println!("schedules resumed");
        }
        Commands::EmergencyStop => {
            orchestrator.emergency_stop().await?;
            println!("emergency stop complete");
        }
        Commands::RestartAll => {
            orchestrator.restart_all().await?;
            println!("restart complete");
        }
        Commands::Daemon => run_daemon(&orchestrator).await?,
    }

    Ok(())
}

async fn run_daemon(orchestrator: &std::sync::Arc<Orchestrator>) -> Result<()> {
    println!("starting scheduler and supervisor loops (ctrl-c to stop)");
    let cancel = CancellationToken::new();
    let handles = orchestrator.spawn_background(cancel.clone());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    println!("shutdown signal received");
    cancel.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    println!("daemon stopped");
    Ok(())
}
