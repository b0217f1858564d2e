#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-llm-gateway** – Model runtime contract (§6).
//!
//! Invokes the in-container language-model CLI via [`ContainerController::exec`]
//! and parses its structured JSON output into a [`ModelResponse`]. This is
//! the only place in the repository that knows the shape of that JSON;
//! unrecognized fields are ignored rather than rejected, per §6.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use trinity_container::{ContainerController, ContainerError, ContainerId};
use trinity_types::SessionId;
use uuid::Uuid;

/// A request to run one turn against an agent's model runtime.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// The user-facing message/prompt to deliver.
    pub message: String,
    /// Prior session to resume, if continuing a chat.
    pub resume_session_id: Option<SessionId>,
    /// Appended to the runtime's system prompt for this call only.
    pub append_system_prompt: Option<String>,
    /// Restrict the runtime to this tool allowlist, if set.
    pub allowed_tools: Option<Vec<String>>,
}

/// One parsed tool invocation from the structured output stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallRecord {
    /// Tool name as reported by the runtime.
    pub name: String,
    /// Arguments passed to the tool.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Raw structured JSON emitted by the model runtime CLI, deserialized
/// directly. Unknown fields are dropped by serde's default behavior.
#[derive(Debug, Clone, Deserialize)]
struct RawModelOutput {
    session_id: Uuid,
    cost_usd: f64,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    result: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallRecord>,
}

/// Parsed result of one model runtime invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ModelResponse {
    /// Session id the runtime reports (fresh for task mode, continued for chat).
    pub session_id: SessionId,
    /// Reported spend, in USD.
    pub cost_usd: f64,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Final assistant-facing response text.
    pub result: String,
    /// Ordered tool invocations made during this turn.
    #[serde(skip)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Percentage of the runtime-specific context window consumed.
    pub context_pct: f64,
}

/// Errors surfaced while invoking or parsing the model runtime.
#[derive(Debug, Error)]
pub enum ModelRuntimeError {
    /// The underlying container exec failed.
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// The runtime's stdout was not valid structured JSON.
    #[error("failed to parse model runtime output: {0}")]
    MalformedOutput(String),
    /// The runtime exited non-zero.
    #[error("model runtime exited with status {0}")]
    NonZeroExit(i32),
}

/// Runtime-specific context window sizes, used to compute `context_pct`.
/// Unrecognized runtimes fall back to a conservative default.
pub fn context_window_tokens(model: &str) -> u64 {
    match model {
        m if m.contains("opus") || m.contains("sonnet") => 200_000,
        m if m.contains("gemini") => 1_000_000,
        m if m.contains("gpt") || m.contains("codex") => 128_000,
        _ => 128_000,
    }
}

/// Invoke the model runtime inside `container_id` and parse its output.
///
/// Builds the command line the way every supported runtime expects it:
/// the message as a positional argument, `--output-format json`, `--resume
/// <id>` when continuing a session, `--append-system-prompt <text>`, and
/// `--allowed-tools <csv>` when restricting tools.
pub async fn invoke(
    controller: &dyn ContainerController,
    container_id: &ContainerId,
    model: &str,
    request: ModelRequest,
    deadline: Duration,
    cancel: CancellationToken,
) -> Result<ModelResponse, ModelRuntimeError> {
    let mut argv = vec![request.message.clone(), "--output-format".to_string(), "json".to_string()];
    if let Some(session_id) = request.resume_session_id {
        argv.push("--resume".to_string());
        argv.push(session_id.to_string());
    }
    if let Some(prompt) = &request.append_system_prompt {
        argv.push("--append-system-prompt".to_string());
        argv.push(prompt.clone());
    }
    if let Some(tools) = &request.allowed_tools {
        argv.push("--allowed-tools".to_string());
        argv.push(tools.join(","));
    }

    let env = HashMap::new();
    let exec_result = controller
        .exec(container_id, argv, env, deadline, cancel)
        .await?;

    if exec_result.exit_code != 0 {
        return Err(ModelRuntimeError::NonZeroExit(exec_result.exit_code));
    }

    let raw: RawModelOutput = serde_json::from_slice(&exec_result.stdout)
        .map_err(|e| ModelRuntimeError::MalformedOutput(e.to_string()))?;

    let window = context_window_tokens(model);
    let context_pct = if window == 0 {
        0.0
    } else {
        (raw.input_tokens + raw.output_tokens) as f64 / window as f64 * 100.0
    };

    Ok(ModelResponse {
        session_id: raw.session_id,
        cost_usd: raw.cost_usd,
        input_tokens: raw.input_tokens,
        output_tokens: raw.output_tokens,
        result: raw.result,
        tool_calls: raw.tool_calls,
        context_pct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_selection() {
        assert_eq!(context_window_tokens("claude-opus-4"), 200_000);
        assert_eq!(context_window_tokens("gemini-2.5-pro"), 1_000_000);
        assert_eq!(context_window_tokens("unknown-model"), 128_000);
    }

    #[test]
    fn parses_well_formed_output_and_ignores_unknown_fields() {
        let raw = serde_json::json!({
            "session_id": "3fa85f64-5717-4562-b3fc-2c963f66afa6",
            "cost_usd": 0.02,
            "input_tokens": 100,
            "output_tokens": 50,
            "result": "hi",
            "tool_calls": [],
            "some_future_field": "ignored"
        });
        let parsed: RawModelOutput = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.result, "hi");
        assert_eq!(parsed.input_tokens, 100);
    }
}
