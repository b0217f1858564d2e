#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-injection** – Injection Pipeline (§4.4).
//!
//! Runs on every transition into `running`. Idempotent: re-running with the
//! same inputs produces byte-identical workspace state (§8 property 6).
//! Filesystem access is abstracted behind [`WorkspaceWriter`] so this crate
//! can be exercised without a real mounted volume; the Lifecycle component
//! supplies a concrete writer bound to the container's workspace mount.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use trinity_types::{AgentName, RuntimeKind};

const PLATFORM_DIR: &str = ".trinity";
const CUSTOM_INSTRUCTIONS_HEADER: &str = "## Custom Instructions\n";

/// Errors a [`WorkspaceWriter`] may surface while materializing workspace
/// state.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The underlying storage medium (disk, volume) is unavailable or erroring.
    #[error("workspace io error: {0}")]
    Io(String),
}

/// Abstraction over the agent's workspace filesystem.
///
/// Paths are relative to the workspace root (`/home/developer` in a real
/// deployment). Implementations must make `write_file`/`ensure_dir`
/// idempotent: writing the same bytes twice must not change observable
/// state beyond a modification time.
#[async_trait]
pub trait WorkspaceWriter: Send + Sync {
    /// Ensure a directory (and its ancestors) exists.
    async fn ensure_dir(&self, path: &str) -> Result<(), WorkspaceError>;

    /// Overwrite (or create) a file with the given contents.
    async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<(), WorkspaceError>;

    /// Read a file's contents, if it exists.
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, WorkspaceError>;

    /// Remove a file if present; a no-op otherwise.
    async fn remove_file(&self, path: &str) -> Result<(), WorkspaceError>;

    /// Whether a git working tree is present at the workspace root.
    async fn has_git_worktree(&self) -> Result<bool, WorkspaceError>;

    /// Append a line to `.gitignore`, creating it if necessary and skipping
    /// the append if the line is already present.
    async fn ensure_gitignore_line(&self, line: &str) -> Result<(), WorkspaceError>;
}

/// Inputs to one run of the Injection Pipeline.
pub struct InjectionInput<'a> {
    /// The agent whose workspace is being seeded.
    pub agent_name: &'a AgentName,
    /// Which runtime's instruction-file convention to use.
    pub runtime_kind: &'a RuntimeKind,
    /// Template-provided instruction file body (before the custom suffix).
    pub template_body: &'a str,
    /// `settings.trinity_prompt`; appended as a Custom Instructions block
    /// when non-empty, removed from the file entirely when empty.
    pub trinity_prompt: &'a str,
    /// Resolved credential KEY=VALUE pairs for `.env`.
    pub credentials: &'a BTreeMap<String, String>,
    /// Template-referenced config files: (path, template-with-`${NAME}`-placeholders).
    pub config_templates: &'a [(String, String)],
    /// Names of peer agents whose shared-out directory this agent may mount,
    /// already filtered to `self -> peer` edge present AND `peer.expose`.
    pub exposed_peers: &'a [AgentName],
}

/// Idempotently seeds an agent's workspace. See §4.4 for the numbered steps.
pub struct InjectionPipeline;

impl InjectionPipeline {
    /// Run the full pipeline against `workspace`.
    pub async fn run(
        workspace: &dyn WorkspaceWriter,
        input: InjectionInput<'_>,
    ) -> Result<(), WorkspaceError> {
        Self::step_platform_dir(workspace).await?;
        Self::step_instruction_file(workspace, &input).await?;
        Self::step_credentials(workspace, &input).await?;
        Self::step_shared_folders(workspace, &input).await?;
        Self::step_default_dirs(workspace).await?;
        Ok(())
    }

    /// Step 1: ensure the platform directory and instruction file exist.
    async fn step_platform_dir(workspace: &dyn WorkspaceWriter) -> Result<(), WorkspaceError> {
        workspace.ensure_dir(PLATFORM_DIR).await?;
        workspace
            .write_file(
                &format!("{PLATFORM_DIR}/PLATFORM.md"),
                b"# Trinity platform notes\n\nPlanning, then acting. Use vector memory for anything you'll need beyond this session.\n"
                    .to_vec(),
            )
            .await
    }

    /// Step 2: write/refresh the agent instruction file, adding or removing
    /// the Custom Instructions block to track `trinity_prompt`.
    async fn step_instruction_file(
        workspace: &dyn WorkspaceWriter,
        input: &InjectionInput<'_>,
    ) -> Result<(), WorkspaceError> {
        let file_name = input.runtime_kind.instruction_file_name();
        let mut body = input.template_body.to_string();
        if !input.trinity_prompt.is_empty() {
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(CUSTOM_INSTRUCTIONS_HEADER);
            body.push_str(input.trinity_prompt);
            if !body.ends_with('\n') {
                body.push('\n');
            }
        }
        workspace.write_file(file_name, body.into_bytes()).await
    }

    /// Step 3 (also independently callable as a hot-reload): materialize
    /// credentials and interpolate template-referenced config files.
    pub async fn step_credentials(
        workspace: &dyn WorkspaceWriter,
        input: &InjectionInput<'_>,
    ) -> Result<(), WorkspaceError> {
        let mut env_contents = String::new();
        for (key, value) in input.credentials {
            env_contents.push_str(key);
            env_contents.push('=');
            env_contents.push_str(value);
            env_contents.push('\n');
        }
        workspace
            .write_file(".env", env_contents.into_bytes())
            .await?;

        for (path, template) in input.config_templates {
            let rendered = interpolate(template, input.credentials);
            workspace.write_file(path, rendered.into_bytes()).await?;
        }
        Ok(())
    }

    /// Step 4: materialize shared-folder mount points for exposed peers.
    ///
    /// This crate only ensures the local directory structure; the actual
    /// bind mounts are realized by the Container Controller from the same
    /// `exposed_peers` list when the container spec is built.
    async fn step_shared_folders(
        workspace: &dyn WorkspaceWriter,
        input: &InjectionInput<'_>,
    ) -> Result<(), WorkspaceError> {
        workspace.ensure_dir("shared-out").await?;
        workspace.ensure_dir("shared-in").await?;
        for peer in input.exposed_peers {
            workspace
                .ensure_dir(&format!("shared-in/{peer}"))
                .await?;
        }
        Ok(())
    }

    /// Step 5: ensure default workspace directories exist.
    async fn step_default_dirs(workspace: &dyn WorkspaceWriter) -> Result<(), WorkspaceError> {
        for dir in ["workspace", "plans/active", "plans/archive", "content"] {
            workspace.ensure_dir(dir).await?;
        }
        if workspace.has_git_worktree().await? {
            workspace.ensure_gitignore_line("content/").await?;
        }
        Ok(())
    }
}

fn interpolate(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find('}') {
                let name = &template[i + 2..i + 2 + end];
                if let Some(value) = values.get(name) {
                    out.push_str(value);
                } else {
                    out.push_str(&template[i..i + 2 + end + 1]);
                }
                i += 2 + end + 1;
                continue;
            }
        }
        let (idx, ch) = chars.next().unwrap();
        debug_assert_eq!(idx, i);
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryWorkspace {
        files: Mutex<HashMap<String, Vec<u8>>>,
        dirs: Mutex<std::collections::HashSet<String>>,
        git: bool,
    }

    #[async_trait]
    impl WorkspaceWriter for InMemoryWorkspace {
        async fn ensure_dir(&self, path: &str) -> Result<(), WorkspaceError> {
            self.dirs.lock().unwrap().insert(path.to_string());
            Ok(())
        }

        async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<(), WorkspaceError> {
            self.files.lock().unwrap().insert(path.to_string(), contents);
            Ok(())
        }

        async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, WorkspaceError> {
            Ok(self.files.lock().unwrap().get(path).cloned())
        }

        async fn remove_file(&self, path: &str) -> Result<(), WorkspaceError> {
            self.files.lock().unwrap().remove(path);
            Ok(())
        }

        async fn has_git_worktree(&self) -> Result<bool, WorkspaceError> {
            Ok(self.git)
        }

        async fn ensure_gitignore_line(&self, line: &str) -> Result<(), WorkspaceError> {
            let mut files = self.files.lock().unwrap();
            let existing = files
                .get(".gitignore")
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            if !existing.lines().any(|l| l == line) {
                let mut updated = existing;
                if !updated.is_empty() && !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push_str(line);
                updated.push('\n');
                files.insert(".gitignore".to_string(), updated.into_bytes());
            }
            Ok(())
        }
    }

    fn empty_creds() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn two_consecutive_runs_are_byte_identical() {
        let ws = InMemoryWorkspace::default();
        let agent = AgentName::new("echo").unwrap();
        let creds = empty_creds();
        let input = || InjectionInput {
            agent_name: &agent,
            runtime_kind: &RuntimeKind::ClaudeCode,
            template_body: "Be helpful.",
            trinity_prompt: "Always sign off with -Trinity",
            credentials: &creds,
            config_templates: &[],
            exposed_peers: &[],
        };

        InjectionPipeline::run(&ws, input()).await.unwrap();
        let first = ws.read_file("CLAUDE.md").await.unwrap();
        InjectionPipeline::run(&ws, input()).await.unwrap();
        let second = ws.read_file("CLAUDE.md").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_trinity_prompt_removes_custom_instructions_block() {
        let ws = InMemoryWorkspace::default();
        let agent = AgentName::new("echo").unwrap();
        let creds = empty_creds();

        InjectionPipeline::run(
            &ws,
            InjectionInput {
                agent_name: &agent,
                runtime_kind: &RuntimeKind::ClaudeCode,
                template_body: "Be helpful.",
                trinity_prompt: "Custom suffix",
                credentials: &creds,
                config_templates: &[],
                exposed_peers: &[],
            },
        )
        .await
        .unwrap();
        let with_prompt = ws.read_file("CLAUDE.md").await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&with_prompt).contains("Custom Instructions"));

        InjectionPipeline::run(
            &ws,
            InjectionInput {
                agent_name: &agent,
                runtime_kind: &RuntimeKind::ClaudeCode,
                template_body: "Be helpful.",
                trinity_prompt: "",
                credentials: &creds,
                config_templates: &[],
                exposed_peers: &[],
            },
        )
        .await
        .unwrap();
        let without_prompt = ws.read_file("CLAUDE.md").await.unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&without_prompt).contains("Custom Instructions"));
    }

    #[tokio::test]
    async fn credentials_are_interpolated_into_config_templates() {
        let ws = InMemoryWorkspace::default();
        let agent = AgentName::new("echo").unwrap();
        let mut creds = BTreeMap::new();
        creds.insert("API_KEY".to_string(), "sk-test-123".to_string());

        InjectionPipeline::run(
            &ws,
            InjectionInput {
                agent_name: &agent,
                runtime_kind: &RuntimeKind::ClaudeCode,
                template_body: "",
                trinity_prompt: "",
                credentials: &creds,
                config_templates: &[("config.toml".to_string(), "key = \"${API_KEY}\"".to_string())],
                exposed_peers: &[],
            },
        )
        .await
        .unwrap();

        let env = ws.read_file(".env").await.unwrap().unwrap();
        assert_eq!(String::from_utf8_lossy(&env), "API_KEY=sk-test-123\n");

        let cfg = ws.read_file("config.toml").await.unwrap().unwrap();
        assert_eq!(String::from_utf8_lossy(&cfg), "key = \"sk-test-123\"");
    }

    #[tokio::test]
    async fn shared_in_dirs_created_for_exposed_peers() {
        let ws = InMemoryWorkspace::default();
        let agent = AgentName::new("echo").unwrap();
        let peer = AgentName::new("beta").unwrap();
        let creds = empty_creds();

        InjectionPipeline::run(
            &ws,
            InjectionInput {
                agent_name: &agent,
                runtime_kind: &RuntimeKind::ClaudeCode,
                template_body: "",
                trinity_prompt: "",
                credentials: &creds,
                config_templates: &[],
                exposed_peers: std::slice::from_ref(&peer),
            },
        )
        .await
        .unwrap();

        assert!(ws.dirs.lock().unwrap().contains("shared-in/beta"));
    }
}
