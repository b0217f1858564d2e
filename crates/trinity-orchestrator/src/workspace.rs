//! Filesystem-backed [`WorkspaceWriter`]/[`WorkspaceFactory`], the first
//! concrete (non-test-double) implementation of either trait: each agent
//! gets its own subdirectory of a configured root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use trinity_injection::{WorkspaceError, WorkspaceWriter};
use trinity_lifecycle::WorkspaceFactory;
use trinity_types::AgentName;

fn to_io_err(e: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io(e.to_string())
}

/// A workspace rooted at `<base>/<agent-name>/`.
pub struct FsWorkspaceWriter {
    root: PathBuf,
}

impl FsWorkspaceWriter {
    fn join(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl WorkspaceWriter for FsWorkspaceWriter {
    async fn ensure_dir(&self, path: &str) -> Result<(), WorkspaceError> {
        tokio::fs::create_dir_all(self.join(path))
            .await
            .map_err(to_io_err)
    }

    async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<(), WorkspaceError> {
        let full = self.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(to_io_err)?;
        }
        let mut file = tokio::fs::File::create(&full).await.map_err(to_io_err)?;
        file.write_all(&contents).await.map_err(to_io_err)?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, WorkspaceError> {
        match tokio::fs::read(self.join(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(to_io_err(e)),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_file(self.join(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(to_io_err(e)),
        }
    }

    async fn has_git_worktree(&self) -> Result<bool, WorkspaceError> {
        Ok(self.root.join(".git").exists())
    }

    async fn ensure_gitignore_line(&self, line: &str) -> Result<(), WorkspaceError> {
        let path = self.root.join(".gitignore");
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(to_io_err(e)),
        };
        if existing.lines().any(|l| l == line) {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(to_io_err)?;
        let mut buf = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            buf.push('\n');
        }
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes()).await.map_err(to_io_err)?;
        Ok(())
    }
}

/// Hands out [`FsWorkspaceWriter`]s rooted at `<base>/<agent-name>/`.
pub struct FsWorkspaceFactory {
    base: PathBuf,
}

impl FsWorkspaceFactory {
    /// Construct a factory rooted at `base`. The directory is not created
    /// until the first agent is started.
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }
}

impl WorkspaceFactory for FsWorkspaceFactory {
    fn workspace_for(&self, agent_name: &AgentName) -> Arc<dyn WorkspaceWriter> {
        Arc::new(FsWorkspaceWriter {
            root: self.base.join(agent_name.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempdir();
        let writer = FsWorkspaceWriter { root: dir.clone() };
        writer.write_file("INSTRUCTIONS.md", b"hello".to_vec()).await.unwrap();
        let read = writer.read_file("INSTRUCTIONS.md").await.unwrap();
        assert_eq!(read, Some(b"hello".to_vec()));
        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn gitignore_line_is_appended_once() {
        let dir = tempdir();
        let writer = FsWorkspaceWriter { root: dir.clone() };
        tokio::fs::create_dir_all(&dir).await.unwrap();
        writer.ensure_gitignore_line(".env").await.unwrap();
        writer.ensure_gitignore_line(".env").await.unwrap();
        let contents = tokio::fs::read_to_string(dir.join(".gitignore")).await.unwrap();
        assert_eq!(contents.lines().filter(|l| *l == ".env").count(), 1);
        tokio::fs::remove_dir_all(dir).await.ok();
    }

    fn tempdir() -> PathBuf {
        std::env::temp_dir().join(format!("trinity-ws-test-{}", uuid::Uuid::new_v4()))
    }
}
