//! VCS command execution abstraction
//!
//! Checkpoint capture and restore shell out to git through this seam so
//! tests can substitute canned responses.

use async_trait::async_trait;
use cadre_core::{CadreError, Result};
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a VCS command
#[derive(Debug, Clone)]
pub struct VcsOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl From<Output> for VcsOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing VCS commands (allows mocking in tests)
#[async_trait]
pub trait VcsExecutor: Send + Sync {
    /// Execute a git command with the given arguments
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &PathBuf;
}

/// Real git command executor
#[derive(Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    /// Create a new git executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Auto-detect repository root from the current directory
    pub async fn detect() -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .await
            .map_err(|e| CadreError::Vcs(format!("Failed to run git rev-parse: {}", e)))?;

        if !output.status.success() {
            return Err(CadreError::Vcs("Not in a git repository".to_string()));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self::new(root))
    }
}

#[async_trait]
impl VcsExecutor for GitCommand {
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput> {
        debug!("Executing git {:?}", args);

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| CadreError::Vcs(format!("Failed to execute git: {}", e)))?;

        let vcs_output = VcsOutput::from(output);

        if !vcs_output.success {
            debug!("git command failed: {}", vcs_output.stderr);
        }

        Ok(vcs_output)
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Mock VCS executor for testing
#[derive(Clone)]
pub struct MockVcsExecutor {
    repo_root: PathBuf,
    responses: std::collections::HashMap<String, VcsOutput>,
}

impl Default for MockVcsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVcsExecutor {
    pub fn new() -> Self {
        Self {
            repo_root: PathBuf::from("/mock/repo"),
            responses: std::collections::HashMap::new(),
        }
    }

    pub fn with_response(mut self, command: &str, output: VcsOutput) -> Self {
        self.responses.insert(command.to_string(), output);
        self
    }

    /// Convenience: a successful response with the given stdout
    pub fn with_ok(self, command: &str, stdout: &str) -> Self {
        self.with_response(
            command,
            VcsOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                success: true,
            },
        )
    }
}

#[async_trait]
impl VcsExecutor for MockVcsExecutor {
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput> {
        let key = args.join(" ");
        self.responses
            .get(&key)
            .cloned()
            .ok_or_else(|| CadreError::Vcs(format!("No mock response for: {}", key)))
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_executor() {
        let executor = MockVcsExecutor::new().with_ok("rev-parse HEAD", "abc123\n");

        let output = executor.exec(&["rev-parse", "HEAD"]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "abc123\n");
    }

    #[tokio::test]
    async fn test_mock_executor_unknown_command() {
        let executor = MockVcsExecutor::new();
        let result = executor.exec(&["status"]).await;
        assert!(matches!(result, Err(CadreError::Vcs(_))));
    }
}
