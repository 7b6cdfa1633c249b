//! Command-backed agents
//!
//! The CLI materializes the `[[agents]]` manifest into agents whose
//! `execute` runs a configured shell command in the repository root. The
//! orchestration core stays agnostic of what the command does.

use async_trait::async_trait;
use cadre_core::{AgentManifestEntry, CadreError, Result};
use cadre_orchestrator::{Agent, AgentContext, AgentLoader, AgentReport};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Agent that runs one shell command
pub struct CommandAgent {
    name: String,
    command: String,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Truncate long process output for reports and error messages
fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...[truncated]", &s[..max])
    } else {
        s.to_string()
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn execute(&self, ctx: &AgentContext) -> Result<AgentReport> {
        debug!("Agent {} running: {}", self.name, self.command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&ctx.repo_root)
            .output()
            .await
            .map_err(|e| {
                CadreError::Other(format!("failed to spawn {:?}: {}", self.command, e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(CadreError::Other(format!(
                "{:?} exited with {}:\n{}\n{}",
                self.command,
                output.status,
                truncate(stdout.trim(), 4000),
                truncate(stderr.trim(), 4000)
            )));
        }

        Ok(AgentReport::new(truncate(stdout.trim(), 400)))
    }
}

/// Build a lazy loader for one manifest entry
pub fn command_agent_loader(entry: &AgentManifestEntry) -> AgentLoader {
    let name = entry.name.clone();
    let command = entry.command.clone();
    Arc::new(move || Ok(Arc::new(CommandAgent::new(name.clone(), command.clone())) as Arc<dyn Agent>))
}
