//! The agent contract
//!
//! Every external collaborator - generators, analyzers, test runners -
//! satisfies one trait with a single `execute` capability. The orchestrator
//! never sees their internals; it invokes them through lazy loaders that are
//! memoized per run so repeated runs get fresh instances.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cadre_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

/// Context handed to every agent execution
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Changed files that triggered this run; empty means "run everything"
    pub changed_files: Vec<String>,
    pub repo_root: PathBuf,
    /// Structured input for the invocation (e.g. the failure batch handed
    /// to a fix agent)
    pub payload: Map<String, Value>,
    /// Flips to true when the run is cooperatively stopped; long-running
    /// agents should check it between units of work
    cancelled: watch::Receiver<bool>,
}

impl AgentContext {
    pub fn new(repo_root: impl Into<PathBuf>, cancelled: watch::Receiver<bool>) -> Self {
        Self {
            changed_files: Vec::new(),
            repo_root: repo_root.into(),
            payload: Map::new(),
            cancelled,
        }
    }

    pub fn with_changed_files(mut self, changed_files: Vec<String>) -> Self {
        self.changed_files = changed_files;
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

/// Result payload from a single agent execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReport {
    pub summary: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl AgentReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// An independently invocable unit of work
#[async_trait]
pub trait Agent: Send + Sync {
    /// Perform the agent's work, resolving with a report or failing with an
    /// error. Agents may publish their own progress events but are not
    /// required to.
    async fn execute(&self, ctx: &AgentContext) -> Result<AgentReport>;
}

/// Factory producing an executable agent instance on first use within a run
pub type AgentLoader = Arc<dyn Fn() -> Result<Arc<dyn Agent>> + Send + Sync>;
