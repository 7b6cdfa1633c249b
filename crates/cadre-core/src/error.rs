//! Unified error types for Cadre

use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{AgentOutcome, AgentRunStatus};

/// Unified error type for all Cadre operations
#[derive(Error, Debug)]
pub enum CadreError {
    // Configuration errors - fatal at plan-build time, never retried
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("agent already registered with a different dependency set: {0}")]
    DuplicateAgent(String),

    #[error("circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("agent {agent} depends on unknown agent {dependency}")]
    UnknownDependency { agent: String, dependency: String },

    // Pool errors
    #[error("agent {agent} throttled: {reason}")]
    Throttled { agent: String, reason: String },

    #[error("agent {agent} timed out after {timeout_secs}s")]
    AgentTimeout { agent: String, timeout_secs: u64 },

    #[error("agent {agent} failed after {elapsed_ms}ms: {message}")]
    AgentExecution {
        agent: String,
        elapsed_ms: u64,
        message: String,
    },

    // Run errors - aggregate, carries every per-agent outcome for diagnostics
    #[error("orchestration failed: {}", outcome_summary(.outcomes))]
    OrchestrationFailed {
        outcomes: BTreeMap<String, AgentOutcome>,
    },

    // External collaborators
    #[error("VCS error: {0}")]
    Vcs(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

fn outcome_summary(outcomes: &BTreeMap<String, AgentOutcome>) -> String {
    let failed: Vec<&str> = outcomes
        .values()
        .filter(|o| o.status == AgentRunStatus::Failed)
        .map(|o| o.agent.as_str())
        .collect();
    format!(
        "{} of {} agents failed ({})",
        failed.len(),
        outcomes.len(),
        failed.join(", ")
    )
}

/// Result type alias using CadreError
pub type Result<T> = std::result::Result<T, CadreError>;
