//! Configuration management for Cadre
//!
//! Repository-level settings live in `.cadre/config.toml`. Every knob has a
//! default so a missing file or a partial file both work.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{CadreError, Result};

/// Repository-level Cadre configuration
///
/// Loaded from `.cadre/config.toml` in the repo root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadreConfig {
    /// Orchestrator execution defaults
    #[serde(default)]
    pub orchestrator: OrchestratorDefaults,

    /// Agent pool safety defaults
    #[serde(default)]
    pub pool: PoolDefaults,

    /// Autonomous loop defaults
    #[serde(default)]
    pub loop_defaults: LoopDefaults,

    /// Agents registered by the CLI, executed as shell commands
    #[serde(default)]
    pub agents: Vec<AgentManifestEntry>,
}

/// Orchestrator execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorDefaults {
    /// Maximum agents running concurrently within a level
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Whether a failed level rolls back to the run checkpoint
    #[serde(default = "default_rollback_enabled")]
    pub rollback_enabled: bool,

    /// Directory for checkpoint records, relative to the repo root
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
}

/// Agent pool safety defaults, applied to agents without explicit overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDefaults {
    /// Per-execution deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries the caller may attempt before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum idle seconds between two executions of the same agent
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Maximum executions per agent in the trailing 60-second window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Maximum executions per agent in the trailing 5-minute window
    /// (circular-update guard)
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
}

/// Autonomous loop defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDefaults {
    /// Maximum fix/retest iterations per loop cycle
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Backoff base in seconds; attempt n waits base * 2^n
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Upper bound on the computed backoff
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

/// One agent as declared in the manifest consumed by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifestEntry {
    /// Unique agent name
    pub name: String,

    /// Shell command the agent runs
    pub command: String,

    /// Names of agents that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Glob patterns mapping changed files to this agent
    #[serde(default)]
    pub file_patterns: Vec<String>,
}

// Default value providers
fn default_max_concurrency() -> usize {
    5
}

fn default_rollback_enabled() -> bool {
    true
}

fn default_checkpoint_dir() -> String {
    ".cadre/checkpoints".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_rate_limit() -> u32 {
    10
}

fn default_burst_limit() -> u32 {
    3
}

fn default_max_iterations() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_cap_secs() -> u64 {
    60
}

impl CadreConfig {
    /// Load configuration from `.cadre/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".cadre/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| CadreError::Configuration(format!("Failed to parse config: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.cadre/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".cadre");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| CadreError::Configuration(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl Default for OrchestratorDefaults {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            rollback_enabled: default_rollback_enabled(),
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            cooldown_secs: default_cooldown_secs(),
            rate_limit: default_rate_limit(),
            burst_limit: default_burst_limit(),
        }
    }
}

impl Default for LoopDefaults {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}
