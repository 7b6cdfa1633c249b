//! Core type definitions for Cadre orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of one agent within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    /// Agent finished and reported success
    Succeeded,
    /// Agent finished with an error, timed out, or was throttled
    Failed,
    /// Agent was never started because an earlier level failed or the run
    /// was stopped
    Unattempted,
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Unattempted => write!(f, "unattempted"),
        }
    }
}

/// Recorded outcome of one agent within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent: String,
    pub status: AgentRunStatus,
    /// Error message when status is Failed
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl AgentOutcome {
    pub fn succeeded(agent: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent: agent.into(),
            status: AgentRunStatus::Succeeded,
            error: None,
            finished_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
        }
    }

    pub fn failed(agent: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent: agent.into(),
            status: AgentRunStatus::Failed,
            error: Some(error.into()),
            finished_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
        }
    }

    pub fn unattempted(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: AgentRunStatus::Unattempted,
            error: None,
            finished_at: None,
            duration_ms: None,
        }
    }
}

/// State of an orchestration run
///
/// `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Planning,
    Executing { level: usize },
    Committed,
    RolledBack,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Planning => write!(f, "planning"),
            Self::Executing { level } => write!(f, "executing(level {})", level),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Target platform of a test failure, used by the tier-2 fix dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Backend,
    Frontend,
    Mobile,
    Infra,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend => write!(f, "backend"),
            Self::Frontend => write!(f, "frontend"),
            Self::Mobile => write!(f, "mobile"),
            Self::Infra => write!(f, "infra"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            "mobile" => Ok(Self::Mobile),
            "infra" => Ok(Self::Infra),
            _ => Err(format!("Invalid platform: {}", s)),
        }
    }
}

/// Failure classification assigned upstream by the test runners
///
/// Classification itself is pattern matching over runner output and lives
/// with the runners; the loop manager only consumes the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ModuleNotFound,
    UndefinedSymbol,
    MissingRoute,
    NullDereference,
    Other,
}

impl FailureKind {
    /// Whether the tier-1 pattern fixer may attempt this failure
    pub fn auto_fixable(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModuleNotFound => write!(f, "module_not_found"),
            Self::UndefinedSymbol => write!(f, "undefined_symbol"),
            Self::MissingRoute => write!(f, "missing_route"),
            Self::NullDereference => write!(f, "null_dereference"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A single classified test failure, as delivered on the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Fully qualified test name
    pub test_name: String,
    /// Runner output for this failure
    pub message: String,
    pub platform: Platform,
    pub kind: FailureKind,
}

impl TestFailure {
    pub fn new(
        test_name: impl Into<String>,
        message: impl Into<String>,
        platform: Platform,
        kind: FailureKind,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            message: message.into(),
            platform,
            kind,
        }
    }
}
