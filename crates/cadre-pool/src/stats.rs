//! Read-only execution statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::AgentStatus;

/// Aggregated statistics for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub name: String,
    pub status: AgentStatus,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub retry_count: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    /// Average over the retained execution history
    pub avg_duration_ms: Option<u64>,
    /// 95th percentile over the retained execution history
    pub p95_duration_ms: Option<u64>,
}

/// Pool-wide aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub agent_count: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
}

/// Average of a duration sample, None when empty
pub(crate) fn average(durations: &[u64]) -> Option<u64> {
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<u64>() / durations.len() as u64)
}

/// Nearest-rank percentile of a duration sample, None when empty
pub(crate) fn percentile(durations: &[u64], pct: f64) -> Option<u64> {
    if durations.is_empty() {
        return None;
    }
    let mut sorted = durations.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() - 1) as f64 * pct).round() as usize;
    Some(sorted[rank])
}
