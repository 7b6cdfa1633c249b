//! Agent pool: the composite execution gate and accounting

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use cadre_bus::{topics, EventBus};
use cadre_core::{CadreError, PoolDefaults, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::stats::{average, percentile, AgentStats, PoolStats};

/// Executions retained per agent for duration statistics
const HISTORY_LIMIT: usize = 50;

/// Safety configuration for one agent
#[derive(Debug, Clone)]
pub struct AgentPoolConfig {
    /// Deadline for a single execution
    pub timeout: StdDuration,
    /// Retries the caller may attempt; the pool itself never retries
    pub max_retries: u32,
    /// Minimum idle time between executions
    pub cooldown: Duration,
    /// Maximum executions within `rate_window`
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Maximum executions within `burst_window` (circular-update guard)
    pub burst_limit: u32,
    pub burst_window: Duration,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self::from_defaults(&PoolDefaults::default())
    }
}

impl AgentPoolConfig {
    pub fn from_defaults(defaults: &PoolDefaults) -> Self {
        Self {
            timeout: StdDuration::from_secs(defaults.timeout_secs),
            max_retries: defaults.max_retries,
            cooldown: Duration::seconds(defaults.cooldown_secs as i64),
            rate_limit: defaults.rate_limit,
            rate_window: Duration::seconds(60),
            burst_limit: defaults.burst_limit,
            burst_window: Duration::minutes(5),
        }
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_rate_limit(mut self, limit: u32) -> Self {
        self.rate_limit = limit;
        self
    }

    pub fn with_burst_limit(mut self, limit: u32) -> Self {
        self.burst_limit = limit;
        self
    }
}

/// Pool-visible status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Failed,
    Cooldown,
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    duration_ms: u64,
    success: bool,
}

/// Per-agent runtime state; written only by the pool's execution path
struct AgentState {
    config: AgentPoolConfig,
    status: AgentStatus,
    last_execution_time: Option<DateTime<Utc>>,
    total_executions: u64,
    successful_executions: u64,
    failed_executions: u64,
    retry_count: u64,
    history: VecDeque<ExecutionRecord>,
    /// Start timestamps inside the burst window, for the two rate gates
    recent_starts: VecDeque<DateTime<Utc>>,
}

impl AgentState {
    fn new(config: AgentPoolConfig) -> Self {
        Self {
            config,
            status: AgentStatus::Idle,
            last_execution_time: None,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            retry_count: 0,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            recent_starts: VecDeque::new(),
        }
    }

    /// Reason the composite gate blocks execution, None when clear
    fn gate_reason(&mut self, now: DateTime<Utc>) -> Option<String> {
        // Cooldown: minimum idle time since the last start
        if let Some(last) = self.last_execution_time {
            let idle = now - last;
            if idle < self.config.cooldown {
                let remaining = self.config.cooldown - idle;
                return Some(format!("cooldown ({}s remaining)", remaining.num_seconds()));
            }
        }

        // Prune starts that fell out of the widest window
        let burst_cutoff = now - self.config.burst_window;
        while self
            .recent_starts
            .front()
            .is_some_and(|t| *t < burst_cutoff)
        {
            self.recent_starts.pop_front();
        }

        // Rate limit over the trailing 60-second window
        let rate_cutoff = now - self.config.rate_window;
        let in_rate_window = self
            .recent_starts
            .iter()
            .filter(|t| **t >= rate_cutoff)
            .count() as u32;
        if in_rate_window >= self.config.rate_limit {
            return Some(format!(
                "rate limit ({} executions in the last {}s)",
                in_rate_window,
                self.config.rate_window.num_seconds()
            ));
        }

        // Circular-update guard over the trailing 5-minute window
        if self.recent_starts.len() as u32 >= self.config.burst_limit {
            return Some(format!(
                "circular-update guard ({} executions in the last {}s)",
                self.recent_starts.len(),
                self.config.burst_window.num_seconds()
            ));
        }

        None
    }

    fn record_completion(&mut self, duration_ms: u64, success: bool, status: AgentStatus) {
        self.status = status;
        if success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(ExecutionRecord {
            duration_ms,
            success,
        });
    }
}

/// Execution-safety wrapper around every agent invocation
///
/// Single-writer discipline: only the pool's own execution path mutates the
/// per-agent record; stats queries read snapshots.
pub struct AgentPool {
    agents: Mutex<HashMap<String, AgentState>>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl AgentPool {
    pub fn new(bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            bus,
            clock,
        }
    }

    /// Register an agent with its safety configuration
    pub fn register_agent(&self, name: impl Into<String>, config: AgentPoolConfig) {
        let name = name.into();
        debug!("Pool registering agent {}", name);
        self.agents
            .lock()
            .expect("pool lock poisoned")
            .entry(name)
            .or_insert_with(|| AgentState::new(config));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.agents
            .lock()
            .expect("pool lock poisoned")
            .contains_key(name)
    }

    /// Composite gate: cooldown AND rate limit AND circular-update guard
    pub fn can_execute(&self, name: &str) -> bool {
        let now = self.clock.now();
        let mut agents = self.agents.lock().expect("pool lock poisoned");
        match agents.get_mut(name) {
            Some(state) => state.gate_reason(now).is_none(),
            None => false,
        }
    }

    /// Run one agent execution under the pool's safety invariants
    ///
    /// Fails with `Throttled` without invoking the executor when the gate is
    /// closed. A timeout marks the agent failed and puts it in cooldown
    /// status. Executor errors are wrapped with the agent name and elapsed
    /// time; the pool accounts for failures but never hides them.
    pub async fn execute<T, F>(&self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let (timeout, started_at) = {
            let now = self.clock.now();
            let mut agents = self.agents.lock().expect("pool lock poisoned");
            let state = agents.get_mut(name).ok_or_else(|| {
                CadreError::Configuration(format!("agent {} not registered with pool", name))
            })?;

            if let Some(reason) = state.gate_reason(now) {
                debug!("Agent {} throttled: {}", name, reason);
                return Err(CadreError::Throttled {
                    agent: name.to_string(),
                    reason,
                });
            }

            if state.status == AgentStatus::Failed {
                state.retry_count += 1;
            }
            state.status = AgentStatus::Running;
            state.last_execution_time = Some(now);
            state.recent_starts.push_back(now);
            state.total_executions += 1;
            (state.config.timeout, now)
        };

        self.publish(topics::AGENT_STARTED, name, Map::new());

        let clock_start = std::time::Instant::now();
        let outcome = tokio::time::timeout(timeout, fut).await;
        let duration_ms = clock_start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                self.complete(name, duration_ms, true, AgentStatus::Idle);
                let mut data = Map::new();
                data.insert("duration_ms".to_string(), json!(duration_ms));
                self.publish(topics::AGENT_COMPLETED, name, data);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.complete(name, duration_ms, false, AgentStatus::Failed);
                let message = e.to_string();
                warn!("Agent {} failed after {}ms: {}", name, duration_ms, message);

                let mut data = Map::new();
                data.insert("duration_ms".to_string(), json!(duration_ms));
                data.insert("error".to_string(), json!(message));
                self.publish(topics::AGENT_FAILED, name, data);

                Err(CadreError::AgentExecution {
                    agent: name.to_string(),
                    elapsed_ms: duration_ms,
                    message,
                })
            }
            Err(_) => {
                self.complete(name, duration_ms, false, AgentStatus::Cooldown);
                warn!(
                    "Agent {} timed out after {}s (started {})",
                    name,
                    timeout.as_secs(),
                    started_at
                );

                let mut data = Map::new();
                data.insert("duration_ms".to_string(), json!(duration_ms));
                data.insert("error".to_string(), json!("timeout"));
                self.publish(topics::AGENT_FAILED, name, data);

                Err(CadreError::AgentTimeout {
                    agent: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    fn complete(&self, name: &str, duration_ms: u64, success: bool, status: AgentStatus) {
        let mut agents = self.agents.lock().expect("pool lock poisoned");
        if let Some(state) = agents.get_mut(name) {
            state.record_completion(duration_ms, success, status);
        }
    }

    fn publish(&self, topic: &str, agent: &str, mut data: Map<String, Value>) {
        data.insert("agent".to_string(), json!(agent));
        // Lifecycle events are infrastructure; a bus problem must not fail
        // the execution path
        if let Err(e) = self.bus.publish(topic, data) {
            warn!("Failed to publish {}: {}", topic, e);
        }
    }

    /// Read-only snapshot of one agent's statistics
    pub fn agent_stats(&self, name: &str) -> Option<AgentStats> {
        let agents = self.agents.lock().expect("pool lock poisoned");
        agents.get(name).map(|state| {
            let durations: Vec<u64> = state.history.iter().map(|r| r.duration_ms).collect();
            AgentStats {
                name: name.to_string(),
                status: state.status,
                total_executions: state.total_executions,
                successful_executions: state.successful_executions,
                failed_executions: state.failed_executions,
                retry_count: state.retry_count,
                last_execution_time: state.last_execution_time,
                avg_duration_ms: average(&durations),
                p95_duration_ms: percentile(&durations, 0.95),
            }
        })
    }

    /// Read-only pool-wide aggregation
    pub fn pool_stats(&self) -> PoolStats {
        let agents = self.agents.lock().expect("pool lock poisoned");
        PoolStats {
            agent_count: agents.len(),
            total_executions: agents.values().map(|s| s.total_executions).sum(),
            successful_executions: agents.values().map(|s| s.successful_executions).sum(),
            failed_executions: agents.values().map(|s| s.failed_executions).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use cadre_bus::EventFilter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool_with_clock(config_for: &str, config: AgentPoolConfig) -> (AgentPool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::start_now());
        let pool = AgentPool::new(EventBus::new(), Arc::clone(&clock) as Arc<dyn Clock>);
        pool.register_agent(config_for, config);
        (pool, clock)
    }

    fn permissive() -> AgentPoolConfig {
        AgentPoolConfig::default()
            .with_cooldown(Duration::zero())
            .with_rate_limit(100)
            .with_burst_limit(100)
    }

    #[tokio::test]
    async fn test_execute_success_accounting() {
        let (pool, _) = pool_with_clock("build", permissive());

        let result = pool.execute("build", async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);

        let stats = pool.agent_stats("build").unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 0);
        assert_eq!(stats.status, AgentStatus::Idle);
        assert!(stats.last_execution_time.is_some());
    }

    #[tokio::test]
    async fn test_unregistered_agent_is_configuration_error() {
        let pool = AgentPool::new(EventBus::new(), Arc::new(ManualClock::start_now()));
        let result = pool.execute("ghost", async { Ok(()) }).await;
        assert!(matches!(result, Err(CadreError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_until_elapsed() {
        let config = permissive().with_cooldown(Duration::seconds(10));
        let (pool, clock) = pool_with_clock("lint", config);

        pool.execute("lint", async { Ok(()) }).await.unwrap();

        // Immediate second call hits the cooldown
        assert!(!pool.can_execute("lint"));
        let result = pool.execute("lint", async { Ok(()) }).await;
        assert!(matches!(result, Err(CadreError::Throttled { .. })));

        clock.advance(Duration::seconds(11));
        assert!(pool.can_execute("lint"));
        pool.execute("lint", async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_exactly_n_plus_one() {
        let config = permissive().with_rate_limit(3);
        let (pool, _) = pool_with_clock("codegen", config);

        for _ in 0..3 {
            pool.execute("codegen", async { Ok(()) }).await.unwrap();
        }

        // The (N+1)th rapid call fails, and only that one
        let result = pool.execute("codegen", async { Ok(()) }).await;
        match result {
            Err(CadreError::Throttled { agent, reason }) => {
                assert_eq!(agent, "codegen");
                assert!(reason.contains("rate limit"));
            }
            other => panic!("expected Throttled, got {:?}", other.map(|_| ())),
        }

        let stats = pool.agent_stats("codegen").unwrap();
        assert_eq!(stats.total_executions, 3);
    }

    #[tokio::test]
    async fn test_rate_window_slides() {
        let config = permissive().with_rate_limit(2);
        let (pool, clock) = pool_with_clock("scan", config);

        pool.execute("scan", async { Ok(()) }).await.unwrap();
        pool.execute("scan", async { Ok(()) }).await.unwrap();
        assert!(!pool.can_execute("scan"));

        clock.advance(Duration::seconds(61));
        assert!(pool.can_execute("scan"));
    }

    #[tokio::test]
    async fn test_circular_guard_tighter_window() {
        let config = permissive().with_rate_limit(100).with_burst_limit(3);
        let (pool, clock) = pool_with_clock("fixer", config);

        for _ in 0..3 {
            pool.execute("fixer", async { Ok(()) }).await.unwrap();
            // Past the rate window but still inside the 5-minute guard
            clock.advance(Duration::seconds(70));
        }

        let result = pool.execute("fixer", async { Ok(()) }).await;
        match result {
            Err(CadreError::Throttled { reason, .. }) => {
                assert!(reason.contains("circular-update guard"));
            }
            other => panic!("expected Throttled, got {:?}", other.map(|_| ())),
        }

        clock.advance(Duration::minutes(6));
        assert!(pool.can_execute("fixer"));
    }

    #[tokio::test]
    async fn test_timeout_marks_failed_and_cooldown() {
        let config = permissive().with_timeout(StdDuration::from_millis(20));
        let (pool, _) = pool_with_clock("slow", config);

        let result: Result<()> = pool
            .execute("slow", async {
                tokio::time::sleep(StdDuration::from_millis(200)).await;
                Ok(())
            })
            .await;

        match result {
            Err(CadreError::AgentTimeout { agent, .. }) => assert_eq!(agent, "slow"),
            other => panic!("expected AgentTimeout, got {:?}", other.map(|_| ())),
        }

        let stats = pool.agent_stats("slow").unwrap();
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.status, AgentStatus::Cooldown);
    }

    #[tokio::test]
    async fn test_executor_error_wrapped_with_agent_and_timing() {
        let (pool, _) = pool_with_clock("flaky", permissive());

        let result: Result<()> = pool
            .execute("flaky", async {
                Err(CadreError::Other("template render failed".to_string()))
            })
            .await;

        match result {
            Err(CadreError::AgentExecution { agent, message, .. }) => {
                assert_eq!(agent, "flaky");
                assert!(message.contains("template render failed"));
            }
            other => panic!("expected AgentExecution, got {:?}", other.map(|_| ())),
        }

        let stats = pool.agent_stats("flaky").unwrap();
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_count_increments_after_failure() {
        let (pool, _) = pool_with_clock("retrier", permissive());

        let _ = pool
            .execute("retrier", async {
                Err::<(), _>(CadreError::Other("boom".to_string()))
            })
            .await;
        pool.execute("retrier", async { Ok(()) }).await.unwrap();

        let stats = pool.agent_stats("retrier").unwrap();
        assert_eq!(stats.retry_count, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let bus = EventBus::new();
        let pool = AgentPool::new(bus.clone(), Arc::new(ManualClock::start_now()));
        pool.register_agent("build", permissive());

        pool.execute("build", async { Ok(()) }).await.unwrap();
        let _ = pool
            .execute("build", async {
                Err::<(), _>(CadreError::Other("boom".to_string()))
            })
            .await;

        assert_eq!(
            bus.history(Some(&EventFilter::new().with_type(topics::AGENT_STARTED)))
                .len(),
            2
        );
        assert_eq!(
            bus.history(Some(&EventFilter::new().with_type(topics::AGENT_COMPLETED)))
                .len(),
            1
        );
        let failed = bus.history(Some(&EventFilter::new().with_type(topics::AGENT_FAILED)));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data_str("agent"), Some("build"));
    }

    #[tokio::test]
    async fn test_throttled_call_does_not_invoke_executor() {
        let config = permissive().with_rate_limit(1);
        let (pool, _) = pool_with_clock("once", config);
        let invocations = Arc::new(AtomicUsize::new(0));

        let inv = Arc::clone(&invocations);
        pool.execute("once", async move {
            inv.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        let inv = Arc::clone(&invocations);
        let result = pool
            .execute("once", async move {
                inv.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CadreError::Throttled { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_stats_aggregate() {
        let (pool, _) = pool_with_clock("a", permissive());
        pool.register_agent("b", permissive());

        pool.execute("a", async { Ok(()) }).await.unwrap();
        pool.execute("b", async { Ok(()) }).await.unwrap();
        let _ = pool
            .execute("b", async { Err::<(), _>(CadreError::Other("x".to_string())) })
            .await;

        let stats = pool.pool_stats();
        assert_eq!(stats.agent_count, 2);
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.successful_executions, 2);
        assert_eq!(stats.failed_executions, 1);
    }
}
