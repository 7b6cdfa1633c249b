//! Autonomous loop manager - test-failure-driven fix/retry cycles
//!
//! Closes the loop between a `tests.failed` event and automatic
//! remediation. The bus handler only forwards triggers into a channel; the
//! manager task drives each cycle as an explicit state machine with a
//! next-eligible-attempt time, so no thread is ever parked on a backoff
//! sleep.
//!
//! Each iteration applies the tiered fix strategy: the tier-1 pattern fixer
//! takes every failure classified auto-fixable upstream, then tier 2 groups
//! the remaining failures by platform and runs each mapped agent once with
//! its full batch. A re-run through the injected test runner decides whether
//! the cycle succeeded, retries with capped exponential backoff, or
//! exhausts its iteration budget.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cadre_bus::{topics, EventBus, Subscription};
use cadre_core::{CadreError, LoopDefaults, Platform, Result, TestFailure};
use cadre_pool::{AgentPool, Clock};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentContext};

/// Configuration for the loop manager
#[derive(Debug, Clone)]
pub struct LoopManagerConfig {
    /// Maximum fix/retest iterations per cycle
    pub max_iterations: u32,
    /// Backoff base; attempt n waits `base * 2^n`, capped
    pub backoff_base: StdDuration,
    pub backoff_cap: StdDuration,
    /// Tier-1 pattern-fix agent, applied to auto-fixable failures
    pub tier1_agent: Option<String>,
    /// Tier-2 platform -> agent mapping for the remaining failures
    pub platform_agents: BTreeMap<Platform, String>,
    /// Granularity at which due cycles are advanced
    pub tick: StdDuration,
}

impl Default for LoopManagerConfig {
    fn default() -> Self {
        Self::from_defaults(&LoopDefaults::default())
    }
}

impl LoopManagerConfig {
    pub fn from_defaults(defaults: &LoopDefaults) -> Self {
        Self {
            max_iterations: defaults.max_iterations,
            backoff_base: StdDuration::from_secs(defaults.backoff_base_secs),
            backoff_cap: StdDuration::from_secs(defaults.backoff_cap_secs),
            tier1_agent: None,
            platform_agents: BTreeMap::new(),
            tick: StdDuration::from_millis(50),
        }
    }

    pub fn with_tier1_agent(mut self, name: impl Into<String>) -> Self {
        self.tier1_agent = Some(name.into());
        self
    }

    pub fn with_platform_agent(mut self, platform: Platform, name: impl Into<String>) -> Self {
        self.platform_agents.insert(platform, name.into());
        self
    }
}

/// Re-runs the failing suite for a source and reports remaining failures
///
/// External collaborator boundary: the real implementation drives the
/// platform test runners through the orchestrator.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, source: &str) -> Result<Vec<TestFailure>>;
}

/// Status of a loop cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Running,
    Succeeded,
    Exhausted,
}

/// One fix/retest cycle for a failure source
#[derive(Debug, Clone)]
pub struct LoopCycle {
    pub loop_id: Uuid,
    pub source: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub failures: Vec<TestFailure>,
    pub status: CycleStatus,
    /// Earliest time the next iteration may start
    pub next_eligible_at: DateTime<Utc>,
    pub tiers_attempted: BTreeSet<u8>,
}

struct LoopTrigger {
    source: String,
    failures: Vec<TestFailure>,
}

/// Build the event payload a test runner publishes on `tests.failed`
pub fn test_failure_payload(source: &str, failures: &[TestFailure]) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("source".to_string(), json!(source));
    data.insert("failures".to_string(), json!(failures));
    data
}

fn backoff_for(iteration: u32, base: StdDuration, cap: StdDuration) -> StdDuration {
    let factor = 2u32.saturating_pow(iteration.min(16));
    base.saturating_mul(factor).min(cap)
}

/// Drives autonomous remediation cycles
pub struct AutonomousLoopManager {
    config: LoopManagerConfig,
    bus: EventBus,
    pool: Arc<AgentPool>,
    fix_agents: HashMap<String, Arc<dyn Agent>>,
    test_runner: Arc<dyn TestRunner>,
    clock: Arc<dyn Clock>,
    repo_root: PathBuf,
    cycles: Mutex<HashMap<String, LoopCycle>>,
    tx: mpsc::UnboundedSender<LoopTrigger>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<LoopTrigger>>>,
    /// Never-cancelled source for fix-agent contexts
    cancel_tx: watch::Sender<bool>,
}

impl AutonomousLoopManager {
    pub fn new(
        config: LoopManagerConfig,
        bus: EventBus,
        pool: Arc<AgentPool>,
        test_runner: Arc<dyn TestRunner>,
        clock: Arc<dyn Clock>,
        repo_root: impl Into<PathBuf>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, _) = watch::channel(false);

        Self {
            config,
            bus,
            pool,
            fix_agents: HashMap::new(),
            test_runner,
            clock,
            repo_root: repo_root.into(),
            cycles: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel_tx,
        }
    }

    /// Register a fix-capable agent by name, with its pool safety config
    pub fn register_fix_agent(
        &mut self,
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
        pool_config: cadre_pool::AgentPoolConfig,
    ) {
        let name = name.into();
        self.pool.register_agent(name.clone(), pool_config);
        self.fix_agents.insert(name, agent);
    }

    /// Subscribe to `tests.failed`; the handler only forwards into the
    /// manager's channel and never does I/O on the publisher's stack
    pub fn attach(&self) -> Subscription {
        let tx = self.tx.clone();
        self.bus.subscribe(
            topics::TESTS_FAILED,
            "loop-manager",
            Arc::new(move |event| {
                let source = event
                    .data_str("source")
                    .ok_or_else(|| {
                        CadreError::Configuration("tests.failed event missing source".to_string())
                    })?
                    .to_string();
                let failures: Vec<TestFailure> = match event.data.get("failures") {
                    Some(value) => serde_json::from_value(value.clone())?,
                    None => Vec::new(),
                };
                tx.send(LoopTrigger { source, failures })
                    .map_err(|_| CadreError::Other("loop manager channel closed".to_string()))
            }),
        )
    }

    /// Snapshot of currently active cycles
    pub fn active_cycles(&self) -> Vec<LoopCycle> {
        self.cycles
            .lock()
            .expect("cycles lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Run the manager until the hosting task is shut down
    pub async fn run(&self) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .expect("rx lock poisoned")
            .take()
            .ok_or_else(|| {
                CadreError::Configuration("loop manager is already running".to_string())
            })?;

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_trigger = rx.recv() => {
                    match maybe_trigger {
                        Some(trigger) => self.handle_trigger(trigger),
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    self.advance_due_cycles().await;
                }
            }
        }

        Ok(())
    }

    /// Start a cycle for a new source, or coalesce into the running one
    fn handle_trigger(&self, trigger: LoopTrigger) {
        // Events go out after the lock is released: dispatch is synchronous
        // and a subscriber may call back into the manager
        {
            let mut cycles = self.cycles.lock().expect("cycles lock poisoned");

            if let Some(cycle) = cycles.get_mut(&trigger.source) {
                let before = cycle.failures.len();
                merge_failures(&mut cycle.failures, trigger.failures);
                debug!(
                    "Coalesced tests.failed for {} into running cycle {} ({} -> {} failures)",
                    trigger.source,
                    cycle.loop_id,
                    before,
                    cycle.failures.len()
                );
                return;
            }

            let cycle = LoopCycle {
                loop_id: Uuid::new_v4(),
                source: trigger.source.clone(),
                iteration: 0,
                max_iterations: self.config.max_iterations,
                failures: trigger.failures,
                status: CycleStatus::Running,
                next_eligible_at: self.clock.now(),
                tiers_attempted: BTreeSet::new(),
            };

            info!(
                "Starting loop cycle {} for {} ({} failures, max {} iterations)",
                cycle.loop_id,
                cycle.source,
                cycle.failures.len(),
                cycle.max_iterations
            );
            cycles.insert(trigger.source.clone(), cycle);
        }

        self.publish(
            topics::LOOP_STARTED,
            payload(&[("source", json!(trigger.source))]),
        );
    }

    async fn advance_due_cycles(&self) {
        let now = self.clock.now();
        let due: Vec<String> = {
            let cycles = self.cycles.lock().expect("cycles lock poisoned");
            cycles
                .values()
                .filter(|c| c.status == CycleStatus::Running && c.next_eligible_at <= now)
                .map(|c| c.source.clone())
                .collect()
        };

        for source in due {
            self.run_iteration(&source).await;
        }
    }

    /// One fix/retest iteration for a source
    async fn run_iteration(&self, source: &str) {
        let (iteration, failures) = {
            let mut cycles = self.cycles.lock().expect("cycles lock poisoned");
            let Some(cycle) = cycles.get_mut(source) else {
                return;
            };
            cycle.iteration += 1;
            (cycle.iteration, cycle.failures.clone())
        };

        info!(
            "Loop iteration {} for {} ({} failures)",
            iteration,
            source,
            failures.len()
        );
        self.publish(
            topics::LOOP_ITERATION,
            payload(&[("source", json!(source)), ("iteration", json!(iteration))]),
        );

        // Tier 1: the pattern fixer takes every auto-fixable failure
        let mut tier2_pool: Vec<TestFailure> = Vec::new();
        let mut auto_fixable: Vec<TestFailure> = Vec::new();
        for failure in &failures {
            if failure.kind.auto_fixable() && self.config.tier1_agent.is_some() {
                auto_fixable.push(failure.clone());
            } else {
                tier2_pool.push(failure.clone());
            }
        }

        if !auto_fixable.is_empty() {
            if let Some(name) = self.config.tier1_agent.clone() {
                self.dispatch_fix(&name, source, &auto_fixable, 1).await;
            }
        }

        // Tier 2: remaining failures batched per mapped platform agent
        let mut unassigned: Vec<TestFailure> = Vec::new();
        let mut batches: BTreeMap<Platform, Vec<TestFailure>> = BTreeMap::new();
        for failure in tier2_pool {
            batches.entry(failure.platform).or_default().push(failure);
        }
        for (platform, batch) in batches {
            match self.config.platform_agents.get(&platform) {
                Some(name) => {
                    let name = name.clone();
                    self.dispatch_fix(&name, source, &batch, 2).await;
                }
                None => {
                    debug!(
                        "No fix agent mapped for platform {}; {} failure(s) need manual attention",
                        platform,
                        batch.len()
                    );
                    unassigned.extend(batch);
                }
            }
        }

        // Re-run and re-evaluate. A runner error leaves the previous
        // failure set in place rather than declaring victory.
        let remaining = match self.test_runner.run(source).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!("Test re-run for {} failed: {}; keeping failures", source, e);
                failures.clone()
            }
        };

        // Decide the cycle's fate under the lock; publish after releasing
        // it, since event dispatch is synchronous
        let terminal = {
            let mut cycles = self.cycles.lock().expect("cycles lock poisoned");
            let Some(cycle) = cycles.get_mut(source) else {
                return;
            };

            // Failures coalesced while this iteration ran stay in play
            let mut remaining = remaining;
            let seen_before: BTreeSet<&str> =
                failures.iter().map(|f| f.test_name.as_str()).collect();
            let coalesced: Vec<TestFailure> = cycle
                .failures
                .iter()
                .filter(|f| !seen_before.contains(f.test_name.as_str()))
                .cloned()
                .collect();
            merge_failures(&mut remaining, coalesced);

            if remaining.is_empty() {
                cycle.status = CycleStatus::Succeeded;
                info!(
                    "Loop cycle {} for {} succeeded after {} iteration(s)",
                    cycle.loop_id, source, cycle.iteration
                );
                cycles.remove(source)
            } else if cycle.iteration >= cycle.max_iterations {
                cycle.status = CycleStatus::Exhausted;
                cycle.failures = remaining;
                warn!(
                    "Loop cycle {} for {} exhausted after {} iterations ({} failures remain)",
                    cycle.loop_id,
                    source,
                    cycle.iteration,
                    cycle.failures.len()
                );
                cycles.remove(source)
            } else {
                cycle.failures = remaining;
                let backoff = backoff_for(
                    cycle.iteration,
                    self.config.backoff_base,
                    self.config.backoff_cap,
                );
                cycle.next_eligible_at = self.clock.now()
                    + Duration::from_std(backoff).unwrap_or_else(|_| Duration::seconds(60));
                debug!(
                    "Cycle {} retries at {} (backoff {:?})",
                    cycle.loop_id, cycle.next_eligible_at, backoff
                );
                None
            }
        };

        match terminal {
            Some(cycle) if cycle.status == CycleStatus::Succeeded => {
                self.publish(
                    topics::LOOP_SUCCEEDED,
                    payload(&[
                        ("source", json!(source)),
                        ("loop_id", json!(cycle.loop_id)),
                        ("iterations", json!(cycle.iteration)),
                    ]),
                );
            }
            Some(cycle) => {
                self.publish(
                    topics::LOOP_EXHAUSTED,
                    payload(&[
                        ("source", json!(source)),
                        ("loop_id", json!(cycle.loop_id)),
                        ("iterations", json!(cycle.iteration)),
                        ("remaining_failures", json!(cycle.failures)),
                        (
                            "tiers_attempted",
                            json!(cycle.tiers_attempted.iter().collect::<Vec<_>>()),
                        ),
                        ("unassigned", json!(unassigned)),
                    ]),
                );
            }
            None => {}
        }
    }

    /// Run one fix agent with its batch through the pool
    async fn dispatch_fix(&self, name: &str, source: &str, batch: &[TestFailure], tier: u8) {
        let Some(agent) = self.fix_agents.get(name).map(Arc::clone) else {
            warn!("Fix agent {} is configured but not registered", name);
            return;
        };

        {
            let mut cycles = self.cycles.lock().expect("cycles lock poisoned");
            if let Some(cycle) = cycles.get_mut(source) {
                cycle.tiers_attempted.insert(tier);
            }
        }

        let mut payload = Map::new();
        payload.insert("source".to_string(), json!(source));
        payload.insert("tier".to_string(), json!(tier));
        payload.insert("failures".to_string(), json!(batch));
        let ctx = AgentContext::new(&self.repo_root, self.cancel_tx.subscribe())
            .with_payload(payload);

        match self.pool.execute(name, agent.execute(&ctx)).await {
            Ok(_) => debug!("Fix agent {} handled {} failure(s)", name, batch.len()),
            Err(CadreError::Throttled { reason, .. }) => {
                // The failure batch survives to the next iteration
                warn!("Fix agent {} throttled ({}); deferring", name, reason);
            }
            Err(e) => warn!("Fix agent {} failed: {}", name, e),
        }
    }

    fn publish(&self, topic: &str, data: Map<String, Value>) {
        if let Err(e) = self.bus.publish(topic, data) {
            warn!("Failed to publish {}: {}", topic, e);
        }
    }
}

/// Merge new failures into an existing batch, deduplicating by test name
fn merge_failures(existing: &mut Vec<TestFailure>, incoming: Vec<TestFailure>) {
    for failure in incoming {
        if !existing.iter().any(|f| f.test_name == failure.test_name) {
            existing.push(failure);
        }
    }
}

fn payload(fields: &[(&str, Value)]) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentReport;
    use cadre_bus::EventFilter;
    use cadre_core::FailureKind;
    use cadre_pool::{AgentPoolConfig, SystemClock};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fix agent that records the batch sizes it was handed
    struct RecordingFixer {
        batches: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Agent for RecordingFixer {
        async fn execute(&self, ctx: &AgentContext) -> Result<AgentReport> {
            let count = ctx
                .payload
                .get("failures")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            self.batches.lock().unwrap().push(count);
            Ok(AgentReport::new("patched"))
        }
    }

    /// Test runner that never passes and counts invocations
    struct NeverPassing {
        invocations: Arc<AtomicUsize>,
        failure: TestFailure,
    }

    #[async_trait]
    impl TestRunner for NeverPassing {
        async fn run(&self, _source: &str) -> Result<Vec<TestFailure>> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(vec![self.failure.clone()])
        }
    }

    /// Test runner that replays a scripted sequence of results
    struct Sequenced {
        results: Mutex<VecDeque<Vec<TestFailure>>>,
    }

    #[async_trait]
    impl TestRunner for Sequenced {
        async fn run(&self, _source: &str) -> Result<Vec<TestFailure>> {
            Ok(self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }
    }

    fn fast_config() -> LoopManagerConfig {
        LoopManagerConfig::default()
            .with_tier1_agent("pattern-fixer")
            .with_platform_agent(Platform::Backend, "backend-fixer")
    }

    fn open_pool() -> AgentPoolConfig {
        AgentPoolConfig::default()
            .with_cooldown(Duration::zero())
            .with_rate_limit(1000)
            .with_burst_limit(1000)
    }

    fn backend_failure(test_name: &str, kind: FailureKind) -> TestFailure {
        TestFailure::new(test_name, "assertion failed", Platform::Backend, kind)
    }

    fn manager_with(
        config: LoopManagerConfig,
        bus: EventBus,
        runner: Arc<dyn TestRunner>,
        fixer_batches: &Arc<Mutex<Vec<usize>>>,
    ) -> AutonomousLoopManager {
        let pool = Arc::new(AgentPool::new(bus.clone(), Arc::new(SystemClock)));
        let mut manager =
            AutonomousLoopManager::new(config, bus, pool, runner, Arc::new(SystemClock), "/repo");

        manager.register_fix_agent(
            "pattern-fixer",
            Arc::new(RecordingFixer {
                batches: Arc::clone(fixer_batches),
            }),
            open_pool(),
        );
        manager.register_fix_agent(
            "backend-fixer",
            Arc::new(RecordingFixer {
                batches: Arc::new(Mutex::new(Vec::new())),
            }),
            open_pool(),
        );
        manager
    }

    fn tight_timing(mut config: LoopManagerConfig, max_iterations: u32) -> LoopManagerConfig {
        config.max_iterations = max_iterations;
        config.backoff_base = StdDuration::from_millis(1);
        config.backoff_cap = StdDuration::from_millis(4);
        config.tick = StdDuration::from_millis(10);
        config
    }

    async fn settle() {
        tokio::time::sleep(StdDuration::from_millis(600)).await;
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = StdDuration::from_secs(1);
        let cap = StdDuration::from_secs(60);
        assert_eq!(backoff_for(1, base, cap), StdDuration::from_secs(2));
        assert_eq!(backoff_for(2, base, cap), StdDuration::from_secs(4));
        assert_eq!(backoff_for(5, base, cap), StdDuration::from_secs(32));
        assert_eq!(backoff_for(6, base, cap), StdDuration::from_secs(60));
        assert_eq!(backoff_for(30, base, cap), StdDuration::from_secs(60));
    }

    #[test]
    fn test_merge_failures_dedupes_by_name() {
        let mut existing = vec![backend_failure("t1", FailureKind::Other)];
        merge_failures(
            &mut existing,
            vec![
                backend_failure("t1", FailureKind::Other),
                backend_failure("t2", FailureKind::ModuleNotFound),
            ],
        );
        assert_eq!(existing.len(), 2);
    }

    #[tokio::test]
    async fn test_loop_bound_never_passing_fixture() {
        let bus = EventBus::new();
        let invocations = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(NeverPassing {
            invocations: Arc::clone(&invocations),
            failure: backend_failure("t::stuck", FailureKind::ModuleNotFound),
        });

        let batches = Arc::new(Mutex::new(Vec::new()));
        let manager = Arc::new(manager_with(
            tight_timing(fast_config(), 3),
            bus.clone(),
            runner,
            &batches,
        ));

        let _sub = manager.attach();
        let runner_task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run().await })
        };

        bus.publish(
            topics::TESTS_FAILED,
            test_failure_payload(
                "backend-suite",
                &[backend_failure("t::stuck", FailureKind::ModuleNotFound)],
            ),
        )
        .unwrap();

        settle().await;
        runner_task.abort();

        // Exactly max_iterations attempts, then exhausted - never looping on
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        let exhausted = bus.history(Some(&EventFilter::new().with_type(topics::LOOP_EXHAUSTED)));
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].data["iterations"], json!(3));
        assert!(bus
            .history(Some(&EventFilter::new().with_type(topics::LOOP_SUCCEEDED)))
            .is_empty());
        assert!(manager.active_cycles().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_succeeds_when_failures_clear() {
        let bus = EventBus::new();
        let runner = Arc::new(Sequenced {
            results: Mutex::new(VecDeque::from([
                vec![backend_failure("t::flaky", FailureKind::Other)],
                Vec::new(),
            ])),
        });

        let batches = Arc::new(Mutex::new(Vec::new()));
        let manager = Arc::new(manager_with(
            tight_timing(fast_config(), 5),
            bus.clone(),
            runner,
            &batches,
        ));

        let _sub = manager.attach();
        let runner_task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run().await })
        };

        bus.publish(
            topics::TESTS_FAILED,
            test_failure_payload(
                "backend-suite",
                &[backend_failure("t::flaky", FailureKind::Other)],
            ),
        )
        .unwrap();

        settle().await;
        runner_task.abort();

        let succeeded = bus.history(Some(&EventFilter::new().with_type(topics::LOOP_SUCCEEDED)));
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].data["iterations"], json!(2));
        assert!(bus
            .history(Some(&EventFilter::new().with_type(topics::LOOP_EXHAUSTED)))
            .is_empty());
        assert!(manager.active_cycles().is_empty());
    }

    #[tokio::test]
    async fn test_second_failure_event_coalesces() {
        let bus = EventBus::new();
        let invocations = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(NeverPassing {
            invocations: Arc::clone(&invocations),
            failure: backend_failure("t::one", FailureKind::Other),
        });

        let batches = Arc::new(Mutex::new(Vec::new()));
        let manager = Arc::new(manager_with(
            tight_timing(fast_config(), 2),
            bus.clone(),
            runner,
            &batches,
        ));

        let _sub = manager.attach();
        let runner_task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run().await })
        };

        bus.publish(
            topics::TESTS_FAILED,
            test_failure_payload(
                "backend-suite",
                &[backend_failure("t::one", FailureKind::Other)],
            ),
        )
        .unwrap();
        bus.publish(
            topics::TESTS_FAILED,
            test_failure_payload(
                "backend-suite",
                &[backend_failure("t::two", FailureKind::Other)],
            ),
        )
        .unwrap();

        settle().await;
        runner_task.abort();

        // One cycle, not two
        let started = bus.history(Some(&EventFilter::new().with_type(topics::LOOP_STARTED)));
        assert_eq!(started.len(), 1);
        let exhausted = bus.history(Some(&EventFilter::new().with_type(topics::LOOP_EXHAUSTED)));
        assert_eq!(exhausted.len(), 1);
    }

    #[tokio::test]
    async fn test_tier_dispatch_batches() {
        let bus = EventBus::new();
        let pool = Arc::new(AgentPool::new(bus.clone(), Arc::new(SystemClock)));
        let runner = Arc::new(NeverPassing {
            invocations: Arc::new(AtomicUsize::new(0)),
            failure: backend_failure("t::any", FailureKind::Other),
        });

        let tier1_batches = Arc::new(Mutex::new(Vec::new()));
        let tier2_batches = Arc::new(Mutex::new(Vec::new()));

        let mut manager = AutonomousLoopManager::new(
            tight_timing(fast_config(), 1),
            bus.clone(),
            pool,
            runner,
            Arc::new(SystemClock),
            "/repo",
        );
        manager.register_fix_agent(
            "pattern-fixer",
            Arc::new(RecordingFixer {
                batches: Arc::clone(&tier1_batches),
            }),
            open_pool(),
        );
        manager.register_fix_agent(
            "backend-fixer",
            Arc::new(RecordingFixer {
                batches: Arc::clone(&tier2_batches),
            }),
            open_pool(),
        );

        let manager = Arc::new(manager);
        let _sub = manager.attach();
        let runner_task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run().await })
        };

        // Two auto-fixable failures for tier 1, one backend failure for
        // tier 2, one frontend failure with no mapped agent
        bus.publish(
            topics::TESTS_FAILED,
            test_failure_payload(
                "mixed-suite",
                &[
                    backend_failure("t::missing_mod", FailureKind::ModuleNotFound),
                    backend_failure("t::bad_symbol", FailureKind::UndefinedSymbol),
                    backend_failure("t::logic", FailureKind::Other),
                    TestFailure::new(
                        "t::render",
                        "undefined is not a function",
                        Platform::Frontend,
                        FailureKind::Other,
                    ),
                ],
            ),
        )
        .unwrap();

        settle().await;
        runner_task.abort();

        assert_eq!(*tier1_batches.lock().unwrap(), vec![2]);
        assert_eq!(*tier2_batches.lock().unwrap(), vec![1]);

        // The unmapped frontend failure lands in the exhausted diagnostics
        let exhausted = bus.history(Some(&EventFilter::new().with_type(topics::LOOP_EXHAUSTED)));
        assert_eq!(exhausted.len(), 1);
        let unassigned = exhausted[0].data["unassigned"].as_array().unwrap();
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0]["test_name"], json!("t::render"));
        assert_eq!(exhausted[0].data["tiers_attempted"], json!([1, 2]));
    }
}
