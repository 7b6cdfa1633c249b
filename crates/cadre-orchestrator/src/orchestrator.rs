//! Core orchestrator implementation
//!
//! Builds execution plans from the dependency graph and runs them level by
//! level through the agent pool. Each level executes under a sliding-window
//! concurrency bound: as one agent finishes, the next queued agent starts,
//! so a fast agent never waits on a slow sibling for a slot. A checkpoint
//! protects the whole run; any failure stops the next level, rolls back, and
//! surfaces the full per-agent outcome map.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cadre_bus::{topics, EventBus};
use cadre_core::{AgentOutcome, AgentRunStatus, CadreError, Result, RunState};
use cadre_graph::DependencyGraph;
use cadre_pool::{AgentPool, AgentPoolConfig};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentContext, AgentLoader};
use crate::checkpoint::CheckpointStore;
use crate::plan::ExecutionPlan;
use crate::vcs::{GitCommand, VcsExecutor};

/// Configuration for an orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Repository root path
    pub repo_root: std::path::PathBuf,
    /// Maximum agents running concurrently within a level
    pub max_concurrency: usize,
    /// Whether a failed run restores the checkpoint state
    pub rollback_enabled: bool,
    /// Directory for checkpoint records
    pub checkpoint_dir: std::path::PathBuf,
}

impl OrchestratorConfig {
    pub fn new(repo_root: impl Into<std::path::PathBuf>) -> Self {
        let repo_root = repo_root.into();
        Self {
            checkpoint_dir: repo_root.join(".cadre/checkpoints"),
            repo_root,
            max_concurrency: 5,
            rollback_enabled: true,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.rollback_enabled = enabled;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }
}

/// Non-blocking view of the latest run
#[derive(Debug, Clone)]
pub struct RunStatusSnapshot {
    pub state: RunState,
    pub outcomes: BTreeMap<String, AgentOutcome>,
}

/// The main orchestrator struct
pub struct Orchestrator<E: VcsExecutor> {
    config: OrchestratorConfig,
    graph: DependencyGraph,
    loaders: HashMap<String, AgentLoader>,
    pool: Arc<AgentPool>,
    bus: EventBus,
    checkpoints: CheckpointStore<E>,
    status: Arc<Mutex<RunStatusSnapshot>>,
    stop_tx: watch::Sender<bool>,
}

impl Orchestrator<GitCommand> {
    /// Create an orchestrator backed by the git CLI
    pub fn new(config: OrchestratorConfig, bus: EventBus, pool: Arc<AgentPool>) -> Self {
        let executor = GitCommand::new(&config.repo_root);
        Self::with_executor(config, executor, bus, pool)
    }
}

impl<E: VcsExecutor> Orchestrator<E> {
    /// Create an orchestrator with a custom VCS executor
    pub fn with_executor(
        config: OrchestratorConfig,
        executor: E,
        bus: EventBus,
        pool: Arc<AgentPool>,
    ) -> Self {
        let checkpoints = CheckpointStore::new(executor, &config.checkpoint_dir);
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            graph: DependencyGraph::new(),
            loaders: HashMap::new(),
            pool,
            bus,
            checkpoints,
            status: Arc::new(Mutex::new(RunStatusSnapshot {
                state: RunState::Idle,
                outcomes: BTreeMap::new(),
            })),
            stop_tx,
        }
    }

    /// Register an agent: its loader, dependencies, file patterns, and pool
    /// safety configuration
    pub fn register_agent(
        &mut self,
        name: impl Into<String>,
        dependencies: &[&str],
        file_patterns: &[&str],
        loader: AgentLoader,
        pool_config: AgentPoolConfig,
    ) -> Result<()> {
        let name = name.into();
        self.graph
            .add_agent(name.clone(), dependencies, file_patterns, false)?;
        self.pool.register_agent(name.clone(), pool_config);
        self.loaders.insert(name, loader);
        Ok(())
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn checkpoints(&self) -> &CheckpointStore<E> {
        &self.checkpoints
    }

    /// Build a plan covering all agents, or only those affected by the
    /// change set when one is given
    pub fn build_execution_plan(&self, changed_files: &[String]) -> Result<ExecutionPlan> {
        self.set_state(RunState::Planning);

        // Validates acyclicity and unknown dependencies before any grouping
        self.graph.build_execution_order()?;
        let mut groups = self.graph.parallel_groups()?;

        if !changed_files.is_empty() {
            let affected = self.graph.affected_agents(changed_files);
            for group in &mut groups {
                group.retain(|name| affected.contains(name));
            }
            groups.retain(|group| !group.is_empty());
        }

        let plan =
            ExecutionPlan::from_groups(groups).with_changed_files(changed_files.to_vec());
        info!(
            "Execution plan: {} agents in {} levels",
            plan.total_agents,
            plan.groups.len()
        );
        Ok(plan)
    }

    /// Execute a plan level by level
    ///
    /// Creates a checkpoint before the first level and reuses it for the
    /// rest of the run. On full success the checkpoint is committed; if any
    /// agent fails, no later level starts, the checkpoint is rolled back
    /// (when enabled), and the error carries every per-agent outcome so
    /// successes remain visible for diagnostics.
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<BTreeMap<String, AgentOutcome>> {
        // Reset any stop request from a previous run
        let _ = self.stop_tx.send(false);

        {
            let mut status = self.status.lock().expect("status lock poisoned");
            status.outcomes.clear();
        }

        self.publish(
            topics::RUN_STARTED,
            json_map(&[("total_agents", json!(plan.total_agents))]),
        );

        let mut checkpoint = self.checkpoints.create("orchestrated run").await?;
        self.publish(
            topics::CHECKPOINT_CREATED,
            json_map(&[("checkpoint_id", json!(checkpoint.id))]),
        );

        let mut outcomes: BTreeMap<String, AgentOutcome> = BTreeMap::new();
        let mut instances: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let mut halted = false;

        for (level, group) in plan.groups.iter().enumerate() {
            if halted || self.is_stopped() {
                for name in group {
                    self.record_outcome(&mut outcomes, AgentOutcome::unattempted(name.clone()));
                }
                continue;
            }

            self.set_state(RunState::Executing { level });
            debug!("Executing level {} ({} agents)", level, group.len());
            self.run_level(plan, group, &mut instances, &mut outcomes)
                .await;

            halted = outcomes
                .values()
                .any(|o| o.status != AgentRunStatus::Succeeded);
        }

        let failed = outcomes
            .values()
            .any(|o| o.status != AgentRunStatus::Succeeded);

        if failed {
            if self.config.rollback_enabled {
                if let Err(e) = self.checkpoints.roll_back(&mut checkpoint).await {
                    warn!("Rollback of checkpoint {} failed: {}", checkpoint.id, e);
                }
            } else {
                info!(
                    "Rollback disabled; checkpoint {} left active for inspection",
                    checkpoint.id
                );
            }
            self.set_state(RunState::RolledBack);
            self.publish(
                topics::RUN_ROLLED_BACK,
                json_map(&[("checkpoint_id", json!(checkpoint.id))]),
            );
            return Err(CadreError::OrchestrationFailed { outcomes });
        }

        self.checkpoints.commit(&mut checkpoint).await?;
        self.set_state(RunState::Committed);
        self.publish(
            topics::RUN_COMMITTED,
            json_map(&[("checkpoint_id", json!(checkpoint.id))]),
        );
        Ok(outcomes)
    }

    /// Run one level under the sliding-window concurrency bound
    async fn run_level(
        &self,
        plan: &ExecutionPlan,
        group: &[String],
        instances: &mut HashMap<String, Arc<dyn Agent>>,
        outcomes: &mut BTreeMap<String, AgentOutcome>,
    ) {
        let mut queue = group.iter();
        let mut join_set: JoinSet<(String, Result<()>, u64)> = JoinSet::new();
        let mut in_flight = 0usize;

        loop {
            // Fill free slots; a stop request prevents new starts only
            while in_flight < self.config.max_concurrency && !self.is_stopped() {
                let Some(name) = queue.next() else { break };

                match self.instance(name, instances) {
                    Ok(agent) => {
                        let pool = Arc::clone(&self.pool);
                        let ctx = AgentContext::new(&self.config.repo_root, self.stop_tx.subscribe())
                            .with_changed_files(plan.changed_files.clone());
                        let name = name.clone();

                        join_set.spawn(async move {
                            let started = Instant::now();
                            let result = pool
                                .execute(&name, async { agent.execute(&ctx).await })
                                .await
                                .map(|_report| ());
                            (name, result, started.elapsed().as_millis() as u64)
                        });
                        in_flight += 1;
                    }
                    Err(e) => {
                        warn!("Loader for {} failed: {}", name, e);
                        self.record_outcome(
                            outcomes,
                            AgentOutcome::failed(name.clone(), e.to_string(), 0),
                        );
                    }
                }
            }

            if in_flight == 0 {
                break;
            }

            match join_set.join_next().await {
                Some(Ok((name, result, duration_ms))) => {
                    in_flight -= 1;
                    let outcome = match result {
                        Ok(()) => AgentOutcome::succeeded(name, duration_ms),
                        Err(e) => AgentOutcome::failed(name, e.to_string(), duration_ms),
                    };
                    self.record_outcome(outcomes, outcome);
                }
                Some(Err(join_err)) => {
                    in_flight -= 1;
                    warn!("Agent task aborted: {}", join_err);
                }
                None => break,
            }
        }

        // Anything still queued was skipped by a stop request
        for name in queue {
            self.record_outcome(outcomes, AgentOutcome::unattempted(name.clone()));
        }
    }

    /// Loaders are memoized per run, not globally: repeated runs
    /// re-instantiate fresh agent instances
    fn instance(
        &self,
        name: &str,
        instances: &mut HashMap<String, Arc<dyn Agent>>,
    ) -> Result<Arc<dyn Agent>> {
        if let Some(agent) = instances.get(name) {
            return Ok(Arc::clone(agent));
        }
        let loader = self
            .loaders
            .get(name)
            .ok_or_else(|| CadreError::Configuration(format!("no loader for agent {}", name)))?;
        let agent = loader()?;
        instances.insert(name.to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    /// Latest per-agent outcomes and run state, without blocking on the run
    pub fn status(&self) -> RunStatusSnapshot {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Best-effort cooperative cancellation: in-flight agents finish their
    /// current work; nothing new starts and the run concludes as a failure
    pub fn stop(&self) {
        info!("Stop requested");
        let _ = self.stop_tx.send(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn set_state(&self, state: RunState) {
        self.status.lock().expect("status lock poisoned").state = state;
    }

    fn record_outcome(&self, outcomes: &mut BTreeMap<String, AgentOutcome>, outcome: AgentOutcome) {
        let mut status = self.status.lock().expect("status lock poisoned");
        status
            .outcomes
            .insert(outcome.agent.clone(), outcome.clone());
        outcomes.insert(outcome.agent.clone(), outcome);
    }

    fn publish(&self, topic: &str, data: Map<String, Value>) {
        if let Err(e) = self.bus.publish(topic, data) {
            warn!("Failed to publish {}: {}", topic, e);
        }
    }
}

fn json_map(fields: &[(&str, Value)]) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
