//! # cadre-orchestrator
//!
//! Turns a dependency graph and an optional change set into a concrete,
//! safely executed run.
//!
//! This crate provides:
//! - The typed agent contract and lazy loaders
//! - Execution-plan building over the dependency graph
//! - A concurrency-bounded, checkpointed level executor with rollback
//! - The autonomous loop manager closing the loop between test failure
//!   and automatic remediation

mod agent;
mod checkpoint;
mod loop_manager;
mod orchestrator;
mod plan;
mod vcs;

pub use agent::{Agent, AgentContext, AgentLoader, AgentReport};
pub use checkpoint::{CapturedState, Checkpoint, CheckpointStatus, CheckpointStore};
pub use loop_manager::{
    test_failure_payload, AutonomousLoopManager, CycleStatus, LoopCycle, LoopManagerConfig,
    TestRunner,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunStatusSnapshot};
pub use plan::ExecutionPlan;
pub use vcs::{GitCommand, MockVcsExecutor, VcsExecutor, VcsOutput};
