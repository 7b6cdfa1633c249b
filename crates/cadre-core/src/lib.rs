//! # cadre-core
//!
//! Core types for the Cadre orchestration system.
//!
//! Cadre coordinates fleets of code-automation agents over a multi-platform
//! codebase. The interesting machinery lives in the sibling crates (bus,
//! graph, pool, orchestrator); this crate carries the vocabulary they share:
//!
//! - The unified error taxonomy (`CadreError`)
//! - Agent outcome and run-state types
//! - Test-failure classification used by the autonomous loop
//! - Repository configuration (`.cadre/config.toml`)
//! - The run-history store consumed by test prioritization heuristics

mod config;
mod error;
mod history;
mod types;

pub use config::{
    AgentManifestEntry, CadreConfig, LoopDefaults, OrchestratorDefaults, PoolDefaults,
};
pub use error::{CadreError, Result};
pub use history::{RunHistory, TestRecord};
pub use types::*;
