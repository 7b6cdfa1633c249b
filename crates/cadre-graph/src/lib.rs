//! # cadre-graph
//!
//! Dependency graph over registered agents.
//!
//! Pure data structure with no I/O: validates execution ordering
//! (topological sort with cycle detection), computes parallel levels, and
//! maps changed files to the transitive set of affected agents. The graph is
//! rebuilt wholesale on registration changes; callers must not mutate it
//! while an execution plan derived from it is in flight.

mod graph;

pub use graph::{AgentNode, DependencyGraph};
